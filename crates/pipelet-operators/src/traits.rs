//! Pipelet trait + common interfaces.
//!
//! The graph calls `listen` for every pushed operation, `fetch_plan` when a
//! fetch reaches the node, and consults `demand`/`upstream_query` whenever the
//! queries of its outputs change.

use std::any::Any;
use std::time::Instant;

use thiserror::Error;

use pipelet_core::config::GraphConfig;
use pipelet_core::id::{FetchTicket, NodeId};
use pipelet_core::operation::Operation;
use pipelet_core::value::Value;
use pipelet_query::{Query, QueryChanges, QueryError};

use crate::graph::Graph;

pub type Result<T> = std::result::Result<T, OpError>;

#[derive(Debug, Error)]
pub enum OpError {
    #[error("unknown pipelet '{0}'")]
    UnknownPipelet(String),

    #[error("invalid options for '{pipelet}': {reason}")]
    Options { pipelet: String, reason: String },

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("node {0} is busy")]
    Busy(NodeId),

    #[error("graph error: {0}")]
    Graph(String),

    #[error("propagation exceeded {0} steps")]
    StepLimit(usize),

    #[error("fetch {0} has not completed")]
    FetchPending(FetchTicket),

    #[error("query: {0}")]
    Query(#[from] QueryError),

    #[error("core: {0}")]
    Core(#[from] pipelet_core::Error),
}

impl OpError {
    pub fn options(pipelet: &str, reason: impl ToString) -> Self {
        OpError::Options {
            pipelet: pipelet.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// How a pipelet subscribes upstream.
#[derive(Debug, Clone, PartialEq)]
pub enum Demand {
    /// Subscribes to whatever its outputs ask for (see [`Pipelet::upstream_query`]).
    Lazy,
    /// Always subscribes to this query, regardless of downstream demand.
    Greedy(Query),
}

/// Answer of a pipelet to a fetch reaching it.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchPlan {
    /// Values this pipelet holds; the graph filters and chunks them.
    Serve(Vec<Value>),
    /// Fetch this query from every input and pass chunks through `transform_fetched`.
    Upstream(Query),
    /// Chunks arrive later through [`Graph::resolve_fetch`] with the given ticket.
    Deferred,
}

/// A fetched chunk handed to a requesting pipelet.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub values: Vec<Value>,
    pub no_more: bool,
}

/// Per-call context.
pub struct Ctx<'a> {
    pub node: NodeId,
    /// Input that delivered the operation, if any.
    pub source: Option<NodeId>,
    pub inputs: &'a [NodeId],
    pub config: &'a GraphConfig,
    pub now: Instant,
    deferred: Vec<Operation>,
}

impl<'a> Ctx<'a> {
    pub(crate) fn new(
        node: NodeId,
        source: Option<NodeId>,
        inputs: &'a [NodeId],
        config: &'a GraphConfig,
        now: Instant,
    ) -> Self {
        Self {
            node,
            source,
            inputs,
            config,
            now,
            deferred: Vec::new(),
        }
    }

    /// Queue `op` for [`Pipelet::on_deferred`], which may rewire the graph.
    /// Deferred operations run in the order they were queued.
    pub fn defer(&mut self, op: Operation) {
        self.deferred.push(op);
    }

    pub(crate) fn take_deferred(&mut self) -> Vec<Operation> {
        std::mem::take(&mut self.deferred)
    }
}

/// Trait that all pipelets implement.
///
/// Invariants:
/// - `listen` returns the operations to emit downstream, in order; it never
///   emits to a specific destination, the graph routes by query.
/// - Empty operations are only forwarded when they close a transaction.
/// - A pipelet never touches another pipelet's state directly.
pub trait Pipelet: Any + Send {
    /// Stable pipelet name, as registered.
    fn name(&self) -> &str;

    fn demand(&self) -> Demand {
        Demand::Lazy
    }

    /// Query to request upstream given the union of downstream demand.
    /// Only consulted for lazy pipelets.
    fn upstream_query(&self, downstream: &Query) -> Query {
        downstream.clone()
    }

    /// Push notification from an input.
    fn listen(&mut self, op: Operation, ctx: &mut Ctx<'_>) -> Result<Vec<Operation>>;

    fn fetch_plan(&mut self, query: &Query, _ticket: FetchTicket) -> FetchPlan {
        FetchPlan::Upstream(query.clone())
    }

    /// Map values fetched from the inputs into this pipelet's output.
    fn transform_fetched(&self, values: Vec<Value>) -> Vec<Value> {
        values
    }

    /// Chunk of a fetch this pipelet requested; returns operations to emit.
    fn receive_fetched(&mut self, _chunk: Chunk, _ctx: &mut Ctx<'_>) -> Result<Vec<Operation>> {
        Ok(Vec::new())
    }

    /// Fetch from a newly connected input right away.
    fn fetch_on_connect(&self) -> bool {
        false
    }

    /// `input` was disconnected; returns operations to emit (e.g. a join
    /// that no longer waits on that branch).
    fn input_disconnected(&mut self, _input: NodeId) -> Vec<Operation> {
        Vec::new()
    }

    /// Called before the graph refetches all inputs for a resynchronization.
    fn begin_resync(&mut self) {}

    /// Union of the queries of this pipelet's outputs changed by `net`.
    fn downstream_changed(&mut self, _demand: &Query, _net: &QueryChanges) {}

    /// Timer hook.
    fn tick(&mut self, _ctx: &mut Ctx<'_>) -> Vec<Operation> {
        Vec::new()
    }

    /// Run a deferred operation with full access to the graph. The pipelet is
    /// detached from its node while this runs.
    fn on_deferred(&mut self, _graph: &mut Graph, _me: NodeId, _op: Operation) -> Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Split of one operation into several changes: all but the last keep the
/// transaction open. When nothing is left of a closing operation, an empty
/// add still carries the close.
pub fn stamp_split(op: &Operation, changes: Vec<pipelet_core::Change>) -> Vec<Operation> {
    if changes.is_empty() {
        return if op.closes_tx() {
            vec![op.derive(pipelet_core::Change::Add { values: Vec::new() })]
        } else {
            Vec::new()
        };
    }
    let n = changes.len();
    changes
        .into_iter()
        .enumerate()
        .map(|(i, change)| {
            let mut out = op.derive(change);
            if i + 1 < n {
                if let Some(t) = out.options.transaction.as_mut() {
                    t.more = true;
                }
            }
            out
        })
        .collect()
}
