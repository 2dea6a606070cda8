//! The dispatcher pipelet.
//!
//! Control operations are not handled in `listen`: they are deferred so that
//! branch wiring runs with the graph at hand, one control operation at a time
//! and in arrival order.

use std::any::Any;

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::{debug, error, warn};

use pipelet_core::config::GraphConfig;
use pipelet_core::id::{FetchTicket, NodeId};
use pipelet_core::operation::{Change, Operation};
use pipelet_core::value::{Identity, Key, Value};
use pipelet_operators::filter::Filter;
use pipelet_operators::passthrough::Passthrough;
use pipelet_operators::union::Union;
use pipelet_operators::{Chunk, Ctx, Demand, FetchPlan, Graph, Pipelet, Registry};
use pipelet_query::Query;

use crate::builder::{Branch, BranchBuilder};
use crate::error::{DispatchError, Result};
use crate::template::{BranchNode, TemplateBuilder};
use crate::view::ForkedView;

/// A node given either by id or by name (resolved when first needed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRef {
    Id(NodeId),
    Name(String),
}

impl NodeRef {
    pub fn resolve(&self, graph: &Graph) -> Result<NodeId> {
        match self {
            NodeRef::Id(id) if graph.contains(*id) => Ok(*id),
            NodeRef::Id(id) => Err(DispatchError::UnknownNode(id.to_string())),
            NodeRef::Name(name) => graph
                .node_id(name)
                .ok_or_else(|| DispatchError::UnknownNode(name.clone())),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatcherOptions {
    /// Shared upstream every branch views.
    pub source: String,
    /// Where branch outputs are gathered.
    #[serde(default)]
    pub gatherer: Option<String>,
    /// Feed branch outputs back into the source.
    #[serde(default, rename = "loop")]
    pub loop_back: bool,
    /// Fork tag stamped on transactions entering a branch; the gatherer
    /// rejoins on it.
    #[serde(default)]
    pub tag: Option<String>,
    /// Identity of control values; defaults to the graph key.
    #[serde(default)]
    pub key: Option<Vec<String>>,
    #[serde(default)]
    pub branch: Vec<BranchNode>,
    #[serde(default)]
    pub output: Option<String>,
}

struct BranchState {
    view: NodeId,
    branch: Branch,
}

pub struct Dispatcher {
    source: NodeRef,
    gatherer: Option<NodeRef>,
    loop_back: bool,
    tag: Option<String>,
    key: Key,
    builder: Box<dyn BranchBuilder>,
    branches: IndexMap<Identity, BranchState>,
    next_branch: u64,
    failures: usize,
}

impl Dispatcher {
    pub fn new(source: NodeRef, key: Key, builder: Box<dyn BranchBuilder>) -> Self {
        Self {
            source,
            gatherer: None,
            loop_back: false,
            tag: None,
            key,
            builder,
            branches: IndexMap::new(),
            next_branch: 0,
            failures: 0,
        }
    }

    pub fn gather_into(mut self, gatherer: NodeRef) -> Self {
        self.gatherer = Some(gatherer);
        self
    }

    /// Loop mode: branch outputs feed the source.
    pub fn looping(mut self) -> Self {
        self.loop_back = true;
        self
    }

    /// Stamp `tag` on every transaction entering a branch and make the
    /// gatherer join on it.
    pub fn fork_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn from_options(opts: DispatcherOptions, registry: Registry, config: &GraphConfig) -> Self {
        let key = opts.key.map(Key::new).unwrap_or_else(|| config.key());
        let builder = TemplateBuilder::new(registry, config.clone(), opts.branch, opts.output);
        let mut d = Self::new(NodeRef::Name(opts.source), key, Box::new(builder));
        d.gatherer = opts.gatherer.map(NodeRef::Name);
        d.loop_back = opts.loop_back;
        d.tag = opts.tag;
        d
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    /// Output node of the branch built for `control`.
    pub fn branch_output(&self, control: &Value) -> Option<NodeId> {
        self.branches.get(&self.key.identity(control)).map(|b| b.branch.output)
    }

    /// Control values whose branch could not be built.
    pub fn failures(&self) -> usize {
        self.failures
    }

    fn add_branch(&mut self, graph: &mut Graph, me: NodeId, control: &Value) {
        let identity = self.key.identity(control);
        if self.branches.contains_key(&identity) {
            warn!(node = %me, identity = %identity, "branch already exists, control add ignored");
            return;
        }
        let prefix = format!(
            "{}/{}",
            graph.node_name(me).unwrap_or("dispatch"),
            self.next_branch
        );
        self.next_branch += 1;
        match self.build_branch(graph, control, &prefix) {
            Ok(state) => {
                debug!(node = %me, identity = %identity, output = %state.branch.output, "branch built");
                self.branches.insert(identity, state);
            }
            Err(e) => {
                self.failures += 1;
                error!(node = %me, identity = %identity, error = %e, "branch build failed, skipped");
                let scope = format!("{}/", prefix);
                let leftovers: Vec<NodeId> = graph
                    .node_ids()
                    .into_iter()
                    .filter(|id| graph.node_name(*id).is_some_and(|n| n.starts_with(&scope)))
                    .collect();
                for id in leftovers.into_iter().rev() {
                    if let Err(e) = graph.remove_node(id) {
                        warn!(node = %id, error = %e, "cleanup of a failed branch");
                    }
                }
            }
        }
    }

    fn build_branch(&mut self, graph: &mut Graph, control: &Value, prefix: &str) -> Result<BranchState> {
        let source = self.source.resolve(graph)?;
        let gatherer = self.gatherer.as_ref().map(|g| g.resolve(graph)).transpose()?;
        let view: Box<dyn Pipelet> = match control.get("query") {
            Some(q) => Box::new(Filter::with_companion(&Query::from_json(q.clone())?, control)?),
            None => Box::new(Passthrough),
        };
        let view: Box<dyn Pipelet> = match &self.tag {
            Some(tag) => Box::new(ForkedView::new(view, tag.as_str())),
            None => view,
        };
        let view = graph.add_node(format!("{}/view", prefix), view)?;
        graph.connect(source, view)?;
        let branch = self.builder.build(graph, view, control, prefix)?;
        if let Some(g) = gatherer {
            if let Some(tag) = &self.tag {
                join_gatherer(graph, g, tag);
            }
            graph.connect(branch.output, g)?;
        }
        if self.loop_back {
            graph.connect(branch.output, source)?;
        }
        Ok(BranchState { view, branch })
    }

    fn remove_branch(&mut self, graph: &mut Graph, me: NodeId, control: &Value) {
        let identity = self.key.identity(control);
        let Some(state) = self.branches.shift_remove(&identity) else {
            warn!(node = %me, identity = %identity, "no branch for control remove");
            return;
        };
        teardown(graph, state);
        debug!(node = %me, identity = %identity, "branch torn down");
    }
}

/// Make a `union` gatherer join on `tag`. Any other gatherer is left alone.
fn join_gatherer(graph: &mut Graph, gatherer: NodeId, tag: &str) {
    let key = graph.config().key();
    let timeout = graph.config().tx_timeout();
    let Some(union) = graph.get_mut::<Union>(gatherer) else {
        warn!(node = %gatherer, tag, "gatherer is not a union, branches are not rejoined");
        return;
    };
    if !union.join_on(tag, key, timeout) {
        warn!(node = %gatherer, tag, "gatherer already joins on another tag");
    }
}

fn teardown(graph: &mut Graph, state: BranchState) {
    for id in state.branch.nodes.into_iter().rev().chain([state.view]) {
        if !graph.contains(id) {
            continue;
        }
        if let Err(e) = graph.remove_node(id) {
            warn!(node = %id, error = %e, "branch node removal failed");
        }
    }
}

impl Pipelet for Dispatcher {
    fn name(&self) -> &str {
        "dispatch"
    }

    fn demand(&self) -> Demand {
        Demand::Greedy(Query::everything())
    }

    fn listen(&mut self, op: Operation, ctx: &mut Ctx<'_>) -> pipelet_operators::Result<Vec<Operation>> {
        if !op.is_empty() {
            ctx.defer(op);
        }
        Ok(Vec::new())
    }

    fn fetch_plan(&mut self, _query: &Query, _ticket: FetchTicket) -> FetchPlan {
        FetchPlan::Serve(Vec::new())
    }

    fn fetch_on_connect(&self) -> bool {
        true
    }

    fn receive_fetched(&mut self, chunk: Chunk, ctx: &mut Ctx<'_>) -> pipelet_operators::Result<Vec<Operation>> {
        if !chunk.values.is_empty() {
            ctx.defer(Operation::add(chunk.values));
        }
        Ok(Vec::new())
    }

    fn on_deferred(&mut self, graph: &mut Graph, me: NodeId, op: Operation) -> pipelet_operators::Result<()> {
        match op.change {
            Change::Add { values } => {
                for v in &values {
                    self.add_branch(graph, me, v);
                }
            }
            Change::Remove { values } => {
                for v in &values {
                    self.remove_branch(graph, me, v);
                }
            }
            Change::Update { values } => {
                for (old, new) in &values {
                    if old == new {
                        continue;
                    }
                    self.remove_branch(graph, me, old);
                    self.add_branch(graph, me, new);
                }
            }
            Change::Clear => {
                debug!(node = %me, branches = self.branches.len(), "clearing all branches");
                for (_, state) in std::mem::take(&mut self.branches) {
                    teardown(graph, state);
                }
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
