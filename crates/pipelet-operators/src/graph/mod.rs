//! The dataflow graph: an arena of pipelets, their edges and the queries on
//! those edges.
//!
//! - Pushes go through one FIFO work queue (`Step`), capped by
//!   `max_propagation_steps`.
//! - Every node keeps a routing `QueryTree` over its destinations and a
//!   refcounted `QueryUnion` of their demand; only net changes of that union
//!   travel upstream.
//! - Fetches are trees of frames (see `fetch.rs`).

mod fetch;

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, error, trace, warn};

use pipelet_core::config::GraphConfig;
use pipelet_core::id::{FetchTicket, NodeId, SubscriptionId};
use pipelet_core::operation::{Change, Operation};
use pipelet_core::value::Value;
use pipelet_query::{compile, difference, Query, QueryChanges, QueryTree, QueryUnion};

use crate::traits::{stamp_split, Chunk, Ctx, Demand, OpError, Pipelet, Result};

pub use fetch::{FetchResult, Requester};

/// Where a node's output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Dest {
    Node(NodeId),
    Subscriber(SubscriptionId),
}

struct NodeSlot {
    name: String,
    kind: String,
    pipelet: Option<Box<dyn Pipelet>>,
    inputs: Vec<NodeId>,
    outputs: Vec<NodeId>,
    routes: QueryTree<Dest>,
    demand: QueryUnion,
    upstream: Query,
}

struct Subscription {
    node: NodeId,
    query: Query,
    received: Vec<Operation>,
}

#[derive(Default)]
struct Inflight {
    fetches: usize,
    buffered: Vec<(Option<NodeId>, Operation)>,
}

enum Step {
    Deliver {
        to: NodeId,
        from: Option<NodeId>,
        op: Operation,
    },
    Emit {
        from: NodeId,
        op: Operation,
    },
    Fetched {
        node: NodeId,
        chunk: Chunk,
    },
    Deferred {
        node: NodeId,
        op: Operation,
    },
}

/// Snapshot of one node for explain output.
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub id: NodeId,
    pub name: String,
    pub pipelet: String,
    pub greedy: bool,
    pub inputs: Vec<String>,
    pub upstream: Query,
    pub subscriptions: usize,
}

pub struct Graph {
    config: GraphConfig,
    nodes: Vec<Option<NodeSlot>>,
    names: IndexMap<String, NodeId>,
    queue: VecDeque<Step>,
    draining: bool,
    subscriptions: IndexMap<SubscriptionId, Subscription>,
    next_seq: u64,
    fetch: fetch::FetchState,
    inflight: HashMap<NodeId, Inflight>,
}

impl Graph {
    pub fn new(config: GraphConfig) -> Self {
        Self {
            config,
            nodes: Vec::new(),
            names: IndexMap::new(),
            queue: VecDeque::new(),
            draining: false,
            subscriptions: IndexMap::new(),
            next_seq: 1,
            fetch: fetch::FetchState::default(),
            inflight: HashMap::new(),
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    fn next_seq(&mut self) -> u64 {
        let n = self.next_seq;
        self.next_seq += 1;
        n
    }

    fn slot(&self, id: NodeId) -> Option<&NodeSlot> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, id: NodeId) -> Option<&mut NodeSlot> {
        self.nodes.get_mut(id.index()).and_then(Option::as_mut)
    }

    fn require(&self, id: NodeId) -> Result<&NodeSlot> {
        self.slot(id).ok_or(OpError::UnknownNode(id))
    }

    // ----- topology -------------------------------------------------------

    pub fn add_node(&mut self, name: impl Into<String>, pipelet: Box<dyn Pipelet>) -> Result<NodeId> {
        let name = name.into();
        if self.names.contains_key(&name) {
            return Err(OpError::Graph(format!("duplicate node name '{}'", name)));
        }
        let id = NodeId::new(self.nodes.len() as u64);
        let upstream = match pipelet.demand() {
            Demand::Greedy(q) => q,
            Demand::Lazy => pipelet.upstream_query(&Query::nothing()),
        };
        debug!(node = %id, name = %name, pipelet = pipelet.name(), "node added");
        self.nodes.push(Some(NodeSlot {
            name: name.clone(),
            kind: pipelet.name().to_string(),
            pipelet: Some(pipelet),
            inputs: Vec::new(),
            outputs: Vec::new(),
            routes: QueryTree::new(),
            demand: QueryUnion::new(),
            upstream,
        }));
        self.names.insert(name, id);
        Ok(id)
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    pub fn node_name(&self, id: NodeId) -> Option<&str> {
        self.slot(id).map(|s| s.name.as_str())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.slot(id).is_some()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.names.values().copied().collect()
    }

    pub fn inputs(&self, id: NodeId) -> &[NodeId] {
        self.slot(id).map(|s| s.inputs.as_slice()).unwrap_or_default()
    }

    pub fn outputs(&self, id: NodeId) -> &[NodeId] {
        self.slot(id).map(|s| s.outputs.as_slice()).unwrap_or_default()
    }

    /// Typed access to a pipelet. `None` if absent, detached or of another type.
    pub fn get<T: Pipelet>(&self, id: NodeId) -> Option<&T> {
        self.slot(id)?.pipelet.as_ref()?.as_any().downcast_ref::<T>()
    }

    pub fn get_mut<T: Pipelet>(&mut self, id: NodeId) -> Option<&mut T> {
        self.slot_mut(id)?
            .pipelet
            .as_mut()?
            .as_any_mut()
            .downcast_mut::<T>()
    }

    pub fn connect(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        self.require(from)?;
        self.require(to)?;
        if self.outputs(from).contains(&to) {
            warn!(from = %from, to = %to, "already connected");
            return Ok(());
        }
        if let Some(s) = self.slot_mut(from) {
            s.outputs.push(to);
        }
        let (up, fetch_now) = match self.slot_mut(to) {
            Some(s) => {
                s.inputs.push(from);
                let fetch_now = s.pipelet.as_ref().is_some_and(|p| p.fetch_on_connect());
                (s.upstream.clone(), fetch_now)
            }
            None => return Err(OpError::UnknownNode(to)),
        };
        trace!(from = %from, to = %to, query = %up, "connected");
        self.propagate(from, Dest::Node(to), QueryChanges::adding(up.terms().to_vec()));
        if fetch_now && !up.is_empty() {
            self.start_fetch(Requester::Node(to), Some(to), vec![from], &up)?;
        }
        self.run()
    }

    pub fn disconnect(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        let up = self.require(to)?.upstream.clone();
        if !self.outputs(from).contains(&to) {
            return Ok(());
        }
        self.propagate(from, Dest::Node(to), QueryChanges::removing(up.into_terms()));
        if let Some(s) = self.slot_mut(from) {
            s.outputs.retain(|o| *o != to);
            s.routes.remove_destination(&Dest::Node(to));
        }
        let released = match self.slot_mut(to) {
            Some(s) => {
                s.inputs.retain(|i| *i != from);
                s.pipelet.as_mut().map(|p| p.input_disconnected(from)).unwrap_or_default()
            }
            None => Vec::new(),
        };
        self.enqueue_results(to, released, Vec::new());
        trace!(from = %from, to = %to, "disconnected");
        self.run()
    }

    /// Disconnect and drop a node. Its subscriptions end with it.
    pub fn remove_node(&mut self, id: NodeId) -> Result<()> {
        let (inputs, outputs) = {
            let s = self.require(id)?;
            (s.inputs.clone(), s.outputs.clone())
        };
        for i in inputs {
            self.disconnect(i, id)?;
        }
        for o in outputs {
            self.disconnect(id, o)?;
        }
        let subs: Vec<SubscriptionId> = self
            .subscriptions
            .iter()
            .filter(|(_, s)| s.node == id)
            .map(|(k, _)| *k)
            .collect();
        for sub in subs {
            self.subscriptions.shift_remove(&sub);
        }
        self.inflight.remove(&id);
        if let Some(slot) = self.nodes.get_mut(id.index()).and_then(Option::take) {
            self.names.shift_remove(&slot.name);
            debug!(node = %id, name = %slot.name, "node removed");
        }
        Ok(())
    }

    // ----- queries --------------------------------------------------------

    /// Apply a query change of `dest` on `node`'s output and carry net changes upstream.
    fn propagate(&mut self, node: NodeId, dest: Dest, changes: QueryChanges) {
        let mut work = VecDeque::from([(node, dest, changes)]);
        while let Some((node, dest, changes)) = work.pop_front() {
            if changes.is_empty() {
                continue;
            }
            let Some(slot) = self.slot_mut(node) else {
                continue;
            };
            if let Err(e) = slot.routes.apply(dest, &changes) {
                warn!(node = %node, error = %e, "rejected query update");
                continue;
            }
            let net = slot.demand.apply(&changes);
            if net.is_empty() {
                continue;
            }
            let demand = slot.demand.query();
            trace!(node = %node, demand = %demand, "downstream demand changed");
            let new_up = match slot.pipelet.as_mut() {
                Some(p) => {
                    p.downstream_changed(&demand, &net);
                    match p.demand() {
                        Demand::Greedy(q) => q,
                        Demand::Lazy => p.upstream_query(&demand),
                    }
                }
                None => continue,
            };
            let delta = difference(&slot.upstream, &new_up);
            if delta.is_empty() {
                continue;
            }
            slot.upstream = new_up;
            for &input in &slot.inputs {
                work.push_back((input, Dest::Node(node), delta.clone()));
            }
        }
    }

    /// Replace a node's upstream query (used by pipelets whose demand changes
    /// for reasons other than their outputs, e.g. a remote subscriber).
    pub fn set_upstream(&mut self, node: NodeId, query: Query) -> Result<()> {
        let slot = self.slot_mut(node).ok_or(OpError::UnknownNode(node))?;
        let delta = difference(&slot.upstream, &query);
        if delta.is_empty() {
            return Ok(());
        }
        slot.upstream = query;
        let inputs = slot.inputs.clone();
        for input in inputs {
            self.propagate(input, Dest::Node(node), delta.clone());
        }
        self.run()
    }

    /// Recompute a node's upstream query from its pipelet.
    pub fn refresh_upstream(&mut self, node: NodeId) -> Result<()> {
        let slot = self.slot(node).ok_or(OpError::UnknownNode(node))?;
        let Some(p) = slot.pipelet.as_ref() else {
            return Err(OpError::Busy(node));
        };
        let query = match p.demand() {
            Demand::Greedy(q) => q,
            Demand::Lazy => p.upstream_query(&slot.demand.query()),
        };
        self.set_upstream(node, query)
    }

    pub fn upstream_query(&self, node: NodeId) -> Option<&Query> {
        self.slot(node).map(|s| &s.upstream)
    }

    /// Union of the demands of `node`'s outputs.
    pub fn demand(&self, node: NodeId) -> Option<Query> {
        self.slot(node).map(|s| s.demand.query())
    }

    /// Total number of term subscriptions on `node`'s output.
    pub fn subscription_count(&self, node: NodeId) -> usize {
        self.slot(node).map(|s| s.demand.total()).unwrap_or(0)
    }

    // ----- external consumers ---------------------------------------------

    pub fn subscribe(&mut self, node: NodeId, query: Query) -> Result<SubscriptionId> {
        self.require(node)?;
        compile(&query)?;
        let id = SubscriptionId::new(self.next_seq());
        self.propagate(
            node,
            Dest::Subscriber(id),
            QueryChanges::adding(query.terms().to_vec()),
        );
        self.subscriptions.insert(
            id,
            Subscription {
                node,
                query,
                received: Vec::new(),
            },
        );
        self.run()?;
        Ok(id)
    }

    /// Change a subscription's query by the minimal delta.
    pub fn update_subscription(&mut self, id: SubscriptionId, query: Query) -> Result<()> {
        compile(&query)?;
        let Some(sub) = self.subscriptions.get_mut(&id) else {
            return Err(OpError::Graph(format!("unknown subscription {}", id)));
        };
        let delta = difference(&sub.query, &query);
        sub.query = query;
        let node = sub.node;
        self.propagate(node, Dest::Subscriber(id), delta);
        self.run()
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> Result<()> {
        let Some(sub) = self.subscriptions.shift_remove(&id) else {
            return Ok(());
        };
        self.propagate(
            sub.node,
            Dest::Subscriber(id),
            QueryChanges::removing(sub.query.into_terms()),
        );
        if let Some(s) = self.slot_mut(sub.node) {
            s.routes.remove_destination(&Dest::Subscriber(id));
        }
        self.run()
    }

    /// Drain operations delivered to a subscription.
    pub fn take_received(&mut self, id: SubscriptionId) -> Vec<Operation> {
        self.subscriptions
            .get_mut(&id)
            .map(|s| std::mem::take(&mut s.received))
            .unwrap_or_default()
    }

    // ----- push -----------------------------------------------------------

    /// Push `op` into `node` as if an input had delivered it.
    pub fn submit(&mut self, node: NodeId, op: Operation) -> Result<()> {
        self.require(node)?;
        self.queue.push_back(Step::Deliver {
            to: node,
            from: None,
            op,
        });
        self.run()
    }

    /// Push `op` out of `node` to its destinations.
    pub fn emit_from(&mut self, node: NodeId, op: Operation) -> Result<()> {
        self.require(node)?;
        self.queue.push_back(Step::Emit { from: node, op });
        self.run()
    }

    /// Call `tick` on every pipelet.
    pub fn tick(&mut self, now: Instant) -> Result<()> {
        for id in self.node_ids() {
            let config = &self.config;
            let Some(slot) = self.nodes.get_mut(id.index()).and_then(Option::as_mut) else {
                continue;
            };
            let Some(p) = slot.pipelet.as_mut() else {
                continue;
            };
            let mut ctx = Ctx::new(id, None, &slot.inputs, config, now);
            let out = p.tick(&mut ctx);
            let deferred = ctx.take_deferred();
            self.enqueue_results(id, out, deferred);
        }
        self.run()
    }

    /// Run `f` with the pipelet detached from its node and the graph at hand.
    pub fn drive<R>(
        &mut self,
        node: NodeId,
        f: impl FnOnce(&mut dyn Pipelet, &mut Graph) -> R,
    ) -> Result<R> {
        let mut pipelet = self
            .slot_mut(node)
            .ok_or(OpError::UnknownNode(node))?
            .pipelet
            .take()
            .ok_or(OpError::Busy(node))?;
        let was_draining = std::mem::replace(&mut self.draining, true);
        let out = f(pipelet.as_mut(), self);
        self.draining = was_draining;
        if let Some(slot) = self.slot_mut(node) {
            slot.pipelet = Some(pipelet);
        }
        self.run()?;
        Ok(out)
    }

    fn enqueue_results(&mut self, node: NodeId, out: Vec<Operation>, deferred: Vec<Operation>) {
        for op in out {
            self.queue.push_back(Step::Emit { from: node, op });
        }
        for op in deferred {
            self.queue.push_back(Step::Deferred { node, op });
        }
    }

    fn dispatch(&mut self, dest: Dest, from: NodeId, op: Operation) {
        match dest {
            Dest::Node(to) => self.queue.push_back(Step::Deliver {
                to,
                from: Some(from),
                op,
            }),
            Dest::Subscriber(id) => {
                if let Some(sub) = self.subscriptions.get_mut(&id) {
                    sub.received.push(op);
                }
            }
        }
    }

    /// Route one output operation of `from` to its destinations.
    fn route(&mut self, from: NodeId, op: Operation) {
        let Some(slot) = self.slot(from) else {
            return;
        };
        let closing = op.closes_tx();
        if op.is_empty() {
            if !closing {
                return;
            }
            let dests: Vec<Dest> = slot.routes.destinations().copied().collect();
            for d in dests {
                self.dispatch(d, from, op.clone());
            }
            return;
        }
        let shares = slot.routes.split(&op.change);
        let mut missed: Vec<Dest> = Vec::new();
        if closing {
            let reached: HashSet<Dest> = shares.iter().map(|(d, _)| *d).collect();
            missed = slot
                .routes
                .destinations()
                .filter(|d| !reached.contains(*d))
                .copied()
                .collect();
        }
        for (d, changes) in shares {
            for piece in stamp_split(&op, changes) {
                self.dispatch(d, from, piece);
            }
        }
        for d in missed {
            self.dispatch(d, from, op.derive(Change::Add { values: Vec::new() }));
        }
    }

    fn run(&mut self) -> Result<()> {
        if self.draining {
            return Ok(());
        }
        self.draining = true;
        let limit = self.config.max_propagation_steps.max(1);
        let mut steps = 0usize;
        let mut result = Ok(());
        while let Some(step) = self.queue.pop_front() {
            steps += 1;
            if steps > limit {
                error!(
                    limit,
                    dropped = self.queue.len() + 1,
                    "propagation step limit reached, dropping queued work"
                );
                self.queue.clear();
                result = Err(OpError::StepLimit(limit));
                break;
            }
            match step {
                Step::Deliver { to, from, op } => self.deliver(to, from, op),
                Step::Emit { from, op } => self.route(from, op),
                Step::Fetched { node, chunk } => self.deliver_fetched(node, chunk),
                Step::Deferred { node, op } => self.run_deferred(node, op),
            }
        }
        self.draining = false;
        result
    }

    fn deliver(&mut self, to: NodeId, from: Option<NodeId>, op: Operation) {
        if let Some(inflight) = self.inflight.get_mut(&to) {
            trace!(node = %to, op = %op, "buffered while fetching");
            inflight.buffered.push((from, op));
            return;
        }
        let config = &self.config;
        let Some(slot) = self.nodes.get_mut(to.index()).and_then(Option::as_mut) else {
            trace!(node = %to, "delivery to a removed node dropped");
            return;
        };
        let Some(p) = slot.pipelet.as_mut() else {
            warn!(node = %to, op = %op, "delivery to a detached node dropped");
            return;
        };
        let mut ctx = Ctx::new(to, from, &slot.inputs, config, Instant::now());
        let out = match p.listen(op, &mut ctx) {
            Ok(out) => out,
            Err(e) => {
                error!(node = %to, name = %slot.name, error = %e, "listen failed");
                Vec::new()
            }
        };
        let deferred = ctx.take_deferred();
        self.enqueue_results(to, out, deferred);
    }

    fn deliver_fetched(&mut self, node: NodeId, chunk: Chunk) {
        let no_more = chunk.no_more;
        let config = &self.config;
        if let Some(slot) = self.nodes.get_mut(node.index()).and_then(Option::as_mut) {
            match slot.pipelet.as_mut() {
                Some(p) => {
                    let mut ctx = Ctx::new(node, None, &slot.inputs, config, Instant::now());
                    let out = match p.receive_fetched(chunk, &mut ctx) {
                        Ok(out) => out,
                        Err(e) => {
                            error!(node = %node, error = %e, "receive_fetched failed");
                            Vec::new()
                        }
                    };
                    let deferred = ctx.take_deferred();
                    self.enqueue_results(node, out, deferred);
                }
                None => warn!(node = %node, "fetched chunk for a detached node dropped"),
            }
        }
        if !no_more {
            return;
        }
        let done = match self.inflight.get_mut(&node) {
            Some(inflight) => {
                inflight.fetches = inflight.fetches.saturating_sub(1);
                inflight.fetches == 0
            }
            None => false,
        };
        if done {
            if let Some(inflight) = self.inflight.remove(&node) {
                // replay in arrival order ahead of anything queued meanwhile
                for (from, op) in inflight.buffered.into_iter().rev() {
                    self.queue.push_front(Step::Deliver { to: node, from, op });
                }
            }
        }
    }

    fn run_deferred(&mut self, node: NodeId, op: Operation) {
        let Some(mut pipelet) = self.slot_mut(node).and_then(|s| s.pipelet.take()) else {
            warn!(node = %node, "deferred operation for a missing node dropped");
            return;
        };
        if let Err(e) = pipelet.on_deferred(self, node, op) {
            error!(node = %node, error = %e, "deferred operation failed");
        }
        if let Some(slot) = self.slot_mut(node) {
            slot.pipelet = Some(pipelet);
        }
    }

    // ----- fetch ----------------------------------------------------------

    /// Fetch `node`'s current output matching `query`. Results are collected
    /// under the returned ticket (see [`Graph::poll_fetch`]).
    pub fn fetch(&mut self, node: NodeId, query: &Query) -> Result<FetchTicket> {
        self.require(node)?;
        let ticket = self.start_fetch(Requester::External, None, vec![node], query)?;
        self.run()?;
        Ok(ticket)
    }

    /// Fetch from all inputs of `node` on its behalf, collecting externally.
    pub fn fetch_inputs(&mut self, node: NodeId, query: &Query) -> Result<FetchTicket> {
        let inputs = self.require(node)?.inputs.clone();
        let ticket = self.start_fetch(Requester::External, Some(node), inputs, query)?;
        self.run()?;
        Ok(ticket)
    }

    /// Fetch and return every value at once. Fails with `FetchPending` when
    /// part of the fetch is still waiting on a deferred source; the ticket's
    /// result is then kept until [`Graph::poll_fetch`] returns it complete or
    /// [`Graph::forget_fetch`] drops it.
    pub fn fetch_all(&mut self, node: NodeId, query: &Query) -> Result<Vec<Value>> {
        let ticket = self.fetch(node, query)?;
        match self.fetch.results.get(&ticket) {
            Some(r) if r.complete => {}
            _ => return Err(OpError::FetchPending(ticket)),
        }
        Ok(self
            .poll_fetch(ticket)
            .map(|r| r.chunks.into_iter().flatten().collect())
            .unwrap_or_default())
    }

    /// Take the chunks collected so far for an external fetch. Once a result
    /// with `complete` set has been returned, the ticket is forgotten.
    pub fn poll_fetch(&mut self, ticket: FetchTicket) -> Option<FetchResult> {
        let result = self.fetch.results.get_mut(&ticket)?;
        if result.complete {
            return self.fetch.results.remove(&ticket);
        }
        Some(FetchResult {
            chunks: std::mem::take(&mut result.chunks),
            complete: false,
        })
    }

    /// Drop whatever an external fetch has collected. Chunks still arriving
    /// for the ticket are discarded.
    pub fn forget_fetch(&mut self, ticket: FetchTicket) -> bool {
        self.fetch.results.remove(&ticket).is_some()
    }

    /// Refetch every input of a stateful node; it diffs the result against
    /// its state in `receive_fetched`.
    pub fn resync(&mut self, node: NodeId) -> Result<()> {
        let (inputs, up) = {
            let slot = self.require(node)?;
            (slot.inputs.clone(), slot.upstream.clone())
        };
        match self.slot_mut(node).and_then(|s| s.pipelet.as_mut()) {
            Some(p) => p.begin_resync(),
            None => return Err(OpError::Busy(node)),
        }
        debug!(node = %node, query = %up, "resync");
        self.start_fetch(Requester::Node(node), Some(node), inputs, &up)?;
        self.run()
    }

    /// Deliver a chunk for a deferred fetch frame.
    pub fn resolve_fetch(&mut self, ticket: FetchTicket, values: Vec<Value>, no_more: bool) -> Result<()> {
        self.resolve_deferred(ticket, values, no_more);
        self.run()
    }

    /// Tickets of deferred frames still waiting on their source.
    pub fn pending_deferred(&self) -> Vec<FetchTicket> {
        self.fetch.deferred.keys().copied().collect()
    }

    // ----- explain --------------------------------------------------------

    pub fn describe(&self) -> Vec<NodeReport> {
        self.names
            .values()
            .filter_map(|&id| {
                let s = self.slot(id)?;
                Some(NodeReport {
                    id,
                    name: s.name.clone(),
                    pipelet: s.kind.clone(),
                    greedy: s
                        .pipelet
                        .as_ref()
                        .is_some_and(|p| matches!(p.demand(), Demand::Greedy(_))),
                    inputs: s
                        .inputs
                        .iter()
                        .filter_map(|i| self.node_name(*i).map(str::to_string))
                        .collect(),
                    upstream: s.upstream.clone(),
                    subscriptions: s.demand.total(),
                })
            })
            .collect()
    }
}
