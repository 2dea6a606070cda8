//! Runtime: build a graph from a plan and keep it moving.

use std::fmt::Write;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use pipelet_core::config::GraphConfig;
use pipelet_core::hash::{state_digest, Hash256};
use pipelet_core::id::{NodeId, SubscriptionId};
use pipelet_core::operation::Operation;
use pipelet_core::value::Value;
use pipelet_crossover::{ConnectionStatus, Crossover, CrossoverError, Role, Transport};
use pipelet_operators::{Graph, OpError, Pipelet, Registry};
use pipelet_planner::{rules, GraphPlan, PlanError};
use pipelet_query::Query;

pub type Result<T> = std::result::Result<T, ExecError>;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("plan: {0}")]
    Plan(#[from] PlanError),

    #[error("graph: {0}")]
    Graph(#[from] OpError),

    #[error("crossover: {0}")]
    Crossover(#[from] CrossoverError),

    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("two crossovers for address '{0}'")]
    DuplicateCrossover(String),

    #[error("hashing: {0}")]
    Hash(#[from] pipelet_core::Error),
}

pub struct Runtime {
    config: GraphConfig,
    graph: Graph,
    registry: Registry,
    crossovers: IndexMap<String, NodeId>,
    watched: Vec<NodeId>,
    subscriptions: Vec<SubscriptionId>,
}

impl Runtime {
    /// Runtime with every built-in pipelet plus `dispatch` and `crossover`.
    pub fn new(config: GraphConfig) -> Self {
        let mut registry = Registry::with_builtins();
        pipelet_crossover::register(&mut registry);
        pipelet_dispatch::register(&mut registry);
        Self::with_registry(config, registry)
    }

    pub fn with_registry(config: GraphConfig, registry: Registry) -> Self {
        Self {
            graph: Graph::new(config.clone()),
            config,
            registry,
            crossovers: IndexMap::new(),
            watched: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    /// Environment config overridden by the plan, then the plan built.
    pub fn from_plan(plan: &GraphPlan) -> Result<Self> {
        let mut rt = Self::new(plan.graph_config(GraphConfig::from_env()));
        rt.build(plan)?;
        Ok(rt)
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Add the plan's nodes, then its edges, then its subscriptions. Edges go
    /// in after all nodes so inputs may be declared later (loops).
    pub fn build(&mut self, plan: &GraphPlan) -> Result<()> {
        rules::check(plan)?;
        rules::check_pipelets(plan, self.registry.names())?;
        for spec in &plan.nodes {
            let pipelet = self.registry.make(&spec.pipelet, &spec.options, &self.config)?;
            let id = self.add_node(&spec.name, pipelet)?;
            debug!(node = %id, name = %spec.name, pipelet = %spec.pipelet, "built");
        }
        for (from, to) in plan.edges() {
            let (from, to) = (self.node(from)?, self.node(to)?);
            self.graph.connect(from, to)?;
        }
        for sub in &plan.subscriptions {
            let id = self.subscribe(&sub.node, sub.query.clone())?;
            self.subscriptions.push(id);
        }
        info!(nodes = plan.nodes.len(), crossovers = self.crossovers.len(), "graph built");
        Ok(())
    }

    /// Add a node; crossover nodes are registered under their address.
    pub fn add_node(&mut self, name: &str, pipelet: Box<dyn Pipelet>) -> Result<NodeId> {
        let address = pipelet
            .as_any()
            .downcast_ref::<Crossover>()
            .map(|c| c.address().to_string());
        if let Some(addr) = &address {
            if self.crossovers.contains_key(addr) {
                return Err(ExecError::DuplicateCrossover(addr.clone()));
            }
        }
        let id = self.graph.add_node(name, pipelet)?;
        if let Some(addr) = address {
            self.crossovers.insert(addr, id);
        }
        Ok(id)
    }

    pub fn node(&self, name: &str) -> Result<NodeId> {
        self.graph
            .node_id(name)
            .ok_or_else(|| ExecError::UnknownNode(name.to_string()))
    }

    pub fn connect(&mut self, from: &str, to: &str) -> Result<()> {
        let (from, to) = (self.node(from)?, self.node(to)?);
        Ok(self.graph.connect(from, to)?)
    }

    pub fn submit(&mut self, name: &str, op: Operation) -> Result<()> {
        let id = self.node(name)?;
        Ok(self.graph.submit(id, op)?)
    }

    pub fn fetch_all(&mut self, name: &str, query: &Query) -> Result<Vec<Value>> {
        let id = self.node(name)?;
        Ok(self.graph.fetch_all(id, query)?)
    }

    pub fn subscribe(&mut self, name: &str, query: Query) -> Result<SubscriptionId> {
        let id = self.node(name)?;
        Ok(self.graph.subscribe(id, query)?)
    }

    /// Subscriptions declared by built plans.
    pub fn plan_subscriptions(&self) -> &[SubscriptionId] {
        &self.subscriptions
    }

    pub fn take_received(&mut self, sub: SubscriptionId) -> Vec<Operation> {
        self.graph.take_received(sub)
    }

    /// Order-independent digest of everything `name` serves.
    pub fn digest(&mut self, name: &str) -> Result<Hash256> {
        let values = self.fetch_all(name, &Query::everything())?;
        Ok(state_digest(&values, &self.config.key())?)
    }

    // ----- crossovers -----------------------------------------------------

    /// The crossover node for `address`, created with `role` if there is none.
    pub fn crossover(&mut self, address: &str, role: Role) -> Result<NodeId> {
        if let Some(&id) = self.crossovers.get(address) {
            return Ok(id);
        }
        let node = match role {
            Role::Client => Crossover::client(address),
            Role::Server => Crossover::server(address),
        };
        self.add_node(&format!("crossover:{}", address), Box::new(node))
    }

    pub fn crossover_node(&self, address: &str) -> Option<NodeId> {
        self.crossovers.get(address).copied()
    }

    /// Attach `transport` to the crossover for `address` (a client one is
    /// created if needed). The transport must be one the configuration
    /// allows; the first allowed kind this build supports is preferred.
    pub fn attach_crossover(&mut self, address: &str, transport: Box<dyn Transport>) -> Result<NodeId> {
        let preferred = pipelet_crossover::select_transport(&self.config.transports)?;
        let kind = transport.kind();
        if !self.config.transports.iter().any(|t| t.trim() == kind.name()) {
            return Err(CrossoverError::UnsupportedTransport(self.config.transports.clone()).into());
        }
        if kind != preferred {
            warn!(address, kind = kind.name(), preferred = preferred.name(), "attaching a non-preferred transport");
        }
        let id = self.crossover(address, Role::Client)?;
        let node = self
            .graph
            .get_mut::<Crossover>(id)
            .ok_or_else(|| ExecError::UnknownNode(address.to_string()))?;
        node.attach(transport);
        Ok(id)
    }

    /// Resync `name` whenever a client crossover reconnects to a remote that
    /// lost its session.
    pub fn watch_resync(&mut self, name: &str) -> Result<()> {
        let id = self.node(name)?;
        if !self.watched.contains(&id) {
            self.watched.push(id);
        }
        Ok(())
    }

    /// Handle everything the crossovers received; returns their status
    /// changes in order.
    pub fn pump(&mut self) -> Result<Vec<ConnectionStatus>> {
        let mut changes = Vec::new();
        let nodes: Vec<NodeId> = self.crossovers.values().copied().collect();
        for id in nodes {
            let statuses = pipelet_crossover::pump(&mut self.graph, id)?;
            let client = self
                .graph
                .get::<Crossover>(id)
                .is_some_and(|c| c.role() == Role::Client);
            for status in statuses {
                if client && status.is_hard_reconnect() {
                    self.resync_watched(&status);
                }
                changes.push(status);
            }
        }
        Ok(changes)
    }

    fn resync_watched(&mut self, status: &ConnectionStatus) {
        info!(address = %status.address, caches = self.watched.len(), "hard reconnect, resyncing");
        for &id in &self.watched {
            if let Err(e) = self.graph.resync(id) {
                warn!(node = %id, error = %e, "resync failed");
            }
        }
    }

    pub fn tick(&mut self, now: Instant) -> Result<()> {
        Ok(self.graph.tick(now)?)
    }

    /// Pump and tick every `tick_interval_ms` until `shutdown` fires.
    pub async fn run(&mut self, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms.max(1)));
        info!(interval_ms = self.config.tick_interval_ms, "runtime started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    self.pump()?;
                    self.tick(Instant::now())?;
                }
            }
        }
        info!("runtime stopped");
        Ok(())
    }

    /// Nodes, inputs and effective upstream queries of the built graph.
    pub fn explain(&self) -> String {
        let mut out = String::new();
        for report in self.graph.describe() {
            let _ = write!(out, "{} [{}]", report.name, report.pipelet);
            if report.greedy {
                out.push_str(" greedy");
            }
            if !report.inputs.is_empty() {
                let _ = write!(out, " <- {}", report.inputs.join(", "));
            }
            let _ = writeln!(out, " upstream={} subscriptions={}", report.upstream, report.subscriptions);
        }
        out
    }
}
