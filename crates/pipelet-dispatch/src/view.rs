//! Branch entry point: wraps a branch's view pipelet and marks every
//! transaction passing through with the dispatcher's fork tag, so the
//! gatherer can rejoin the branches.

use std::any::Any;

use pipelet_core::id::{FetchTicket, NodeId};
use pipelet_core::operation::Operation;
use pipelet_core::value::Value;
use pipelet_operators::{Chunk, Ctx, Demand, FetchPlan, Graph, Pipelet, Result};
use pipelet_query::{Query, QueryChanges};

pub struct ForkedView {
    inner: Box<dyn Pipelet>,
    tag: String,
}

impl ForkedView {
    pub fn new(inner: Box<dyn Pipelet>, tag: impl Into<String>) -> Self {
        Self {
            inner,
            tag: tag.into(),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    fn stamp(&self, mut ops: Vec<Operation>) -> Vec<Operation> {
        for op in &mut ops {
            if let Some(t) = op.options.transaction.take() {
                op.options.transaction = Some(t.with_fork(self.tag.as_str()));
            }
        }
        ops
    }
}

impl Pipelet for ForkedView {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn demand(&self) -> Demand {
        self.inner.demand()
    }

    fn upstream_query(&self, downstream: &Query) -> Query {
        self.inner.upstream_query(downstream)
    }

    fn listen(&mut self, op: Operation, ctx: &mut Ctx<'_>) -> Result<Vec<Operation>> {
        let out = self.inner.listen(op, ctx)?;
        Ok(self.stamp(out))
    }

    fn fetch_plan(&mut self, query: &Query, ticket: FetchTicket) -> FetchPlan {
        self.inner.fetch_plan(query, ticket)
    }

    fn transform_fetched(&self, values: Vec<Value>) -> Vec<Value> {
        self.inner.transform_fetched(values)
    }

    fn receive_fetched(&mut self, chunk: Chunk, ctx: &mut Ctx<'_>) -> Result<Vec<Operation>> {
        let out = self.inner.receive_fetched(chunk, ctx)?;
        Ok(self.stamp(out))
    }

    fn fetch_on_connect(&self) -> bool {
        self.inner.fetch_on_connect()
    }

    fn input_disconnected(&mut self, input: NodeId) -> Vec<Operation> {
        let out = self.inner.input_disconnected(input);
        self.stamp(out)
    }

    fn begin_resync(&mut self) {
        self.inner.begin_resync()
    }

    fn downstream_changed(&mut self, demand: &Query, net: &QueryChanges) {
        self.inner.downstream_changed(demand, net)
    }

    fn tick(&mut self, ctx: &mut Ctx<'_>) -> Vec<Operation> {
        let out = self.inner.tick(ctx);
        self.stamp(out)
    }

    fn on_deferred(&mut self, graph: &mut Graph, me: NodeId, op: Operation) -> Result<()> {
        self.inner.on_deferred(graph, me, op)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
