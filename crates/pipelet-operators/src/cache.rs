//! A `set` that can resynchronize.
//!
//! After `Graph::resync`, the cache collects a full refetch of its inputs and
//! diffs it against its state. The difference goes out as one transaction
//! (removes, updates, adds), so consumers see a single coherent transition.

use std::any::Any;

use indexmap::IndexMap;
use serde_json::Value as Json;
use tracing::{debug, info};

use pipelet_core::config::GraphConfig;
use pipelet_core::hash::{state_digest, Hash256};
use pipelet_core::id::FetchTicket;
use pipelet_core::operation::{Change, Operation};
use pipelet_core::value::{Identity, Key, Value};
use pipelet_query::Query;
use pipelet_tx::TxBuilder;

use crate::set::{SetOptions, Store};
use crate::traits::{Chunk, Ctx, Demand, FetchPlan, Pipelet, Result};

pub struct Cache {
    store: Store,
    query: Query,
    fresh: Option<IndexMap<Identity, Value>>,
    resyncs: usize,
}

impl Cache {
    pub fn new(key: Key, query: Query) -> Self {
        Self {
            store: Store::new(key),
            query,
            fresh: None,
            resyncs: 0,
        }
    }

    pub fn from_options(options: &Json, config: &GraphConfig) -> Result<Self> {
        let opts = SetOptions::parse("cache", options)?;
        let key = opts.key.map(Key::new).unwrap_or_else(|| config.key());
        let mut cache = Self::new(key, opts.query.unwrap_or_else(Query::everything));
        cache.store.absorb(opts.values);
        Ok(cache)
    }

    pub fn values(&self) -> Vec<Value> {
        self.store.snapshot()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Completed resynchronizations.
    pub fn resyncs(&self) -> usize {
        self.resyncs
    }

    pub fn is_resyncing(&self) -> bool {
        self.fresh.is_some()
    }

    pub fn digest(&self) -> pipelet_core::Result<Hash256> {
        state_digest(self.store.values(), self.store.key())
    }

    fn finish_resync(&mut self, fresh: IndexMap<Identity, Value>) -> Vec<Operation> {
        let mut removes = Vec::new();
        let mut updates = Vec::new();
        let mut adds = Vec::new();
        for id in self.store.identities() {
            if !fresh.contains_key(id) {
                if let Some(v) = self.store.get(id) {
                    removes.push(v.clone());
                }
            }
        }
        for (id, v) in &fresh {
            match self.store.get(id) {
                Some(old) if old != v => updates.push((old.clone(), v.clone())),
                Some(_) => {}
                None => adds.push(v.clone()),
            }
        }
        self.store.replace_all(fresh);
        self.resyncs += 1;
        info!(
            removed = removes.len(),
            updated = updates.len(),
            added = adds.len(),
            "cache resynchronized"
        );

        let mut changes = Vec::new();
        if !removes.is_empty() {
            changes.push(Change::Remove { values: removes });
        }
        if !updates.is_empty() {
            changes.push(Change::Update { values: updates });
        }
        if !adds.is_empty() {
            changes.push(Change::Add { values: adds });
        }
        let ops = changes.into_iter().map(|c| Operation::new(c, Default::default())).collect();
        TxBuilder::new().stamp(ops)
    }
}

impl Pipelet for Cache {
    fn name(&self) -> &str {
        "cache"
    }

    fn demand(&self) -> Demand {
        Demand::Greedy(self.query.clone())
    }

    fn listen(&mut self, op: Operation, ctx: &mut Ctx<'_>) -> Result<Vec<Operation>> {
        Ok(self.store.settle(&op, &ctx.node.to_string()))
    }

    fn fetch_plan(&mut self, _query: &Query, _ticket: FetchTicket) -> FetchPlan {
        FetchPlan::Serve(self.store.snapshot())
    }

    fn fetch_on_connect(&self) -> bool {
        true
    }

    fn begin_resync(&mut self) {
        debug!("cache resync started");
        self.fresh = Some(IndexMap::new());
    }

    fn receive_fetched(&mut self, chunk: Chunk, _ctx: &mut Ctx<'_>) -> Result<Vec<Operation>> {
        let Some(fresh) = self.fresh.as_mut() else {
            let added = self.store.absorb(chunk.values);
            return Ok(if added.is_empty() {
                Vec::new()
            } else {
                vec![Operation::add(added)]
            });
        };
        for v in chunk.values {
            fresh.insert(self.store.key().identity(&v), v);
        }
        if !chunk.no_more {
            return Ok(Vec::new());
        }
        let fresh = self.fresh.take().unwrap_or_default();
        Ok(self.finish_resync(fresh))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(j: Json) -> Value {
        Value::from_json(j).unwrap()
    }

    #[test]
    fn diff_is_one_transaction() {
        let mut cache = Cache::new(Key::default(), Query::everything());
        cache.store.absorb(vec![v(json!({"id": 1, "n": 1})), v(json!({"id": 2}))]);
        cache.begin_resync();
        let mut fresh = IndexMap::new();
        for x in [v(json!({"id": 1, "n": 2})), v(json!({"id": 3}))] {
            fresh.insert(Key::default().identity(&x), x);
        }
        cache.fresh = None;
        let ops = cache.finish_resync(fresh);
        let kinds: Vec<String> = ops.iter().map(|o| o.kind().to_string()).collect();
        assert_eq!(kinds, vec!["remove", "update", "add"]);
        let id = ops[0].tx().unwrap().id.clone();
        assert!(ops.iter().all(|o| o.tx().unwrap().id == id));
        assert!(ops[2].closes_tx());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.resyncs(), 1);
    }
}
