//! Stateful keyed store.
//!
//! `set` is greedy: it subscribes to its `query` (everything by default)
//! whatever downstream asks, keeps one value per identity in insertion order
//! and serves fetches from that state. Conflicting mutations (duplicate add,
//! remove or update of an absent identity, rename onto a present one) are
//! logged and skipped; the first writer wins.
//!
//! A closing operation that changes nothing, for a transaction the store has
//! already closed, is not forwarded again. That is what stops a closer from
//! circling a feedback loop forever.

use std::any::Any;

use indexmap::{IndexMap, IndexSet};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::{debug, warn};

use pipelet_core::config::GraphConfig;
use pipelet_core::id::FetchTicket;
use pipelet_core::operation::{Change, Operation, TxId};
use pipelet_core::value::{Identity, Key, Value};
use pipelet_query::Query;

use crate::traits::{stamp_split, Chunk, Ctx, Demand, FetchPlan, OpError, Pipelet, Result};

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SetOptions {
    /// Identity attributes; defaults to the graph key.
    pub key: Option<Vec<String>>,
    /// Query subscribed upstream; defaults to everything.
    pub query: Option<Query>,
    /// Initial values.
    pub values: Vec<Value>,
}

impl SetOptions {
    pub fn parse(pipelet: &str, options: &Json) -> Result<Self> {
        if options.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(options.clone()).map_err(|e| OpError::options(pipelet, e))
    }
}

/// Recently closed transactions remembered per store.
const CLOSED_HISTORY: usize = 1024;

/// Per-identity state shared by `set` and `cache`.
#[derive(Debug, Clone)]
pub struct Store {
    key: Key,
    values: IndexMap<Identity, Value>,
    closed: IndexSet<TxId>,
}

impl Store {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            values: IndexMap::new(),
            closed: IndexSet::new(),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, id: &Identity) -> Option<&Value> {
        self.values.get(id)
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.values.contains_key(&self.key.identity(value))
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.values()
    }

    pub fn snapshot(&self) -> Vec<Value> {
        self.values.values().cloned().collect()
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.values.keys()
    }

    /// Apply `change`, returning what actually changed.
    pub fn apply(&mut self, change: &Change, node: &str) -> Vec<Change> {
        match change {
            Change::Add { values } => {
                let mut added = Vec::new();
                for v in values {
                    let id = self.key.identity(v);
                    if self.values.contains_key(&id) {
                        warn!(node, identity = %id, "duplicate add ignored");
                        continue;
                    }
                    self.values.insert(id, v.clone());
                    added.push(v.clone());
                }
                vec![Change::Add { values: added }]
            }
            Change::Remove { values } => {
                let mut removed = Vec::new();
                for v in values {
                    let id = self.key.identity(v);
                    match self.values.shift_remove(&id) {
                        Some(stored) => removed.push(stored),
                        None => warn!(node, identity = %id, "remove of an absent value ignored"),
                    }
                }
                vec![Change::Remove { values: removed }]
            }
            Change::Update { values } => {
                let mut updated = Vec::new();
                for (old, new) in values {
                    let (io, inew) = (self.key.identity(old), self.key.identity(new));
                    let Some(index) = self.values.get_index_of(&io) else {
                        warn!(node, identity = %io, "update of an absent value ignored");
                        continue;
                    };
                    if io != inew && self.values.contains_key(&inew) {
                        warn!(node, from = %io, to = %inew, "rename onto an existing value ignored");
                        continue;
                    }
                    let stored = if io == inew {
                        self.values.insert(io, new.clone())
                    } else {
                        let stored = self.values.shift_remove(&io);
                        self.values.shift_insert(index, inew, new.clone());
                        stored
                    };
                    if let Some(stored) = stored {
                        updated.push((stored, new.clone()));
                    }
                }
                vec![Change::Update { values: updated }]
            }
            Change::Clear if self.values.is_empty() => {
                debug!(node, "clear of an empty store ignored");
                Vec::new()
            }
            Change::Clear => {
                self.values.clear();
                vec![Change::Clear]
            }
        }
    }

    /// Apply `op` and return the operations to emit for what changed.
    pub fn settle(&mut self, op: &Operation, node: &str) -> Vec<Operation> {
        let changes: Vec<Change> = self
            .apply(&op.change, node)
            .into_iter()
            .filter(|c| !c.is_empty())
            .collect();
        if let Some(t) = op.tx().filter(|t| !t.more) {
            if changes.is_empty() && self.closed.contains(&t.id) {
                debug!(node, tx = %t.id, "transaction already closed here, closer dropped");
                return Vec::new();
            }
            self.closed.insert(t.id.clone());
            while self.closed.len() > CLOSED_HISTORY {
                self.closed.shift_remove_index(0);
            }
        }
        stamp_split(op, changes)
    }

    /// Insert fetched values that are not present yet.
    pub fn absorb(&mut self, values: Vec<Value>) -> Vec<Value> {
        let mut added = Vec::new();
        for v in values {
            let id = self.key.identity(&v);
            if self.values.contains_key(&id) {
                debug!(identity = %id, "fetched value already present");
                continue;
            }
            self.values.insert(id, v.clone());
            added.push(v);
        }
        added
    }

    pub(crate) fn replace_all(&mut self, values: IndexMap<Identity, Value>) {
        self.values = values;
    }
}

pub struct Set {
    store: Store,
    query: Query,
}

impl Set {
    pub fn new(key: Key, query: Query) -> Self {
        Self {
            store: Store::new(key),
            query,
        }
    }

    pub fn from_options(options: &Json, config: &GraphConfig) -> Result<Self> {
        let opts = SetOptions::parse("set", options)?;
        let key = opts.key.map(Key::new).unwrap_or_else(|| config.key());
        let mut set = Self::new(key, opts.query.unwrap_or_else(Query::everything));
        set.store.absorb(opts.values);
        Ok(set)
    }

    pub fn store(&self) -> &Store {
        &self.store
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
}

impl Pipelet for Set {
    fn name(&self) -> &str {
        "set"
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

    fn receive_fetched(&mut self, chunk: Chunk, _ctx: &mut Ctx<'_>) -> Result<Vec<Operation>> {
        let added = self.store.absorb(chunk.values);
        if added.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Operation::add(added)])
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
