//! Per-transaction state tracking at a join point.
//!
//! A join buffers every operation of a transaction until it is complete, then
//! releases the recombined result exactly once. A transaction is complete when
//! a single `more=false` arrives, or, when its forks name this join's tag,
//! once every branch feeding the join has sent `more=false`.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use tracing::{debug, error, trace};

use pipelet_core::id::NodeId;
use pipelet_core::operation::{Operation, TxId, TxMeta};
use pipelet_core::value::Key;

use crate::error::{Result, TxError};
use crate::recombine::recombine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Open,
    WaitingForks,
    Closed,
    Cancelled,
}

/// What the join should do with a received operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Receipt {
    /// Not part of a pending transaction; forward as is.
    Passthrough(Operation),
    /// Held until the transaction completes.
    Buffered,
    /// The transaction completed; forward these instead.
    Closed(Vec<Operation>),
}

#[derive(Debug)]
struct Pending {
    state: TxState,
    ops: Vec<Operation>,
    meta: TxMeta,
    /// Branches a forked transaction waits for.
    waiting: Vec<NodeId>,
    finished: HashSet<NodeId>,
    started: Instant,
}

impl Pending {
    fn merge_meta(&mut self, meta: &TxMeta) {
        for f in &meta.forks {
            if !self.meta.forks.contains(f) {
                self.meta.forks.push(f.clone());
            }
        }
    }

    fn complete(&self) -> bool {
        match self.state {
            TxState::WaitingForks => self.waiting.iter().all(|b| self.finished.contains(b)),
            _ => false,
        }
    }
}

const HISTORY: usize = 1024;

#[derive(Debug)]
pub struct Coordinator {
    key: Key,
    tag: Option<String>,
    timeout: Option<Duration>,
    pending: IndexMap<TxId, Pending>,
    history: IndexMap<TxId, TxState>,
}

impl Coordinator {
    pub fn new(key: Key, tag: Option<String>, timeout: Option<Duration>) -> Self {
        Self {
            key,
            tag,
            timeout,
            pending: IndexMap::new(),
            history: IndexMap::new(),
        }
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    fn forked_here(&self, meta: &TxMeta) -> bool {
        self.tag.as_deref().is_some_and(|t| meta.has_fork(t))
    }

    /// Receive `op` from `branch`; `branches` are the join's current inputs.
    pub fn receive(
        &mut self,
        branch: NodeId,
        branches: &[NodeId],
        op: Operation,
        now: Instant,
    ) -> Receipt {
        let Some(meta) = op.tx().cloned() else {
            return Receipt::Passthrough(op);
        };
        let forked = self.forked_here(&meta);

        if !forked && !meta.more && !self.pending.contains_key(&meta.id) {
            self.remember(meta.id.clone(), TxState::Closed);
            return Receipt::Passthrough(op);
        }

        let pending = self.pending.entry(meta.id.clone()).or_insert_with(|| {
            trace!(tx = %meta.id, "transaction opened");
            Pending {
                state: TxState::Open,
                ops: Vec::new(),
                meta: meta.clone(),
                waiting: Vec::new(),
                finished: HashSet::new(),
                started: now,
            }
        });
        pending.merge_meta(&meta);
        if forked && pending.state == TxState::Open {
            pending.state = TxState::WaitingForks;
            pending.waiting = branches.to_vec();
        }
        if !meta.more {
            pending.finished.insert(branch);
        }
        if !op.is_empty() {
            pending.ops.push(op);
        }

        let done = match pending.state {
            TxState::WaitingForks => pending.complete(),
            _ => !meta.more,
        };
        if !done {
            return Receipt::Buffered;
        }
        self.close(&meta.id)
    }

    fn close(&mut self, id: &TxId) -> Receipt {
        let Some(pending) = self.pending.shift_remove(id) else {
            return Receipt::Buffered;
        };
        let mut meta = pending.meta;
        meta.more = false;
        let out = recombine(&pending.ops, &self.key, &meta, self.tag.as_deref());
        debug!(tx = %id, buffered = pending.ops.len(), emitted = out.len(), "transaction closed");
        self.remember(id.clone(), TxState::Closed);
        Receipt::Closed(out)
    }

    /// Cancel a pending transaction, discarding its buffer. Returns the
    /// closing no-op to forward so joins further down are not starved.
    pub fn cancel(&mut self, id: &TxId, reason: &str) -> Result<Operation> {
        let Some(pending) = self.pending.shift_remove(id) else {
            return Err(match self.history.get(id) {
                Some(_) => TxError::Closed(id.to_string()),
                None => TxError::Unknown(id.to_string()),
            });
        };
        error!(
            tx = %id,
            reason,
            buffered = pending.ops.len(),
            ops = ?pending.ops,
            "transaction cancelled"
        );
        let mut forks = pending.meta.forks;
        if let Some(tag) = &self.tag {
            forks.retain(|f| f != tag);
        }
        self.remember(id.clone(), TxState::Cancelled);
        Ok(Operation::add(Vec::new()).with_tx(TxMeta {
            id: id.clone(),
            more: false,
            forks,
        }))
    }

    /// Cancel every transaction older than the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<Operation> {
        let Some(timeout) = self.timeout else {
            return Vec::new();
        };
        let overdue: Vec<TxId> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.started) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        overdue
            .iter()
            .filter_map(|id| self.cancel(id, "timeout").ok())
            .collect()
    }

    /// Earliest instant at which `expire` would cancel something.
    pub fn next_deadline(&self) -> Option<Instant> {
        let timeout = self.timeout?;
        self.pending.values().map(|p| p.started + timeout).min()
    }

    /// A branch left the join; forked transactions stop waiting for it.
    pub fn branch_removed(&mut self, branch: NodeId) -> Vec<Operation> {
        let mut ready = Vec::new();
        for (id, p) in self.pending.iter_mut() {
            if p.state == TxState::WaitingForks {
                p.waiting.retain(|b| *b != branch);
                if p.complete() {
                    ready.push(id.clone());
                }
            }
        }
        ready
            .iter()
            .flat_map(|id| match self.close(id) {
                Receipt::Closed(ops) => ops,
                _ => Vec::new(),
            })
            .collect()
    }

    pub fn state(&self, id: &TxId) -> Option<TxState> {
        self.pending
            .get(id)
            .map(|p| p.state)
            .or_else(|| self.history.get(id).copied())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn remember(&mut self, id: TxId, state: TxState) {
        self.history.insert(id, state);
        while self.history.len() > HISTORY {
            self.history.shift_remove_index(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(j: serde_json::Value) -> pipelet_core::Value {
        pipelet_core::Value::from_json(j).unwrap()
    }

    #[test]
    fn unforked_transaction_closes_on_last() {
        let mut c = Coordinator::new(Key::default(), None, None);
        let now = Instant::now();
        let b = NodeId::new(1);
        let id = TxId::new("t");
        let first = Operation::add(vec![v(json!({"id": 1}))]).with_tx(TxMeta::new(id.clone(), true));
        assert_eq!(c.receive(b, &[b], first, now), Receipt::Buffered);
        assert_eq!(c.state(&id), Some(TxState::Open));
        let last = Operation::add(vec![v(json!({"id": 2}))]).with_tx(TxMeta::new(id.clone(), false));
        let Receipt::Closed(ops) = c.receive(b, &[b], last, now) else {
            panic!("expected close");
        };
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].change.len(), 2);
        assert_eq!(c.state(&id), Some(TxState::Closed));
    }

    #[test]
    fn timeout_cancels_with_closing_noop() {
        let mut c = Coordinator::new(Key::default(), Some("f".into()), Some(Duration::from_millis(10)));
        let start = Instant::now();
        let (a, b) = (NodeId::new(1), NodeId::new(2));
        let id = TxId::new("t");
        let op = Operation::add(vec![v(json!({"id": 1}))])
            .with_tx(TxMeta::new(id.clone(), false).with_fork("f").with_fork("g"));
        assert_eq!(c.receive(a, &[a, b], op, start), Receipt::Buffered);
        assert_eq!(c.state(&id), Some(TxState::WaitingForks));
        assert!(c.expire(start + Duration::from_millis(5)).is_empty());

        let out = c.expire(start + Duration::from_millis(10));
        assert_eq!(out.len(), 1);
        assert!(out[0].is_empty() && out[0].closes_tx());
        assert_eq!(out[0].tx().unwrap().forks, vec!["g".to_string()]);
        assert_eq!(c.state(&id), Some(TxState::Cancelled));
        assert!(matches!(c.cancel(&id, "again"), Err(TxError::Closed(_))));
    }
}
