use pipelet_core::operation::{Operation, TxId, TxMeta};

/// Stamps a sequence of operations with one transaction id.
///
/// ```
/// use pipelet_core::Operation;
/// use pipelet_tx::TxBuilder;
///
/// let tx = TxBuilder::new().fork("dispatch");
/// let ops = tx.stamp(vec![Operation::clear(), Operation::add(vec![])]);
/// assert!(ops[0].tx().unwrap().more);
/// assert!(ops[1].closes_tx());
/// ```
#[derive(Debug, Clone)]
pub struct TxBuilder {
    id: TxId,
    forks: Vec<String>,
}

impl Default for TxBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TxBuilder {
    pub fn new() -> Self {
        Self::with_id(TxId::generate())
    }

    pub fn with_id(id: TxId) -> Self {
        Self {
            id,
            forks: Vec::new(),
        }
    }

    /// Declare a fork tag every emitted operation carries.
    pub fn fork(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !self.forks.contains(&tag) {
            self.forks.push(tag);
        }
        self
    }

    pub fn id(&self) -> &TxId {
        &self.id
    }

    fn meta(&self, more: bool) -> TxMeta {
        TxMeta {
            id: self.id.clone(),
            more,
            forks: self.forks.clone(),
        }
    }

    pub fn more(&self) -> TxMeta {
        self.meta(true)
    }

    pub fn last(&self) -> TxMeta {
        self.meta(false)
    }

    /// Tag `ops` so that only the last one closes the transaction.
    pub fn stamp(&self, ops: Vec<Operation>) -> Vec<Operation> {
        let n = ops.len();
        ops.into_iter()
            .enumerate()
            .map(|(i, op)| op.with_tx(self.meta(i + 1 < n)))
            .collect()
    }
}
