//! The incremental operation protocol.
//!
//! Wire shape (used in-process and over the crossover):
//!
//! ```json
//! { "operation": "update",
//!   "values": [[{"id": 1, "v": "a"}, {"id": 1, "v": "b"}]],
//!   "options": { "_t": { "id": "…", "more": false, "forks": ["dispatch"] } } }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::value::Value;

/// Transaction identifier. Producers mint uuids; any string is accepted on input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(String);

impl TxId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transaction metadata carried in `options._t`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxMeta {
    pub id: TxId,
    /// More operations for this id are coming on this branch.
    #[serde(default)]
    pub more: bool,
    /// Fork tags a join point must rejoin before the transaction is complete.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forks: Vec<String>,
}

impl TxMeta {
    pub fn new(id: TxId, more: bool) -> Self {
        Self {
            id,
            more,
            forks: Vec::new(),
        }
    }

    pub fn with_fork(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !self.forks.contains(&tag) {
            self.forks.push(tag);
        }
        self
    }

    pub fn has_fork(&self, tag: &str) -> bool {
        self.forks.iter().any(|f| f == tag)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Options {
    #[serde(rename = "_t", default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TxMeta>,
}

impl Options {
    pub fn with_tx(meta: TxMeta) -> Self {
        Self {
            transaction: Some(meta),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.transaction.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Add,
    Remove,
    Update,
    Clear,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpKind::Add => "add",
            OpKind::Remove => "remove",
            OpKind::Update => "update",
            OpKind::Clear => "clear",
        };
        f.write_str(s)
    }
}

/// Payload of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase")]
pub enum Change {
    Add { values: Vec<Value> },
    Remove { values: Vec<Value> },
    /// `(old, new)` pairs; distinct identities denote a rename.
    Update { values: Vec<(Value, Value)> },
    Clear,
}

impl Change {
    pub fn kind(&self) -> OpKind {
        match self {
            Change::Add { .. } => OpKind::Add,
            Change::Remove { .. } => OpKind::Remove,
            Change::Update { .. } => OpKind::Update,
            Change::Clear => OpKind::Clear,
        }
    }

    /// Number of values (pairs count once).
    pub fn len(&self) -> usize {
        match self {
            Change::Add { values } | Change::Remove { values } => values.len(),
            Change::Update { values } => values.len(),
            Change::Clear => 0,
        }
    }

    /// A clear is never empty: it carries meaning without values.
    pub fn is_empty(&self) -> bool {
        !matches!(self, Change::Clear) && self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(flatten)]
    pub change: Change,
    #[serde(default, skip_serializing_if = "Options::is_empty")]
    pub options: Options,
}

impl Operation {
    pub fn new(change: Change, options: Options) -> Self {
        Self { change, options }
    }

    pub fn add(values: Vec<Value>) -> Self {
        Self::new(Change::Add { values }, Options::default())
    }

    pub fn remove(values: Vec<Value>) -> Self {
        Self::new(Change::Remove { values }, Options::default())
    }

    pub fn update(values: Vec<(Value, Value)>) -> Self {
        Self::new(Change::Update { values }, Options::default())
    }

    pub fn clear() -> Self {
        Self::new(Change::Clear, Options::default())
    }

    pub fn with_tx(mut self, meta: TxMeta) -> Self {
        self.options.transaction = Some(meta);
        self
    }

    pub fn kind(&self) -> OpKind {
        self.change.kind()
    }

    pub fn tx(&self) -> Option<&TxMeta> {
        self.options.transaction.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.change.is_empty()
    }

    /// True when this operation ends its transaction on the current branch.
    pub fn closes_tx(&self) -> bool {
        self.tx().is_some_and(|t| !t.more)
    }

    /// Same options, different payload.
    pub fn derive(&self, change: Change) -> Self {
        Self::new(change, self.options.clone())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), self.change.len())?;
        if let Some(t) = self.tx() {
            write!(f, " tx={} more={}", t.id, t.more)?;
        }
        Ok(())
    }
}
