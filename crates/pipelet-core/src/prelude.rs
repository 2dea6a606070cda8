//! Convenient re-exports for downstream crates.

pub use crate::config::GraphConfig;
pub use crate::error::{Error, Result};
pub use crate::hash::{hash_serde, state_digest, Hash256};
pub use crate::id::{FetchTicket, NodeId, RequestId, SubscriptionId};
pub use crate::operation::{Change, OpKind, Operation, Options, TxId, TxMeta};
pub use crate::schema::{error_value, DataType, Field, Schema};
pub use crate::value::{Identity, Key, Value};
