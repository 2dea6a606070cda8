#![forbid(unsafe_code)]
//! pipelet-core: the shared data model of the pipelet dataflow engine.
//!
//! Everything that crosses a crate boundary lives here: keyed values and their
//! identities, the add/remove/update/clear operation protocol with its
//! transaction metadata, schemas for in-band validation, configuration and
//! canonical hashing. No graph logic, no async, no I/O.

pub mod config;
pub mod error;
pub mod hash;
pub mod id;
pub mod operation;
pub mod prelude;
pub mod schema;
pub mod value;

pub use error::{Error, Result};
pub use operation::{Change, OpKind, Operation, Options, TxId, TxMeta};
pub use value::{Identity, Key, Value};

/// Engine version string, stamped into crossover handshakes and logs.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
