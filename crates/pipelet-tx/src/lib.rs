#![forbid(unsafe_code)]
//! pipelet-tx: transaction coordination.
//!
//! - `coordinator`: per-transaction state, fork accounting and timeouts.
//! - `recombine`: the join step that folds a transaction's operations into at
//!   most one remove, one update and one add.
//! - `builder`: helpers for producers that mint transactions.

pub mod builder;
pub mod coordinator;
pub mod error;
pub mod recombine;

pub use builder::TxBuilder;
pub use coordinator::{Coordinator, Receipt, TxState};
pub use error::{Result, TxError};
pub use recombine::recombine;
