#![forbid(unsafe_code)]
//! pipelet-exec: runs pipelet graphs.
//!
//! The `Runtime` owns the graph, the pipelet registry and the crossover
//! nodes (one per remote address). It builds graphs from plans, pumps
//! transports, drives transaction timers and applies the resync policy:
//! when a client crossover reports a hard reconnection, every watched cache
//! refetches its inputs and diffs.

pub mod runtime;

pub use runtime::{ExecError, Result, Runtime};
