#![forbid(unsafe_code)]
//! pipelet-operators: the plug protocol and the built-in pipelets.
//!
//! Design intent:
//! - The `Graph` is a synchronous arena; nodes are addressed by `NodeId`,
//!   so feedback loops never create ownership cycles.
//! - Every push travels through one FIFO work queue, so operations on an edge
//!   arrive in submission order.
//! - Pipelets own their state; they only talk to each other through
//!   listen/fetch/query updates driven by the graph.

pub mod graph;
pub mod registry;
pub mod traits;

pub mod cache;
pub mod filter;
pub mod map;
pub mod optimize;
pub mod passthrough;
pub mod set;
pub mod union;
pub mod validate;

pub use graph::{Dest, FetchResult, Graph, Requester};
pub use registry::Registry;
pub use traits::{Chunk, Ctx, Demand, FetchPlan, OpError, Pipelet, Result};
