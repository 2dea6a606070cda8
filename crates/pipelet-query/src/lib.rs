#![forbid(unsafe_code)]
//! pipelet-query: the query engine.
//!
//! A query is an ordered list of OR-terms; each term is a conjunction of
//! attribute constraints. This crate compiles queries into matchers, computes
//! merges and minimal differences for upstream propagation, keeps refcounted
//! unions of downstream demand and routes values to destinations.

pub mod error;
pub mod matcher;
pub mod query;
pub mod route;
pub mod tree;
pub mod union;

pub use error::{QueryError, Result};
pub use matcher::{compile, Matcher};
pub use query::{apply, difference, merge, Query, QueryChanges, Term};
pub use route::filter_change;
pub use tree::QueryTree;
pub use union::QueryUnion;
