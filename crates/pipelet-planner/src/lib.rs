#![forbid(unsafe_code)]
//! pipelet-planner: from a YAML graph description to a checked `GraphPlan`.
//!
//! The planner knows nothing about pipelet implementations: a plan names
//! pipelets by registry key and carries their options as JSON. The runtime
//! resolves the names when it builds the graph.

pub mod dsl;
pub mod error;
pub mod explain;
pub mod plan;
pub mod rules;

pub use dsl::yaml::parse_yaml_graph;
pub use error::{PlanError, Result};
pub use explain::explain;
pub use plan::{GraphPlan, NodeSpec, PlanConfig, SubscriptionSpec};
