//! YAML graph files.
//!
//! Example:
//! ```yaml
//! config:
//!   key: [flow, id]
//!   tx_timeout_ms: 5000
//! nodes:
//!   - { name: source, pipelet: set }
//!   - name: orders
//!     pipelet: filter
//!     inputs: [source]
//!     options: { query: [ { flow: orders } ] }
//!   - { name: store, pipelet: cache, inputs: [orders] }
//! subscriptions:
//!   - { node: store, query: [ {} ] }
//! ```
//!
//! Inputs may refer to nodes declared later, so feedback loops can be written
//! down directly.

use tracing::debug;

use crate::error::Result;
use crate::plan::GraphPlan;
use crate::rules;

/// Parse and check a graph file.
pub fn parse_yaml_graph(src: &str) -> Result<GraphPlan> {
    let plan: GraphPlan = serde_yaml::from_str(src)?;
    rules::check(&plan)?;
    debug!(nodes = plan.nodes.len(), edges = plan.edges().len(), "graph parsed");
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_nodes_options_and_config() {
        let plan = parse_yaml_graph(
            r#"
config:
  key: [flow, id]
nodes:
  - { name: source, pipelet: set }
  - name: orders
    pipelet: filter
    inputs: [source]
    options: { query: [ { flow: orders } ] }
subscriptions:
  - { node: orders }
"#,
        )
        .unwrap();
        assert_eq!(plan.nodes.len(), 2);
        assert_eq!(plan.edges(), vec![("source", "orders")]);
        assert_eq!(
            plan.node("orders").unwrap().options,
            json!({"query": [{"flow": "orders"}]})
        );
        assert!(plan.subscriptions[0].query.is_everything());
        let cfg = plan.graph_config(Default::default());
        assert_eq!(cfg.key, vec!["flow".to_string(), "id".to_string()]);
        assert_eq!(cfg.fetch_chunk_size, 256);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(parse_yaml_graph("nodes: [ { name: a, pipelet: set, bogus: 1 } ]").is_err());
    }
}
