//! Checked graph descriptions.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use pipelet_core::config::GraphConfig;
use pipelet_query::Query;

/// `config:` block of a graph file. Only the fields present override.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlanConfig {
    pub key: Option<Vec<String>>,
    pub tx_timeout_ms: Option<u64>,
    pub fetch_chunk_size: Option<usize>,
    pub max_propagation_steps: Option<usize>,
    pub crossover_address: Option<String>,
    pub transports: Option<Vec<String>>,
    pub tick_interval_ms: Option<u64>,
}

impl PlanConfig {
    pub fn apply(&self, cfg: &mut GraphConfig) {
        if let Some(key) = &self.key {
            cfg.key = key.clone();
        }
        if let Some(v) = self.tx_timeout_ms {
            cfg.tx_timeout_ms = Some(v);
        }
        if let Some(v) = self.fetch_chunk_size {
            cfg.fetch_chunk_size = v;
        }
        if let Some(v) = self.max_propagation_steps {
            cfg.max_propagation_steps = v;
        }
        if let Some(addr) = &self.crossover_address {
            cfg.crossover_address = Some(addr.clone());
        }
        if let Some(t) = &self.transports {
            cfg.transports = t.clone();
        }
        if let Some(v) = self.tick_interval_ms {
            cfg.tick_interval_ms = v;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSpec {
    pub name: String,
    pub pipelet: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub options: Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionSpec {
    pub node: String,
    #[serde(default = "Query::everything")]
    pub query: Query,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphPlan {
    #[serde(default)]
    pub config: PlanConfig,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionSpec>,
}

impl GraphPlan {
    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// `(from, to)` pairs in declaration order.
    pub fn edges(&self) -> Vec<(&str, &str)> {
        self.nodes
            .iter()
            .flat_map(|n| n.inputs.iter().map(move |i| (i.as_str(), n.name.as_str())))
            .collect()
    }

    /// Environment config with this plan's overrides applied.
    pub fn graph_config(&self, base: GraphConfig) -> GraphConfig {
        let mut cfg = base;
        self.config.apply(&mut cfg);
        cfg
    }
}
