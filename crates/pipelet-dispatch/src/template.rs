//! Declarative branches: a list of node specs instantiated per control value.
//!
//! - `$source` as an input names the branch view.
//! - Other inputs name earlier nodes of the same template, then graph nodes.
//! - String options of the form `{{attr}}` are replaced by the control
//!   value's attribute (the JSON value itself when the whole string is one
//!   placeholder, its text otherwise).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

use pipelet_core::config::GraphConfig;
use pipelet_core::id::NodeId;
use pipelet_core::value::Value;
use pipelet_operators::{Graph, Registry};

use crate::builder::{Branch, BranchBuilder};
use crate::error::{DispatchError, Result};

pub const SOURCE_INPUT: &str = "$source";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchNode {
    pub name: String,
    pub pipelet: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub options: Json,
}

pub struct TemplateBuilder {
    registry: Registry,
    config: GraphConfig,
    nodes: Vec<BranchNode>,
    output: Option<String>,
}

impl TemplateBuilder {
    /// `output` defaults to the last node.
    pub fn new(registry: Registry, config: GraphConfig, nodes: Vec<BranchNode>, output: Option<String>) -> Self {
        Self {
            registry,
            config,
            nodes,
            output,
        }
    }
}

impl BranchBuilder for TemplateBuilder {
    fn build(&mut self, graph: &mut Graph, view: NodeId, control: &Value, prefix: &str) -> Result<Branch> {
        let mut local: HashMap<&str, NodeId> = HashMap::new();
        let mut created = Vec::with_capacity(self.nodes.len());
        for spec in &self.nodes {
            let options = substitute(&spec.options, control);
            let pipelet = self.registry.make(&spec.pipelet, &options, &self.config)?;
            let id = graph.add_node(format!("{}/{}", prefix, spec.name), pipelet)?;
            created.push(id);
            local.insert(spec.name.as_str(), id);
            for input in &spec.inputs {
                let from = if input == SOURCE_INPUT {
                    view
                } else if let Some(&n) = local.get(input.as_str()) {
                    n
                } else {
                    graph
                        .node_id(input)
                        .ok_or_else(|| DispatchError::UnknownNode(input.clone()))?
                };
                graph.connect(from, id)?;
            }
        }
        let output = match &self.output {
            Some(name) => *local
                .get(name.as_str())
                .ok_or_else(|| DispatchError::Template(format!("output '{}' is not a template node", name)))?,
            None => match created.last() {
                Some(&last) => last,
                None => return Ok(Branch::view_only(view)),
            },
        };
        debug!(prefix, nodes = created.len(), "template branch built");
        Ok(Branch {
            output,
            nodes: created,
        })
    }
}

fn substitute(options: &Json, control: &Value) -> Json {
    match options {
        Json::String(s) => substitute_str(s, control),
        Json::Array(items) => Json::Array(items.iter().map(|i| substitute(i, control)).collect()),
        Json::Object(map) => Json::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, control)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_str(s: &str, control: &Value) -> Json {
    if let Some(attr) = s.strip_prefix("{{").and_then(|r| r.strip_suffix("}}")) {
        if !attr.contains("{{") {
            return control.get_path(attr.trim()).cloned().unwrap_or(Json::Null);
        }
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let attr = rest[start + 2..start + len].trim();
        match control.get_path(attr) {
            Some(Json::String(text)) => out.push_str(text),
            Some(other) => out.push_str(&other.to_string()),
            None => {}
        }
        rest = &rest[start + len + 2..];
    }
    out.push_str(rest);
    Json::String(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn placeholders_take_control_attributes() {
        let control = Value::from_json(json!({"id": 3, "flow": "orders"})).unwrap();
        let options = json!({
            "query": [{"flow": "{{flow}}", "id": "{{ id }}"}],
            "label": "branch-{{id}}-{{flow}}"
        });
        assert_eq!(
            substitute(&options, &control),
            json!({
                "query": [{"flow": "orders", "id": 3}],
                "label": "branch-3-orders"
            })
        );
    }
}
