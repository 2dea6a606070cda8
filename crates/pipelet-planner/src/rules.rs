//! Wiring rules checked before a plan is built.
//!
//! Cycles are allowed: the graph carries feedback loops (dispatcher loop
//! mode) and bounds propagation at run time.

use std::collections::HashSet;

use tracing::warn;

use crate::error::{PlanError, Result};
use crate::plan::GraphPlan;

pub fn check(plan: &GraphPlan) -> Result<()> {
    let mut names = HashSet::new();
    for node in &plan.nodes {
        if !names.insert(node.name.as_str()) {
            return Err(PlanError::DuplicateNode(node.name.clone()));
        }
        if node.pipelet.trim().is_empty() {
            return Err(PlanError::MissingPipelet(node.name.clone()));
        }
    }
    for node in &plan.nodes {
        let mut seen = HashSet::new();
        for input in &node.inputs {
            if !names.contains(input.as_str()) {
                return Err(PlanError::UnknownInput {
                    node: node.name.clone(),
                    input: input.clone(),
                });
            }
            if !seen.insert(input.as_str()) {
                warn!(node = %node.name, input = %input, "input listed twice");
            }
        }
    }
    for sub in &plan.subscriptions {
        if !names.contains(sub.node.as_str()) {
            return Err(PlanError::UnknownSubscription(sub.node.clone()));
        }
    }
    Ok(())
}

/// Every pipelet named by the plan is one of `known`.
pub fn check_pipelets<'a>(plan: &GraphPlan, known: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let known: HashSet<&str> = known.into_iter().collect();
    for node in &plan.nodes {
        if !known.contains(node.pipelet.as_str()) {
            return Err(PlanError::UnknownPipelet {
                node: node.name.clone(),
                pipelet: node.pipelet.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::NodeSpec;

    fn node(name: &str, pipelet: &str, inputs: &[&str]) -> NodeSpec {
        NodeSpec {
            name: name.into(),
            pipelet: pipelet.into(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            options: serde_json::Value::Null,
        }
    }

    #[test]
    fn cycles_pass_and_dangling_inputs_fail() {
        let mut plan = GraphPlan {
            nodes: vec![node("a", "set", &["b"]), node("b", "passthrough", &["a"])],
            ..Default::default()
        };
        assert!(check(&plan).is_ok());
        plan.nodes.push(node("c", "filter", &["zz"]));
        assert!(matches!(check(&plan), Err(PlanError::UnknownInput { .. })));
    }

    #[test]
    fn duplicates_and_unknown_pipelets_fail() {
        let plan = GraphPlan {
            nodes: vec![node("a", "set", &[]), node("a", "set", &[])],
            ..Default::default()
        };
        assert!(matches!(check(&plan), Err(PlanError::DuplicateNode(_))));

        let plan = GraphPlan {
            nodes: vec![node("a", "sett", &[])],
            ..Default::default()
        };
        assert!(check_pipelets(&plan, ["set", "cache"]).is_err());
    }
}
