//! Human-readable plan summary (the CLI's `explain`).

use std::fmt::Write;

use crate::plan::GraphPlan;

pub fn explain(plan: &GraphPlan) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "nodes: {}", plan.nodes.len());
    for node in &plan.nodes {
        let _ = write!(out, "  {} [{}]", node.name, node.pipelet);
        if !node.inputs.is_empty() {
            let _ = write!(out, " <- {}", node.inputs.join(", "));
        }
        if !node.options.is_null() {
            let _ = write!(out, " {}", node.options);
        }
        out.push('\n');
    }
    if !plan.subscriptions.is_empty() {
        let _ = writeln!(out, "subscriptions:");
        for sub in &plan.subscriptions {
            let _ = writeln!(out, "  {} {}", sub.node, sub.query);
        }
    }
    out
}
