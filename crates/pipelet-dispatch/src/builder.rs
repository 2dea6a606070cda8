//! Branch construction seam.

use pipelet_core::id::NodeId;
use pipelet_core::value::Value;
use pipelet_operators::Graph;

use crate::error::Result;

/// What a builder wired for one control value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    /// Node whose output leaves the branch.
    pub output: NodeId,
    /// Every node the builder added, in creation order. Removed in reverse on
    /// teardown.
    pub nodes: Vec<NodeId>,
}

impl Branch {
    /// A branch that is just its view.
    pub fn view_only(view: NodeId) -> Self {
        Self {
            output: view,
            nodes: Vec::new(),
        }
    }
}

/// Builds the part of a branch after its view.
///
/// `prefix` is unique per branch; builders use it to name their nodes. On
/// error the builder should leave nothing behind, but the dispatcher removes
/// nodes named with the prefix anyway.
pub trait BranchBuilder: Send {
    fn build(&mut self, graph: &mut Graph, view: NodeId, control: &Value, prefix: &str) -> Result<Branch>;
}

impl<F> BranchBuilder for F
where
    F: FnMut(&mut Graph, NodeId, &Value, &str) -> Result<Branch> + Send,
{
    fn build(&mut self, graph: &mut Graph, view: NodeId, control: &Value, prefix: &str) -> Result<Branch> {
        self(graph, view, control, prefix)
    }
}
