#![forbid(unsafe_code)]
//! pipelet-dispatch: fan a shared source out into per-key branches.
//!
//! A `Dispatcher` node listens to a control dataflow. Every control value
//! gets its own branch: a view of the source (filtered by the value's `query`
//! when it has one) followed by whatever the `BranchBuilder` wires after it.
//! Branch outputs meet again in a gatherer node, or loop back into the source.
//! With a fork `tag`, transactions entering a branch carry the tag and a
//! gatherer `union` joins them back into one.

pub mod builder;
pub mod dispatcher;
pub mod error;
pub mod template;
pub mod view;

pub use builder::{Branch, BranchBuilder};
pub use dispatcher::{Dispatcher, DispatcherOptions, NodeRef};
pub use error::{DispatchError, Result};
pub use template::{BranchNode, TemplateBuilder};
pub use view::ForkedView;

use pipelet_operators::{OpError, Registry};

/// Register the `dispatch` pipelet. Templates resolve their pipelets against
/// a snapshot of `registry` taken now, so register everything templates need
/// first.
pub fn register(registry: &mut Registry) {
    let snapshot = registry.clone();
    registry.register("dispatch", move |options, config| {
        let opts: DispatcherOptions = serde_json::from_value(options.clone())
            .map_err(|e| OpError::options("dispatch", e))?;
        Ok(Box::new(Dispatcher::from_options(opts, snapshot.clone(), config)))
    });
}
