//! Fan-in. With a `tag`, transactions forked under that tag are held until
//! every input has closed its branch, then released recombined.

use std::any::Any;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value as Json;

use pipelet_core::config::GraphConfig;
use pipelet_core::id::NodeId;
use pipelet_core::operation::Operation;
use pipelet_core::value::Key;
use pipelet_tx::{Coordinator, Receipt};

use crate::traits::{Ctx, OpError, Pipelet, Result};

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UnionOptions {
    pub tag: Option<String>,
    pub timeout_ms: Option<u64>,
    pub key: Option<Vec<String>>,
}

pub struct Union {
    join: Option<Coordinator>,
}

impl Union {
    pub fn new(join: Option<Coordinator>) -> Self {
        Self { join }
    }

    pub fn from_options(options: &Json, config: &GraphConfig) -> Result<Self> {
        let opts: UnionOptions = if options.is_null() {
            UnionOptions::default()
        } else {
            serde_json::from_value(options.clone()).map_err(|e| OpError::options("union", e))?
        };
        let join = opts.tag.map(|tag| {
            let key = opts.key.clone().map(Key::new).unwrap_or_else(|| config.key());
            let timeout = opts.timeout_ms.map(Duration::from_millis).or(config.tx_timeout());
            Coordinator::new(key, Some(tag), timeout)
        });
        Ok(Self::new(join))
    }

    /// Join transactions forked under `tag`. Returns false when this union
    /// already joins on a different tag.
    pub fn join_on(&mut self, tag: &str, key: Key, timeout: Option<Duration>) -> bool {
        match &self.join {
            Some(join) => join.tag() == Some(tag),
            None => {
                self.join = Some(Coordinator::new(key, Some(tag.to_string()), timeout));
                true
            }
        }
    }

    pub fn coordinator(&self) -> Option<&Coordinator> {
        self.join.as_ref()
    }
}

/// Shared by `union` and `optimize`.
pub(crate) fn join_receive(join: &mut Coordinator, op: Operation, ctx: &Ctx<'_>) -> Vec<Operation> {
    let branch = ctx.source.unwrap_or(ctx.node);
    match join.receive(branch, ctx.inputs, op, ctx.now) {
        Receipt::Passthrough(op) => vec![op],
        Receipt::Buffered => Vec::new(),
        Receipt::Closed(ops) => ops,
    }
}

impl Pipelet for Union {
    fn name(&self) -> &str {
        "union"
    }

    fn listen(&mut self, op: Operation, ctx: &mut Ctx<'_>) -> Result<Vec<Operation>> {
        Ok(match self.join.as_mut() {
            Some(join) => join_receive(join, op, ctx),
            None => vec![op],
        })
    }

    fn input_disconnected(&mut self, input: NodeId) -> Vec<Operation> {
        match self.join.as_mut() {
            Some(join) => join.branch_removed(input),
            None => Vec::new(),
        }
    }

    fn tick(&mut self, ctx: &mut Ctx<'_>) -> Vec<Operation> {
        match self.join.as_mut() {
            Some(join) => join.expire(ctx.now),
            None => Vec::new(),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
