//! Single-input transaction join: holds each transaction until it closes and
//! releases at most one remove, update and add for it.

use std::any::Any;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value as Json;

use pipelet_core::config::GraphConfig;
use pipelet_core::operation::Operation;
use pipelet_core::value::Key;
use pipelet_tx::Coordinator;

use crate::traits::{Ctx, OpError, Pipelet, Result};
use crate::union::join_receive;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizeOptions {
    pub timeout_ms: Option<u64>,
    pub key: Option<Vec<String>>,
}

pub struct Optimize {
    join: Coordinator,
}

impl Optimize {
    pub fn from_options(options: &Json, config: &GraphConfig) -> Result<Self> {
        let opts: OptimizeOptions = if options.is_null() {
            OptimizeOptions::default()
        } else {
            serde_json::from_value(options.clone()).map_err(|e| OpError::options("optimize", e))?
        };
        let key = opts.key.map(Key::new).unwrap_or_else(|| config.key());
        let timeout = opts.timeout_ms.map(Duration::from_millis).or(config.tx_timeout());
        Ok(Self {
            join: Coordinator::new(key, None, timeout),
        })
    }
}

impl Pipelet for Optimize {
    fn name(&self) -> &str {
        "optimize"
    }

    fn listen(&mut self, op: Operation, ctx: &mut Ctx<'_>) -> Result<Vec<Operation>> {
        Ok(join_receive(&mut self.join, op, ctx))
    }

    fn tick(&mut self, ctx: &mut Ctx<'_>) -> Vec<Operation> {
        self.join.expire(ctx.now)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
