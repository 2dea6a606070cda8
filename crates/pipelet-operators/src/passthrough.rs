//! Forwards everything; lazy, so it only subscribes to what downstream asks for.

use std::any::Any;

use pipelet_core::operation::Operation;

use crate::traits::{Ctx, Pipelet, Result};

#[derive(Debug, Default)]
pub struct Passthrough;

impl Pipelet for Passthrough {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn listen(&mut self, op: Operation, _ctx: &mut Ctx<'_>) -> Result<Vec<Operation>> {
        Ok(vec![op])
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
