//! Schema validation. Invalid values are not dropped: they continue as
//! error-flow values whose identity is derived from the offending value, so a
//! later remove of that value removes the matching error too.

use std::any::Any;

use serde::Deserialize;
use serde_json::Value as Json;

use pipelet_core::operation::{Change, Operation};
use pipelet_core::schema::{error_value, Schema};
use pipelet_core::value::Value;
use pipelet_query::Query;

use crate::traits::{stamp_split, Ctx, OpError, Pipelet, Result};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidateOptions {
    pub schema: Schema,
    #[serde(default)]
    pub error_flow: Option<String>,
    #[serde(default = "default_code")]
    pub code: String,
}

fn default_code() -> String {
    "invalid".to_string()
}

pub struct Validate {
    opts: ValidateOptions,
    invalid: usize,
}

impl Validate {
    pub fn new(opts: ValidateOptions) -> Self {
        Self { opts, invalid: 0 }
    }

    pub fn from_options(options: &Json) -> Result<Self> {
        let opts = serde_json::from_value(options.clone()).map_err(|e| OpError::options("validate", e))?;
        Ok(Self::new(opts))
    }

    /// Values turned into error values so far.
    pub fn invalid_count(&self) -> usize {
        self.invalid
    }

    /// The value itself when valid, its error value otherwise.
    fn check(&mut self, value: Value) -> Value {
        let errors = self.opts.schema.validate(&value);
        if errors.is_empty() {
            return value;
        }
        self.invalid += 1;
        tracing::debug!(errors = ?errors, "invalid value");
        error_value(&self.opts.code, self.opts.error_flow.as_deref(), vec![value], errors)
    }
}

impl Pipelet for Validate {
    fn name(&self) -> &str {
        "validate"
    }

    fn upstream_query(&self, downstream: &Query) -> Query {
        if downstream.is_empty() {
            Query::nothing()
        } else {
            Query::everything()
        }
    }

    fn listen(&mut self, op: Operation, _ctx: &mut Ctx<'_>) -> Result<Vec<Operation>> {
        let changes = match &op.change {
            Change::Add { values } => vec![Change::Add {
                values: values.iter().cloned().map(|v| self.check(v)).collect(),
            }],
            Change::Remove { values } => vec![Change::Remove {
                values: values.iter().cloned().map(|v| self.check(v)).collect(),
            }],
            Change::Update { values } => {
                let mut removes = Vec::new();
                let mut updates = Vec::new();
                let mut adds = Vec::new();
                for (old, new) in values.iter().cloned() {
                    let (checked_old, checked_new) = (self.check(old.clone()), self.check(new.clone()));
                    let old_ok = checked_old == old;
                    let new_ok = checked_new == new;
                    if old_ok == new_ok {
                        updates.push((checked_old, checked_new));
                    } else {
                        removes.push(checked_old);
                        adds.push(checked_new);
                    }
                }
                let mut out = Vec::new();
                if !removes.is_empty() {
                    out.push(Change::Remove { values: removes });
                }
                if !updates.is_empty() {
                    out.push(Change::Update { values: updates });
                }
                if !adds.is_empty() {
                    out.push(Change::Add { values: adds });
                }
                out
            }
            Change::Clear => vec![Change::Clear],
        };
        Ok(stamp_split(&op, changes))
    }

    fn transform_fetched(&self, values: Vec<Value>) -> Vec<Value> {
        values
            .into_iter()
            .map(|v| {
                let errors = self.opts.schema.validate(&v);
                if errors.is_empty() {
                    v
                } else {
                    error_value(&self.opts.code, self.opts.error_flow.as_deref(), vec![v], errors)
                }
            })
            .collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
