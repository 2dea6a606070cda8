//! Attribute mapping: rename, project and set attributes on every value.

use std::any::Any;
use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value as Json;

use pipelet_core::id::FetchTicket;
use pipelet_core::operation::{Change, Operation};
use pipelet_core::value::Value;
use pipelet_query::Query;

use crate::traits::{Ctx, FetchPlan, OpError, Pipelet, Result};

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MapOptions {
    /// old name -> new name, applied first.
    pub rename: BTreeMap<String, String>,
    /// Keep only these attributes (after renaming). Empty keeps all.
    pub project: Vec<String>,
    /// Attributes to set on every value.
    pub set: BTreeMap<String, Json>,
}

#[derive(Debug, Default)]
pub struct Map {
    opts: MapOptions,
}

impl Map {
    pub fn new(opts: MapOptions) -> Self {
        Self { opts }
    }

    pub fn from_options(options: &Json) -> Result<Self> {
        if options.is_null() {
            return Ok(Self::default());
        }
        let opts = serde_json::from_value(options.clone()).map_err(|e| OpError::options("map", e))?;
        Ok(Self::new(opts))
    }

    pub fn apply(&self, mut value: Value) -> Value {
        for (from, to) in &self.opts.rename {
            if let Some(v) = value.remove(from) {
                value.set(to.clone(), v);
            }
        }
        if !self.opts.project.is_empty() {
            let mut projected = Value::new();
            for attr in &self.opts.project {
                if let Some(v) = value.get(attr) {
                    projected.set(attr.clone(), v.clone());
                }
            }
            value = projected;
        }
        for (attr, v) in &self.opts.set {
            value.set(attr.clone(), v.clone());
        }
        value
    }
}

impl Pipelet for Map {
    fn name(&self) -> &str {
        "map"
    }

    fn upstream_query(&self, downstream: &Query) -> Query {
        // downstream terms refer to mapped attributes
        if downstream.is_empty() {
            Query::nothing()
        } else {
            Query::everything()
        }
    }

    fn listen(&mut self, op: Operation, _ctx: &mut Ctx<'_>) -> Result<Vec<Operation>> {
        let change = match &op.change {
            Change::Add { values } => Change::Add {
                values: values.iter().cloned().map(|v| self.apply(v)).collect(),
            },
            Change::Remove { values } => Change::Remove {
                values: values.iter().cloned().map(|v| self.apply(v)).collect(),
            },
            Change::Update { values } => Change::Update {
                values: values
                    .iter()
                    .cloned()
                    .map(|(o, n)| (self.apply(o), self.apply(n)))
                    .collect(),
            },
            Change::Clear => Change::Clear,
        };
        Ok(vec![op.derive(change)])
    }

    fn fetch_plan(&mut self, _query: &Query, _ticket: FetchTicket) -> FetchPlan {
        FetchPlan::Upstream(Query::everything())
    }

    fn transform_fetched(&self, values: Vec<Value>) -> Vec<Value> {
        values.into_iter().map(|v| self.apply(v)).collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rename_project_set() {
        let map = Map::from_options(&json!({
            "rename": {"uid": "id"},
            "project": ["id", "name"],
            "set": {"flow": "users"}
        }))
        .unwrap();
        let out = map.apply(Value::from_json(json!({"uid": 1, "name": "a", "secret": 2})).unwrap());
        assert_eq!(out.into_json(), json!({"id": 1, "name": "a", "flow": "users"}));
    }
}
