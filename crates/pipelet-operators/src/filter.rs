//! Query filter.
//!
//! Lets through values matching its query. Updates that cross the filter
//! become removes or adds. Upstream it asks for its own query, and nothing at
//! all while no output wants anything.

use std::any::Any;

use serde::Deserialize;
use serde_json::Value as Json;

use pipelet_core::id::FetchTicket;
use pipelet_core::operation::Operation;
use pipelet_core::value::Value;
use pipelet_query::{compile, filter_change, Matcher, Query};

use crate::traits::{stamp_split, Ctx, FetchPlan, OpError, Pipelet, Result};

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterOptions {
    pub query: Query,
    /// Companion value resolving `["$", path]` operands and `_` constraints.
    pub companion: Option<Value>,
}

#[derive(Debug)]
pub struct Filter {
    query: Query,
    matcher: Matcher,
}

impl Filter {
    pub fn new(query: Query) -> Result<Self> {
        let matcher = compile(&query)?;
        Ok(Self { query, matcher })
    }

    /// Bind companion references first, then compile.
    pub fn with_companion(query: &Query, companion: &Value) -> Result<Self> {
        Self::new(query.bind(companion)?)
    }

    pub fn from_options(options: &Json) -> Result<Self> {
        let opts: FilterOptions =
            serde_json::from_value(options.clone()).map_err(|e| OpError::options("filter", e))?;
        match opts.companion {
            Some(companion) => Self::with_companion(&opts.query, &companion),
            None => Self::new(opts.query),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }
}

impl Pipelet for Filter {
    fn name(&self) -> &str {
        "filter"
    }

    fn upstream_query(&self, downstream: &Query) -> Query {
        if downstream.is_empty() {
            Query::nothing()
        } else {
            self.query.clone()
        }
    }

    fn listen(&mut self, op: Operation, _ctx: &mut Ctx<'_>) -> Result<Vec<Operation>> {
        let changes = filter_change(&self.matcher, &op.change);
        Ok(stamp_split(&op, changes))
    }

    fn fetch_plan(&mut self, _query: &Query, _ticket: FetchTicket) -> FetchPlan {
        FetchPlan::Upstream(self.query.clone())
    }

    fn transform_fetched(&self, mut values: Vec<Value>) -> Vec<Value> {
        values.retain(|v| self.matcher.matches(v));
        values
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
