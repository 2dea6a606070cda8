//! Helpers shared by the integration tests.

#![allow(dead_code)]

use pipelet_core::Value;
use pipelet_query::Query;
use serde_json::Value as Json;

pub fn v(j: Json) -> Value {
    Value::from_json(j).expect("test values are objects")
}

pub fn vs(items: Json) -> Vec<Value> {
    match items {
        Json::Array(items) => items.into_iter().map(v).collect(),
        other => vec![v(other)],
    }
}

pub fn q(j: Json) -> Query {
    Query::from_json(j).expect("test queries are valid")
}
