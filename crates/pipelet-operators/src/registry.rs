//! Pipelet registry: name -> factory.
//!
//! Factories receive the node's JSON options and the graph configuration.
//! Built-ins are registered by [`Registry::with_builtins`]; other crates add
//! their own pipelets (the dispatcher, the crossover) with [`Registry::register`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as Json;

use pipelet_core::config::GraphConfig;

use crate::cache::Cache;
use crate::filter::Filter;
use crate::map::Map;
use crate::optimize::Optimize;
use crate::passthrough::Passthrough;
use crate::set::Set;
use crate::traits::{OpError, Pipelet, Result};
use crate::union::Union;
use crate::validate::Validate;

pub type Factory = Arc<dyn Fn(&Json, &GraphConfig) -> Result<Box<dyn Pipelet>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Registry {
    factories: BTreeMap<String, Factory>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut r = Self::new();
        r.register("set", |o, c| Ok(Box::new(Set::from_options(o, c)?)));
        r.register("cache", |o, c| Ok(Box::new(Cache::from_options(o, c)?)));
        r.register("passthrough", |_, _| Ok(Box::new(Passthrough)));
        r.register("filter", |o, _| Ok(Box::new(Filter::from_options(o)?)));
        r.register("map", |o, _| Ok(Box::new(Map::from_options(o)?)));
        r.register("union", |o, c| Ok(Box::new(Union::from_options(o, c)?)));
        r.register("optimize", |o, c| Ok(Box::new(Optimize::from_options(o, c)?)));
        r.register("validate", |o, _| Ok(Box::new(Validate::from_options(o)?)));
        r
    }

    /// Register (or replace) a factory.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Json, &GraphConfig) -> Result<Box<dyn Pipelet>> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.insert(name.clone(), Arc::new(factory)).is_some() {
            tracing::debug!(pipelet = %name, "factory replaced");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn make(&self, name: &str, options: &Json, config: &GraphConfig) -> Result<Box<dyn Pipelet>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| OpError::UnknownPipelet(name.to_string()))?;
        factory(options, config)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtins_are_registered() {
        let r = Registry::with_builtins();
        let cfg = GraphConfig::default();
        let p = r.make("filter", &json!({"query": [{"flow": "orders"}]}), &cfg).unwrap();
        assert_eq!(p.name(), "filter");
        assert!(r.names().any(|n| n == "validate"));
    }

    #[test]
    fn unknown_names_and_bad_options_fail() {
        let r = Registry::with_builtins();
        let cfg = GraphConfig::default();
        assert!(matches!(
            r.make("nope", &Json::Null, &cfg),
            Err(OpError::UnknownPipelet(_))
        ));
        assert!(matches!(
            r.make("map", &json!({"bogus": 1}), &cfg),
            Err(OpError::Options { .. })
        ));
    }
}
