//! Keyed values and their identities.
//!
//! A `Value` is an opaque attribute map. Two values denote the same entity iff
//! their projections onto the configured `Key` are equal; non-key attributes
//! never take part in identity.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use std::fmt;

use crate::error::{Error, Result};

/// One record flowing through the graph. Attribute order is canonical
/// (sorted), so equality and serialization are deterministic.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Value(Map<String, Json>);

impl Value {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build a value from a JSON object; anything else is rejected.
    pub fn from_json(json: Json) -> Result<Self> {
        match json {
            Json::Object(map) => Ok(Self(map)),
            other => Err(Error::Value(format!("expected a JSON object, got {}", other))),
        }
    }

    /// Direct attribute lookup.
    pub fn get(&self, attr: &str) -> Option<&Json> {
        self.0.get(attr)
    }

    /// Dotted path lookup (`user.id`). A leading `.` is ignored so that
    /// companion references like `.user_id` resolve the same way.
    pub fn get_path(&self, path: &str) -> Option<&Json> {
        lookup_path(&self.0, path)
    }

    pub fn set(&mut self, attr: impl Into<String>, value: impl Into<Json>) {
        self.0.insert(attr.into(), value.into());
    }

    /// Builder form of [`Value::set`].
    pub fn with(mut self, attr: impl Into<String>, value: impl Into<Json>) -> Self {
        self.set(attr, value);
        self
    }

    pub fn remove(&mut self, attr: &str) -> Option<Json> {
        self.0.remove(attr)
    }

    pub fn attributes(&self) -> &Map<String, Json> {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_json(self) -> Json {
        Json::Object(self.0)
    }
}

impl From<Map<String, Json>> for Value {
    fn from(map: Map<String, Json>) -> Self {
        Self(map)
    }
}

impl TryFrom<Json> for Value {
    type Error = Error;

    fn try_from(json: Json) -> Result<Self> {
        Value::from_json(json)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

/// Dotted path lookup on a raw attribute map. Exact keys win over path
/// splitting, so an attribute literally named `a.b` stays reachable.
pub fn lookup_path<'a>(map: &'a Map<String, Json>, path: &str) -> Option<&'a Json> {
    let path = path.strip_prefix('.').unwrap_or(path);
    if let Some(v) = map.get(path) {
        return Some(v);
    }
    let mut parts = path.split('.');
    let mut cur = map.get(parts.next()?)?;
    for part in parts {
        cur = match cur {
            Json::Object(inner) => inner.get(part)?,
            Json::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

/// Canonical encoding of a value's key projection. Hashable, so it can index
/// per-entity state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered list of identity attributes (default `["id"]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(Vec<String>);

impl Default for Key {
    fn default() -> Self {
        Self(vec!["id".to_string()])
    }
}

impl Key {
    pub fn new<I, S>(attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let attrs: Vec<String> = attrs.into_iter().map(Into::into).collect();
        if attrs.is_empty() {
            Self::default()
        } else {
            Self(attrs)
        }
    }

    pub fn attributes(&self) -> &[String] {
        &self.0
    }

    /// Project `value` onto the key. Missing attributes project to `null`.
    pub fn identity(&self, value: &Value) -> Identity {
        static NULL: Json = Json::Null;
        let projection: Vec<&Json> = self
            .0
            .iter()
            .map(|attr| value.get_path(attr).unwrap_or(&NULL))
            .collect();
        // Serializing plain JSON values cannot fail; fall back to Debug anyway.
        let encoded =
            serde_json::to_string(&projection).unwrap_or_else(|_| format!("{:?}", projection));
        Identity(encoded)
    }

    pub fn same_entity(&self, a: &Value, b: &Value) -> bool {
        self.identity(a) == self.identity(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(j: Json) -> Value {
        Value::from_json(j).unwrap()
    }

    #[test]
    fn identity_ignores_non_key_attributes() {
        let key = Key::default();
        let a = v(json!({"id": 1, "v": "a"}));
        let b = v(json!({"id": 1, "v": "b"}));
        assert_eq!(key.identity(&a), key.identity(&b));
        assert!(key.same_entity(&a, &b));
    }

    #[test]
    fn compound_key_projects_in_order() {
        let key = Key::new(["flow", "id"]);
        let a = v(json!({"flow": "orders", "id": 1}));
        let b = v(json!({"flow": "users", "id": 1}));
        assert_ne!(key.identity(&a), key.identity(&b));
        assert_eq!(key.identity(&a).as_str(), r#"["orders",1]"#);
    }

    #[test]
    fn dotted_paths_resolve_nested_objects() {
        let a = v(json!({"user": {"id": 7, "tags": ["x", "y"]}}));
        assert_eq!(a.get_path("user.id"), Some(&json!(7)));
        assert_eq!(a.get_path(".user.id"), Some(&json!(7)));
        assert_eq!(a.get_path("user.tags.1"), Some(&json!("y")));
        assert_eq!(a.get_path("user.missing"), None);
    }

    #[test]
    fn non_objects_are_rejected() {
        assert!(Value::from_json(json!([1, 2])).is_err());
    }
}
