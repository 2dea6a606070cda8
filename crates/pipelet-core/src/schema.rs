//! Declared value schemas and in-band error values.
//!
//! Validation never throws: offending values are turned into error-flow values
//! (`{flow: "error", code, error_flow, values, errors}`) that travel the graph
//! like any other value.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};

use crate::hash::hash_serde;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int64,
    Float64,
    Utf8,
    Object,
    Array,
    /// Any non-null JSON value.
    Any,
}

impl DataType {
    fn accepts(self, v: &Json) -> bool {
        match self {
            DataType::Boolean => v.is_boolean(),
            DataType::Int64 => v.is_i64() || v.is_u64(),
            DataType::Float64 => v.is_number(),
            DataType::Utf8 => v.is_string(),
            DataType::Object => v.is_object(),
            DataType::Array => v.is_array(),
            DataType::Any => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    #[serde(default)]
    pub nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn field(&self, idx: usize) -> Option<&Field> {
        self.fields.get(idx)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Check `value` against the declared fields. Returns one message per
    /// violation; an empty list means the value is valid. Undeclared
    /// attributes are allowed.
    pub fn validate(&self, value: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        for field in &self.fields {
            match value.get_path(&field.name) {
                None | Some(Json::Null) if field.nullable => {}
                None => errors.push(format!("missing required attribute '{}'", field.name)),
                Some(Json::Null) => errors.push(format!("attribute '{}' is null", field.name)),
                Some(v) if !field.data_type.accepts(v) => errors.push(format!(
                    "attribute '{}' expected {:?}, got {}",
                    field.name, field.data_type, v
                )),
                Some(_) => {}
            }
        }
        errors
    }
}

/// Build an error-flow value. Its `id` is derived from the code and the
/// offending values so the same failure always has the same identity.
pub fn error_value(
    code: &str,
    error_flow: Option<&str>,
    values: Vec<Value>,
    errors: Vec<String>,
) -> Value {
    let digest = hash_serde(&(code, &values))
        .map(|h| h.to_hex())
        .unwrap_or_default();
    let values: Vec<Json> = values.into_iter().map(Value::into_json).collect();
    Value::from(
        json!({
            "id": format!("error:{}:{}", code, &digest[..digest.len().min(16)]),
            "flow": "error",
            "code": code,
            "error_flow": error_flow,
            "values": values,
            "errors": errors,
        })
        .as_object()
        .cloned()
        .unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(j: Json) -> Value {
        Value::from_json(j).unwrap()
    }

    #[test]
    fn reports_each_violation() {
        let schema = Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, false),
            Field::new("note", DataType::Utf8, true),
        ]);
        assert!(schema.validate(&v(json!({"id": 1, "name": "a"}))).is_empty());

        let errors = schema.validate(&v(json!({"id": "x", "note": null})));
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("'id'"));
        assert!(errors[1].contains("missing required attribute 'name'"));
    }

    #[test]
    fn error_values_are_stable() {
        let bad = v(json!({"id": "x"}));
        let a = error_value("invalid", Some("orders"), vec![bad.clone()], vec!["e".into()]);
        let b = error_value("invalid", Some("orders"), vec![bad], vec!["e".into()]);
        assert_eq!(a, b);
        assert_eq!(a.get("flow"), Some(&json!("error")));
        assert_eq!(a.get("error_flow"), Some(&json!("orders")));
    }
}
