//! Query and term data types plus the query algebra (merge/difference/apply).
//!
//! Grammar (JSON):
//!
//! ```json
//! [ { "flow": "orders", "amount": [">", 10, "&&", "<=", 100] },
//!   { "user": { "id": ["$", ".user_id"] }, "name": ["match", "^a"] } ]
//! ```
//!
//! - a literal is an equality constraint;
//! - an object is a nested term applied to the attribute's object value;
//! - an array is an expression (see [`crate::matcher`]);
//! - `["$", path]` refers to an attribute of the companion value;
//! - a key starting with `_` constrains the companion's attribute instead.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use pipelet_core::value::{lookup_path, Value};

use crate::error::{QueryError, Result};
use crate::matcher::{is_companion_ref, takes_operand};

/// One conjunction of attribute constraints. `{}` matches every value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Term(Map<String, Json>);

impl Term {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn from_json(json: Json) -> Result<Self> {
        match json {
            Json::Object(map) => Ok(Self(map)),
            other => Err(QueryError::InvalidTerm(format!(
                "expected an object, got {}",
                other
            ))),
        }
    }

    pub fn with(mut self, attr: impl Into<String>, constraint: impl Into<Json>) -> Self {
        self.0.insert(attr.into(), constraint.into());
        self
    }

    pub fn constraints(&self) -> &Map<String, Json> {
        &self.0
    }

    /// The empty term matches everything.
    pub fn is_any(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable string form; attribute order is canonical so equal terms encode equally.
    pub fn canonical(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| format!("{:?}", self.0))
    }
}

impl From<Map<String, Json>> for Term {
    fn from(map: Map<String, Json>) -> Self {
        Self(map)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Ordered disjunction of terms. `[]` subscribes to nothing, `[{}]` to everything.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Query(Vec<Term>);

impl Query {
    pub fn new(terms: Vec<Term>) -> Self {
        Self(terms)
    }

    pub fn nothing() -> Self {
        Self(Vec::new())
    }

    pub fn everything() -> Self {
        Self(vec![Term::new()])
    }

    pub fn from_json(json: Json) -> Result<Self> {
        match json {
            Json::Array(items) => items
                .into_iter()
                .map(Term::from_json)
                .collect::<Result<Vec<_>>>()
                .map(Self),
            Json::Null => Ok(Self::nothing()),
            other => Err(QueryError::InvalidTerm(format!(
                "a query is an array of terms, got {}",
                other
            ))),
        }
    }

    pub fn terms(&self) -> &[Term] {
        &self.0
    }

    pub fn into_terms(self) -> Vec<Term> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_everything(&self) -> bool {
        self.0.iter().any(Term::is_any)
    }

    pub fn contains(&self, term: &Term) -> bool {
        self.0.contains(term)
    }

    /// Resolve companion references against `companion`, producing a plain
    /// query that no longer needs a companion at match time. `_`-prefixed
    /// constraints are decided now: satisfied ones are dropped from the term,
    /// a failed one drops the whole term.
    pub fn bind(&self, companion: &Value) -> Result<Query> {
        let mut out = Vec::with_capacity(self.0.len());
        'terms: for term in &self.0 {
            let mut bound = Map::new();
            for (attr, constraint) in term.constraints() {
                if let Some(target) = attr.strip_prefix('_') {
                    let probe = Term::new().with(target, constraint.clone());
                    let matcher = crate::matcher::compile(&Query::new(vec![probe]))?;
                    if matcher.matches(companion) {
                        continue;
                    }
                    continue 'terms;
                }
                bound.insert(attr.clone(), bind_constraint(constraint, companion));
            }
            let bound = Term(bound);
            if !out.contains(&bound) {
                out.push(bound);
            }
        }
        Ok(Query(out))
    }
}

fn resolve_ref(reference: &[Json], companion: &Value) -> Json {
    reference
        .get(1)
        .and_then(Json::as_str)
        .and_then(|path| lookup_path(companion.attributes(), path))
        .cloned()
        .unwrap_or(Json::Null)
}

fn bind_constraint(constraint: &Json, companion: &Value) -> Json {
    match constraint {
        Json::Array(items) if is_companion_ref(items) => match resolve_ref(items, companion) {
            literal @ (Json::Array(_) | Json::Object(_)) => Json::Array(vec!["==".into(), literal]),
            literal => literal,
        },
        Json::Array(items) => Json::Array(bind_expression(items, companion)),
        Json::Object(map) => Json::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), bind_constraint(v, companion)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn bind_expression(items: &[Json], companion: &Value) -> Vec<Json> {
    let mut out = Vec::with_capacity(items.len());
    let mut operand_next = false;
    for item in items {
        let bound = match item {
            Json::Array(inner) if is_companion_ref(inner) => {
                let literal = resolve_ref(inner, companion);
                if operand_next || !matches!(literal, Json::Array(_) | Json::Object(_)) {
                    literal
                } else {
                    Json::Array(vec!["==".into(), literal])
                }
            }
            Json::Array(inner) if !operand_next => Json::Array(bind_expression(inner, companion)),
            other => other.clone(),
        };
        operand_next = !operand_next && item.as_str().is_some_and(takes_operand);
        out.push(bound);
    }
    out
}

impl From<Vec<Term>> for Query {
    fn from(terms: Vec<Term>) -> Self {
        Self(terms)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

/// A query update: terms to withdraw, then terms to add.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryChanges {
    #[serde(default)]
    pub removes: Vec<Term>,
    #[serde(default)]
    pub adds: Vec<Term>,
}

impl QueryChanges {
    pub fn new(removes: Vec<Term>, adds: Vec<Term>) -> Self {
        Self { removes, adds }
    }

    pub fn adding(terms: Vec<Term>) -> Self {
        Self::new(Vec::new(), terms)
    }

    pub fn removing(terms: Vec<Term>) -> Self {
        Self::new(terms, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.removes.is_empty() && self.adds.is_empty()
    }

    /// The update that undoes this one.
    pub fn invert(&self) -> Self {
        Self::new(self.adds.clone(), self.removes.clone())
    }
}

/// Union of two queries: `a`'s terms in order, then terms of `b` not already
/// present. A catch-all term anywhere collapses the result to `[{}]`.
pub fn merge(a: &Query, b: &Query) -> Query {
    if a.is_everything() || b.is_everything() {
        return Query::everything();
    }
    let mut terms = a.0.clone();
    for t in &b.0 {
        if !terms.contains(t) {
            terms.push(t.clone());
        }
    }
    Query(terms)
}

/// Minimal edit turning `a` into `b`: removes in `a`'s order, adds in `b`'s order.
/// Duplicate terms are counted, so multiset differences come out right too.
pub fn difference(a: &Query, b: &Query) -> QueryChanges {
    let mut budget: HashMap<String, isize> = HashMap::new();
    for t in &b.0 {
        *budget.entry(t.canonical()).or_default() += 1;
    }
    let mut removes = Vec::new();
    for t in &a.0 {
        let slot = budget.entry(t.canonical()).or_default();
        if *slot > 0 {
            *slot -= 1;
        } else {
            removes.push(t.clone());
        }
    }

    let mut have: HashMap<String, isize> = HashMap::new();
    for t in &a.0 {
        *have.entry(t.canonical()).or_default() += 1;
    }
    let mut adds = Vec::new();
    for t in &b.0 {
        let slot = have.entry(t.canonical()).or_default();
        if *slot > 0 {
            *slot -= 1;
        } else {
            adds.push(t.clone());
        }
    }
    QueryChanges { removes, adds }
}

/// Apply `changes` to `q`: each remove withdraws one matching term, adds are appended.
pub fn apply(q: &Query, changes: &QueryChanges) -> Query {
    let mut terms = q.0.clone();
    for r in &changes.removes {
        if let Some(pos) = terms.iter().position(|t| t == r) {
            terms.remove(pos);
        }
    }
    terms.extend(changes.adds.iter().cloned());
    Query(terms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn q(j: Json) -> Query {
        Query::from_json(j).unwrap()
    }

    #[test]
    fn merge_keeps_order_and_collapses() {
        let a = q(json!([{"flow": "a"}, {"flow": "b"}]));
        let b = q(json!([{"flow": "c"}, {"flow": "a"}]));
        assert_eq!(merge(&a, &b), q(json!([{"flow": "a"}, {"flow": "b"}, {"flow": "c"}])));
        assert_eq!(merge(&a, &Query::everything()), Query::everything());
        assert_eq!(merge(&Query::nothing(), &Query::nothing()), Query::nothing());
    }

    #[test]
    fn difference_is_minimal() {
        let a = q(json!([{"flow": "a"}, {"flow": "b"}]));
        let b = q(json!([{"flow": "b"}, {"flow": "c"}]));
        let d = difference(&a, &b);
        assert_eq!(d.removes, q(json!([{"flow": "a"}])).into_terms());
        assert_eq!(d.adds, q(json!([{"flow": "c"}])).into_terms());
        assert!(difference(&apply(&a, &d), &b).is_empty());
    }

    #[test]
    fn bind_resolves_companion() {
        let companion = Value::from_json(json!({"id": 3, "kind": "x"})).unwrap();
        let query = q(json!([
            {"customer": ["$", ".id"], "_kind": "x"},
            {"customer": ["$", "id"], "_kind": "y"},
            {"amount": [">", ["$", "id"], "||", ["$", "missing"]]}
        ]));
        let bound = query.bind(&companion).unwrap();
        assert_eq!(
            bound,
            q(json!([
                {"customer": 3},
                {"amount": [">", 3, "||", null]}
            ]))
        );
    }

    #[test]
    fn rejects_non_array_queries() {
        assert!(Query::from_json(json!({"flow": "a"})).is_err());
        assert_eq!(Query::from_json(Json::Null).unwrap(), Query::nothing());
    }
}
