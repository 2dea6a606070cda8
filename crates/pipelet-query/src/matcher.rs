//! Compiled query matchers.
//!
//! Expression arrays are read left to right:
//!
//! - `"=="`, `"!="`, `">"`, `">="`, `"<"`, `"<="` take the next element as operand;
//! - `"match"` / `"RegExp"` take a regex source string;
//! - `"in"` takes an array of candidates;
//! - `"!"` negates the next atom;
//! - `"&&"` / `"||"` combine atoms, `&&` binding tighter; adjacent atoms are and-ed;
//! - a nested array is a group, `["$", path]` is a companion reference;
//! - any other element is an equality literal.

use std::cmp::Ordering;

use regex::Regex;
use serde_json::{Map, Value as Json};

use pipelet_core::value::{lookup_path, Value};

use crate::error::{QueryError, Result};
use crate::query::{Query, Term};

static NULL: Json = Json::Null;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

fn cmp_op(s: &str) -> Option<CmpOp> {
    Some(match s {
        "==" => CmpOp::Eq,
        "!=" => CmpOp::Ne,
        ">" => CmpOp::Gt,
        ">=" => CmpOp::Ge,
        "<" => CmpOp::Lt,
        "<=" => CmpOp::Le,
        _ => return None,
    })
}

/// Operators that consume the following element as their operand.
pub(crate) fn takes_operand(s: &str) -> bool {
    cmp_op(s).is_some() || matches!(s, "match" | "RegExp" | "in")
}

pub(crate) fn is_companion_ref(items: &[Json]) -> bool {
    items.len() == 2 && items[0].as_str() == Some("$") && items[1].is_string()
}

fn looks_like_operator(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| matches!(c, '=' | '!' | '<' | '>' | '&' | '|' | '~'))
}

#[derive(Debug, Clone)]
enum Operand {
    Literal(Json),
    Companion(String),
}

impl Operand {
    fn parse(json: &Json) -> Self {
        match json {
            Json::Array(items) if is_companion_ref(items) => {
                Operand::Companion(items[1].as_str().unwrap_or_default().to_string())
            }
            other => Operand::Literal(other.clone()),
        }
    }

    fn resolve<'a>(&'a self, companion: Option<&'a Map<String, Json>>) -> &'a Json {
        match self {
            Operand::Literal(j) => j,
            Operand::Companion(path) => companion
                .and_then(|c| lookup_path(c, path))
                .unwrap_or(&NULL),
        }
    }
}

#[derive(Debug, Clone)]
enum Atom {
    Compare(CmpOp, Operand),
    Match(Regex),
    In(Operand),
    Not(Box<Atom>),
    Group(Expr),
}

/// Disjunction of conjunctions of atoms.
#[derive(Debug, Clone)]
struct Expr(Vec<Vec<Atom>>);

#[derive(Debug, Clone)]
enum Test {
    Equals(Operand),
    Nested(Vec<Constraint>),
    Expr(Expr),
}

#[derive(Debug, Clone)]
struct Constraint {
    on_companion: bool,
    path: String,
    test: Test,
}

/// One compiled conjunction.
#[derive(Debug, Clone)]
pub(crate) struct CompiledTerm {
    constraints: Vec<Constraint>,
}

impl CompiledTerm {
    pub(crate) fn matches(&self, value: &Value, companion: Option<&Value>) -> bool {
        eval_all(
            &self.constraints,
            value.attributes(),
            companion.map(Value::attributes),
        )
    }

    /// First plain equality against a scalar literal, usable as a routing index.
    pub(crate) fn index_key(&self) -> Option<(String, String)> {
        self.constraints.iter().find_map(|c| match &c.test {
            Test::Equals(Operand::Literal(lit)) if !c.on_companion => {
                literal_key(lit).map(|k| (c.path.clone(), k))
            }
            _ => None,
        })
    }
}

/// Index key of a scalar; numbers are normalized so `1` and `1.0` collide.
pub(crate) fn literal_key(json: &Json) -> Option<String> {
    match json {
        Json::Null => Some("null".to_string()),
        Json::Bool(b) => Some(format!("b:{}", b)),
        Json::Number(n) => n.as_f64().map(|f| format!("n:{}", f)),
        Json::String(s) => Some(format!("s:{}", s)),
        _ => None,
    }
}

/// A compiled query. The default matcher matches nothing.
#[derive(Debug, Clone, Default)]
pub struct Matcher {
    terms: Vec<CompiledTerm>,
    everything: bool,
}

impl Matcher {
    pub fn everything() -> Self {
        Self {
            terms: Vec::new(),
            everything: true,
        }
    }

    pub fn is_everything(&self) -> bool {
        self.everything
    }

    pub fn is_nothing(&self) -> bool {
        !self.everything && self.terms.is_empty()
    }

    pub fn matches(&self, value: &Value) -> bool {
        self.matches_with(value, None)
    }

    /// Match with a companion (pivot) value for `["$", path]` operands and
    /// `_`-prefixed constraints.
    pub fn matches_with(&self, value: &Value, companion: Option<&Value>) -> bool {
        self.everything || self.terms.iter().any(|t| t.matches(value, companion))
    }
}

/// Compile a query. Fails on unknown operators, dangling `&&`/`||`, missing
/// operands and malformed regexes.
pub fn compile(query: &Query) -> Result<Matcher> {
    if query.is_everything() {
        return Ok(Matcher::everything());
    }
    let terms = query
        .terms()
        .iter()
        .map(compile_term)
        .collect::<Result<Vec<_>>>()?;
    Ok(Matcher {
        terms,
        everything: false,
    })
}

pub(crate) fn compile_term(term: &Term) -> Result<CompiledTerm> {
    Ok(CompiledTerm {
        constraints: parse_constraints(term.constraints())?,
    })
}

fn parse_constraints(map: &Map<String, Json>) -> Result<Vec<Constraint>> {
    map.iter()
        .map(|(attr, json)| {
            let (on_companion, path) = match attr.strip_prefix('_') {
                Some(rest) if !rest.is_empty() => (true, rest.to_string()),
                _ => (false, attr.clone()),
            };
            let test = match json {
                Json::Object(inner) => Test::Nested(parse_constraints(inner)?),
                Json::Array(items) if is_companion_ref(items) => Test::Equals(Operand::parse(json)),
                Json::Array(items) => Test::Expr(parse_expr(items)?),
                literal => Test::Equals(Operand::Literal(literal.clone())),
            };
            Ok(Constraint {
                on_companion,
                path,
                test,
            })
        })
        .collect()
}

fn parse_expr(items: &[Json]) -> Result<Expr> {
    if items.is_empty() {
        return Err(QueryError::InvalidTerm("empty expression".into()));
    }
    let mut any = Vec::new();
    let mut all = Vec::new();
    let mut i = 0;
    // a connective needs an atom on both sides
    let mut after_connective = false;
    while i < items.len() {
        match items[i].as_str() {
            Some(op @ ("||" | "&&")) => {
                if all.is_empty() || after_connective || i + 1 == items.len() {
                    return Err(QueryError::Dangling(op.to_string()));
                }
                if op == "||" {
                    any.push(std::mem::take(&mut all));
                }
                after_connective = true;
                i += 1;
            }
            _ => {
                let (atom, next) = parse_atom(items, i)?;
                all.push(atom);
                after_connective = false;
                i = next;
            }
        }
    }
    any.push(all);
    Ok(Expr(any))
}

fn parse_atom(items: &[Json], i: usize) -> Result<(Atom, usize)> {
    let operand = |op: &str| {
        items
            .get(i + 1)
            .ok_or_else(|| QueryError::MissingOperand(op.to_string()))
    };
    match &items[i] {
        Json::String(s) => match s.as_str() {
            "!" => {
                if i + 1 >= items.len() {
                    return Err(QueryError::MissingOperand("!".into()));
                }
                let (atom, next) = parse_atom(items, i + 1)?;
                Ok((Atom::Not(Box::new(atom)), next))
            }
            "match" | "RegExp" => {
                let source = operand(s)?.as_str().ok_or_else(|| {
                    QueryError::InvalidTerm(format!("'{}' expects a pattern string", s))
                })?;
                Ok((Atom::Match(Regex::new(source)?), i + 2))
            }
            "in" => {
                let candidates = operand(s)?;
                match candidates {
                    Json::Array(_) => Ok((Atom::In(Operand::parse(candidates)), i + 2)),
                    _ => Err(QueryError::InvalidTerm("'in' expects an array".into())),
                }
            }
            op => {
                if let Some(cmp) = cmp_op(op) {
                    Ok((Atom::Compare(cmp, Operand::parse(operand(op)?)), i + 2))
                } else if looks_like_operator(op) {
                    Err(QueryError::UnknownOperator(op.to_string()))
                } else {
                    Ok((Atom::Compare(CmpOp::Eq, Operand::Literal(items[i].clone())), i + 1))
                }
            }
        },
        Json::Array(inner) if is_companion_ref(inner) => {
            Ok((Atom::Compare(CmpOp::Eq, Operand::parse(&items[i])), i + 1))
        }
        Json::Array(inner) => Ok((Atom::Group(parse_expr(inner)?), i + 1)),
        literal => Ok((Atom::Compare(CmpOp::Eq, Operand::Literal(literal.clone())), i + 1)),
    }
}

fn eval_all(
    constraints: &[Constraint],
    map: &Map<String, Json>,
    companion: Option<&Map<String, Json>>,
) -> bool {
    constraints.iter().all(|c| {
        let subject = if c.on_companion {
            companion.and_then(|m| lookup_path(m, &c.path))
        } else {
            lookup_path(map, &c.path)
        };
        match &c.test {
            Test::Equals(op) => json_eq(subject.unwrap_or(&NULL), op.resolve(companion)),
            Test::Nested(inner) => match subject {
                Some(Json::Object(obj)) => eval_all(inner, obj, companion),
                _ => false,
            },
            Test::Expr(expr) => eval_expr(expr, subject.unwrap_or(&NULL), companion),
        }
    })
}

fn eval_expr(expr: &Expr, subject: &Json, companion: Option<&Map<String, Json>>) -> bool {
    expr.0
        .iter()
        .any(|all| all.iter().all(|atom| eval_atom(atom, subject, companion)))
}

fn eval_atom(atom: &Atom, subject: &Json, companion: Option<&Map<String, Json>>) -> bool {
    match atom {
        Atom::Compare(op, operand) => {
            let rhs = operand.resolve(companion);
            match op {
                CmpOp::Eq => json_eq(subject, rhs),
                CmpOp::Ne => !json_eq(subject, rhs),
                CmpOp::Gt => json_cmp(subject, rhs) == Some(Ordering::Greater),
                CmpOp::Ge => matches!(
                    json_cmp(subject, rhs),
                    Some(Ordering::Greater | Ordering::Equal)
                ),
                CmpOp::Lt => json_cmp(subject, rhs) == Some(Ordering::Less),
                CmpOp::Le => matches!(json_cmp(subject, rhs), Some(Ordering::Less | Ordering::Equal)),
            }
        }
        Atom::Match(re) => subject.as_str().is_some_and(|s| re.is_match(s)),
        Atom::In(operand) => match operand.resolve(companion) {
            Json::Array(candidates) => candidates.iter().any(|c| json_eq(subject, c)),
            _ => false,
        },
        Atom::Not(inner) => !eval_atom(inner, subject, companion),
        Atom::Group(expr) => eval_expr(expr, subject, companion),
    }
}

fn json_eq(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn json_cmp(a: &Json, b: &Json) -> Option<Ordering> {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Json::String(x), Json::String(y)) => Some(x.cmp(y)),
        (Json::Bool(x), Json::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn m(j: Json) -> Matcher {
        compile(&Query::from_json(j).unwrap()).unwrap()
    }

    fn v(j: Json) -> Value {
        Value::from_json(j).unwrap()
    }

    #[test]
    fn literal_nested_and_dotted() {
        let matcher = m(json!([{"flow": "orders", "user": {"id": 7}}, {"meta.tag": "x"}]));
        assert!(matcher.matches(&v(json!({"flow": "orders", "user": {"id": 7.0}}))));
        assert!(!matcher.matches(&v(json!({"flow": "orders", "user": 7}))));
        assert!(matcher.matches(&v(json!({"meta": {"tag": "x"}}))));
        assert!(!matcher.matches(&v(json!({"flow": "users"}))));
    }

    #[test]
    fn expressions_respect_precedence() {
        // amount > 10 && amount < 20 || amount == 0
        let matcher = m(json!([{"amount": [">", 10, "&&", "<", 20, "||", "==", 0]}]));
        assert!(matcher.matches(&v(json!({"amount": 15}))));
        assert!(matcher.matches(&v(json!({"amount": 0}))));
        assert!(!matcher.matches(&v(json!({"amount": 25}))));
        assert!(!matcher.matches(&v(json!({}))));

        let grouped = m(json!([{"n": ["!", [1, "||", 2], "in", [1, 2, 3, 4]]}]));
        assert!(grouped.matches(&v(json!({"n": 3}))));
        assert!(!grouped.matches(&v(json!({"n": 2}))));
        assert!(!grouped.matches(&v(json!({"n": 5}))));
    }

    #[test]
    fn regex_and_companion() {
        let matcher = m(json!([{"name": ["match", "^a.c$"], "owner": ["$", ".user_id"]}]));
        let companion = v(json!({"user_id": 4}));
        assert!(matcher.matches_with(&v(json!({"name": "abc", "owner": 4})), Some(&companion)));
        assert!(!matcher.matches_with(&v(json!({"name": "abd", "owner": 4})), Some(&companion)));
        assert!(!matcher.matches(&v(json!({"name": "abc", "owner": 4}))));

        let on_companion = m(json!([{"_role": "admin"}]));
        assert!(on_companion.matches_with(&v(json!({})), Some(&v(json!({"role": "admin"})))));
        assert!(!on_companion.matches(&v(json!({"role": "admin"}))));
    }

    #[test]
    fn empty_and_catch_all() {
        assert!(m(json!([])).is_nothing());
        assert!(!m(json!([])).matches(&v(json!({"id": 1}))));
        assert!(m(json!([{"a": 1}, {}])).is_everything());
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        let bad = [
            json!([{"a": [">", 1, "&&"]}]),
            json!([{"a": ["||", 1]}]),
            json!([{"a": [">"]}]),
            json!([{"a": ["=~", 1]}]),
            json!([{"a": ["match", "("]}]),
            json!([{"a": []}]),
            json!([{"a": [1, "&&", "||", 2]}]),
            json!([{"a": [1, "||", "||", 2]}]),
        ];
        for q in bad {
            assert!(compile(&Query::from_json(q.clone()).unwrap()).is_err(), "{}", q);
        }
        assert!(m(json!([{"a": [1, "||", 2]}])).matches(&v(json!({"a": 2}))));
    }
}
