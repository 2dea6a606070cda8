//! Per-destination filtering of changes.

use pipelet_core::operation::Change;
use pipelet_core::value::Value;

use crate::matcher::Matcher;

/// One destination's share of a change, emitted as remove, update, add.
#[derive(Debug, Default)]
pub(crate) struct Share {
    pub removes: Vec<Value>,
    pub updates: Vec<(Value, Value)>,
    pub adds: Vec<Value>,
}

impl Share {
    pub(crate) fn place_pair(&mut self, pair: (Value, Value), old_in: bool, new_in: bool) {
        match (old_in, new_in) {
            (true, true) => self.updates.push(pair),
            (true, false) => self.removes.push(pair.0),
            (false, true) => self.adds.push(pair.1),
            (false, false) => {}
        }
    }

    pub(crate) fn into_changes(self) -> Vec<Change> {
        let mut out = Vec::new();
        if !self.removes.is_empty() {
            out.push(Change::Remove {
                values: self.removes,
            });
        }
        if !self.updates.is_empty() {
            out.push(Change::Update {
                values: self.updates,
            });
        }
        if !self.adds.is_empty() {
            out.push(Change::Add { values: self.adds });
        }
        out
    }
}

/// Keep only what `matcher` lets through. An update whose old side matches
/// but new side does not becomes a remove, and the reverse becomes an add.
/// A clear always passes unless the matcher matches nothing.
pub fn filter_change(matcher: &Matcher, change: &Change) -> Vec<Change> {
    if matcher.is_everything() {
        return vec![change.clone()];
    }
    if matcher.is_nothing() {
        return Vec::new();
    }
    let mut share = Share::default();
    match change {
        Change::Add { values } => {
            share.adds = values.iter().filter(|v| matcher.matches(v)).cloned().collect();
        }
        Change::Remove { values } => {
            share.removes = values.iter().filter(|v| matcher.matches(v)).cloned().collect();
        }
        Change::Update { values } => {
            for (old, new) in values {
                let (old_in, new_in) = (matcher.matches(old), matcher.matches(new));
                share.place_pair((old.clone(), new.clone()), old_in, new_in);
            }
        }
        Change::Clear => return vec![Change::Clear],
    }
    share.into_changes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::compile;
    use crate::query::Query;
    use serde_json::json;

    fn v(j: serde_json::Value) -> Value {
        Value::from_json(j).unwrap()
    }

    #[test]
    fn update_crossing_the_filter_splits() {
        let m = compile(&Query::from_json(json!([{"flow": "a"}])).unwrap()).unwrap();
        let change = Change::Update {
            values: vec![
                (v(json!({"id": 1, "flow": "a"})), v(json!({"id": 1, "flow": "b"}))),
                (v(json!({"id": 2, "flow": "b"})), v(json!({"id": 2, "flow": "a"}))),
                (v(json!({"id": 3, "flow": "a", "n": 1})), v(json!({"id": 3, "flow": "a", "n": 2}))),
            ],
        };
        let out = filter_change(&m, &change);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], Change::Remove { values: vec![v(json!({"id": 1, "flow": "a"}))] });
        assert!(matches!(&out[1], Change::Update { values } if values.len() == 1));
        assert_eq!(out[2], Change::Add { values: vec![v(json!({"id": 2, "flow": "a"}))] });
    }
}
