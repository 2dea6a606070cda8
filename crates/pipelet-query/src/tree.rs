//! Routing of values to many destinations at once.
//!
//! Terms with a plain equality on a scalar are indexed by `(attribute,
//! literal)`; every other term is scanned. A value reaches each destination
//! at most once even when several of its terms match.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use indexmap::IndexMap;

use pipelet_core::operation::Change;
use pipelet_core::value::Value;

use crate::error::Result;
use crate::matcher::{compile_term, literal_key, CompiledTerm};
use crate::query::{Query, QueryChanges, Term};
use crate::route::Share;

#[derive(Debug, Clone)]
struct Entry<D> {
    dest: D,
    term: Term,
    compiled: CompiledTerm,
    index: Option<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct QueryTree<D> {
    entries: Vec<Option<Entry<D>>>,
    free: Vec<usize>,
    by_dest: IndexMap<D, Vec<usize>>,
    index: HashMap<String, HashMap<String, Vec<usize>>>,
    scan: Vec<usize>,
}

impl<D> Default for QueryTree<D> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            by_dest: IndexMap::new(),
            index: HashMap::new(),
            scan: Vec::new(),
        }
    }
}

impl<D: Clone + Eq + Hash> QueryTree<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_terms(&mut self, dest: D, terms: &[Term]) -> Result<()> {
        for term in terms {
            let compiled = compile_term(term)?;
            let index = compiled.index_key();
            let entry = Entry {
                dest: dest.clone(),
                term: term.clone(),
                compiled,
                index: index.clone(),
            };
            let slot = match self.free.pop() {
                Some(slot) => {
                    self.entries[slot] = Some(entry);
                    slot
                }
                None => {
                    self.entries.push(Some(entry));
                    self.entries.len() - 1
                }
            };
            match index {
                Some((attr, lit)) => self
                    .index
                    .entry(attr)
                    .or_default()
                    .entry(lit)
                    .or_default()
                    .push(slot),
                None => self.scan.push(slot),
            }
            self.by_dest.entry(dest.clone()).or_default().push(slot);
        }
        Ok(())
    }

    /// Withdraw one entry per term; unknown terms are ignored.
    pub fn remove_terms(&mut self, dest: &D, terms: &[Term]) {
        for term in terms {
            let found = self.by_dest.get(dest).and_then(|slots| {
                slots.iter().copied().find(|&s| {
                    self.entries[s]
                        .as_ref()
                        .is_some_and(|e| &e.term == term)
                })
            });
            if let Some(slot) = found {
                self.release(slot);
            }
        }
    }

    pub fn apply(&mut self, dest: D, changes: &QueryChanges) -> Result<()> {
        self.remove_terms(&dest, &changes.removes);
        self.add_terms(dest, &changes.adds)
    }

    pub fn remove_destination(&mut self, dest: &D) {
        let slots = self.by_dest.get(dest).cloned().unwrap_or_default();
        for slot in slots {
            self.release(slot);
        }
        self.by_dest.shift_remove(dest);
    }

    fn release(&mut self, slot: usize) {
        let Some(entry) = self.entries[slot].take() else {
            return;
        };
        match &entry.index {
            Some((attr, lit)) => {
                if let Some(lits) = self.index.get_mut(attr) {
                    if let Some(slots) = lits.get_mut(lit) {
                        slots.retain(|&s| s != slot);
                        if slots.is_empty() {
                            lits.remove(lit);
                        }
                    }
                    if lits.is_empty() {
                        self.index.remove(attr);
                    }
                }
            }
            None => self.scan.retain(|&s| s != slot),
        }
        if let Some(slots) = self.by_dest.get_mut(&entry.dest) {
            slots.retain(|&s| s != slot);
            if slots.is_empty() {
                self.by_dest.shift_remove(&entry.dest);
            }
        }
        self.free.push(slot);
    }

    /// Destinations holding at least one term, in registration order.
    pub fn destinations(&self) -> impl Iterator<Item = &D> {
        self.by_dest.keys()
    }

    pub fn query_for(&self, dest: &D) -> Query {
        let terms = self
            .by_dest
            .get(dest)
            .map(|slots| {
                slots
                    .iter()
                    .filter_map(|&s| self.entries[s].as_ref().map(|e| e.term.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Query::new(terms)
    }

    pub fn is_empty(&self) -> bool {
        self.by_dest.is_empty()
    }

    fn matched(&self, value: &Value) -> HashSet<D> {
        let mut hit = HashSet::new();
        let check = |slot: usize, hit: &mut HashSet<D>| {
            if let Some(e) = &self.entries[slot] {
                if !hit.contains(&e.dest) && e.compiled.matches(value, None) {
                    hit.insert(e.dest.clone());
                }
            }
        };
        for (attr, lits) in &self.index {
            let Some(key) = value.get_path(attr).and_then(literal_key) else {
                continue;
            };
            if let Some(slots) = lits.get(&key) {
                for &slot in slots {
                    check(slot, &mut hit);
                }
            }
        }
        for &slot in &self.scan {
            check(slot, &mut hit);
        }
        hit
    }

    /// Destinations `value` should reach, in registration order.
    pub fn route(&self, value: &Value) -> Vec<D> {
        let hit = self.matched(value);
        self.by_dest.keys().filter(|d| hit.contains(*d)).cloned().collect()
    }

    /// Split a change into per-destination changes. Update pairs crossing a
    /// destination's query become removes or adds for that destination.
    pub fn split(&self, change: &Change) -> Vec<(D, Vec<Change>)> {
        if let Change::Clear = change {
            return self
                .by_dest
                .keys()
                .map(|d| (d.clone(), vec![Change::Clear]))
                .collect();
        }
        let mut shares: HashMap<D, Share> = HashMap::new();
        match change {
            Change::Add { values } => {
                for v in values {
                    for d in self.matched(v) {
                        shares.entry(d).or_default().adds.push(v.clone());
                    }
                }
            }
            Change::Remove { values } => {
                for v in values {
                    for d in self.matched(v) {
                        shares.entry(d).or_default().removes.push(v.clone());
                    }
                }
            }
            Change::Update { values } => {
                for (old, new) in values {
                    let old_hit = self.matched(old);
                    let new_hit = self.matched(new);
                    for d in old_hit.union(&new_hit) {
                        shares.entry(d.clone()).or_default().place_pair(
                            (old.clone(), new.clone()),
                            old_hit.contains(d),
                            new_hit.contains(d),
                        );
                    }
                }
            }
            Change::Clear => {}
        }
        self.by_dest
            .keys()
            .filter_map(|d| {
                let changes = shares.remove(d)?.into_changes();
                (!changes.is_empty()).then(|| (d.clone(), changes))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn terms(j: serde_json::Value) -> Vec<Term> {
        Query::from_json(j).unwrap().into_terms()
    }

    fn v(j: serde_json::Value) -> Value {
        Value::from_json(j).unwrap()
    }

    #[test]
    fn routes_each_value_once_per_destination() {
        let mut tree = QueryTree::new();
        tree.add_terms("a", &terms(json!([{"flow": "orders"}, {"amount": [">", 5]}])))
            .unwrap();
        tree.add_terms("b", &terms(json!([{"flow": "users"}]))).unwrap();
        tree.add_terms("c", &terms(json!([{}]))).unwrap();

        assert_eq!(tree.route(&v(json!({"flow": "orders", "amount": 9}))), vec!["a", "c"]);
        assert_eq!(tree.route(&v(json!({"flow": "users"}))), vec!["b", "c"]);

        tree.remove_terms(&"c", &terms(json!([{}])));
        assert!(tree.route(&v(json!({"flow": "x"}))).is_empty());
        assert_eq!(tree.destinations().count(), 2);
    }

    #[test]
    fn split_follows_each_destination() {
        let mut tree = QueryTree::new();
        tree.add_terms(1u32, &terms(json!([{"flow": "a"}]))).unwrap();
        tree.add_terms(2u32, &terms(json!([{"flow": "b"}]))).unwrap();
        let change = Change::Update {
            values: vec![(v(json!({"id": 1, "flow": "a"})), v(json!({"id": 1, "flow": "b"})))],
        };
        let out = tree.split(&change);
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0].1[..], [Change::Remove { .. }]));
        assert!(matches!(&out[1].1[..], [Change::Add { .. }]));

        tree.remove_destination(&1);
        assert_eq!(tree.query_for(&1), Query::nothing());
        assert_eq!(tree.split(&Change::Clear).len(), 1);
    }
}
