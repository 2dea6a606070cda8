//! Refcounted union of downstream demands.

use indexmap::IndexMap;
use tracing::warn;

use crate::query::{Query, QueryChanges, Term};

/// Multiset of terms contributed by the outputs of one node. Only 0↔1
/// refcount transitions change the union, so only those travel upstream.
#[derive(Debug, Clone, Default)]
pub struct QueryUnion {
    terms: IndexMap<String, (Term, usize)>,
}

impl QueryUnion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a downstream update and return the net change of the union.
    pub fn apply(&mut self, changes: &QueryChanges) -> QueryChanges {
        let mut removed = Vec::new();
        for term in &changes.removes {
            let key = term.canonical();
            match self.terms.get_mut(&key) {
                Some((_, count)) if *count > 1 => *count -= 1,
                Some(_) => {
                    self.terms.shift_remove(&key);
                    removed.push(term.clone());
                }
                None => warn!(term = %term, "removing a term that was never added"),
            }
        }

        let mut added = Vec::new();
        for term in &changes.adds {
            let key = term.canonical();
            let slot = self.terms.entry(key).or_insert_with(|| (term.clone(), 0));
            slot.1 += 1;
            if slot.1 == 1 {
                if let Some(pos) = removed.iter().position(|t| t == term) {
                    // withdrawn and re-added in one update: no net change
                    removed.remove(pos);
                } else {
                    added.push(term.clone());
                }
            }
        }

        QueryChanges::new(removed, added)
    }

    pub fn add(&mut self, terms: &[Term]) -> QueryChanges {
        self.apply(&QueryChanges::adding(terms.to_vec()))
    }

    pub fn remove(&mut self, terms: &[Term]) -> QueryChanges {
        self.apply(&QueryChanges::removing(terms.to_vec()))
    }

    /// Current union in first-contribution order.
    pub fn query(&self) -> Query {
        Query::new(self.terms.values().map(|(t, _)| t.clone()).collect())
    }

    pub fn count(&self, term: &Term) -> usize {
        self.terms.get(&term.canonical()).map(|(_, c)| *c).unwrap_or(0)
    }

    /// Sum of all refcounts.
    pub fn total(&self) -> usize {
        self.terms.values().map(|(_, c)| *c).sum()
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn t(j: serde_json::Value) -> Term {
        Term::from_json(j).unwrap()
    }

    #[test]
    fn only_net_changes_escape() {
        let mut u = QueryUnion::new();
        let a = t(json!({"flow": "a"}));
        let b = t(json!({"flow": "b"}));

        assert_eq!(u.add(&[a.clone()]).adds, vec![a.clone()]);
        assert!(u.add(&[a.clone()]).is_empty());
        assert_eq!(u.count(&a), 2);

        assert!(u.remove(&[a.clone()]).is_empty());
        let last = u.apply(&QueryChanges::new(vec![a.clone()], vec![b.clone()]));
        assert_eq!(last, QueryChanges::new(vec![a.clone()], vec![b.clone()]));
        assert_eq!(u.query(), Query::new(vec![b]));
    }

    #[test]
    fn swap_of_same_term_is_silent() {
        let mut u = QueryUnion::new();
        let a = t(json!({"flow": "a"}));
        u.add(&[a.clone()]);
        assert!(u.apply(&QueryChanges::new(vec![a.clone()], vec![a])).is_empty());
        assert_eq!(u.total(), 1);
    }
}
