//! Server-side session ids.

use indexmap::IndexSet;
use uuid::Uuid;

/// Session ids this side still knows. A fresh table (e.g. after a restart)
/// knows none, so every reconnecting client gets a new id.
#[derive(Debug, Default)]
pub struct SessionTable {
    known: IndexSet<String>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The id to hand out for a client offering `offered`, and whether it is
    /// the offered one.
    pub fn resolve(&mut self, offered: Option<&str>) -> (String, bool) {
        if let Some(id) = offered {
            if self.known.contains(id) {
                return (id.to_string(), true);
            }
        }
        let id = Uuid::new_v4().to_string();
        self.known.insert(id.clone());
        (id, false)
    }

    pub fn forget(&mut self, id: &str) -> bool {
        self.known.shift_remove(id)
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_ids_are_kept() {
        let mut t = SessionTable::new();
        let (a, same) = t.resolve(None);
        assert!(!same);
        assert_eq!(t.resolve(Some(&a)), (a.clone(), true));

        let (b, same) = SessionTable::new().resolve(Some(&a));
        assert!(!same);
        assert_ne!(a, b);
    }
}
