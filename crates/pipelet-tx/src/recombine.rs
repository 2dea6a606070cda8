//! Folding one transaction's operations into a single coherent transition
//! per identity.

use indexmap::IndexMap;

use pipelet_core::operation::{Change, Operation, TxMeta};
use pipelet_core::value::{Identity, Key, Value};

#[derive(Debug, Default)]
struct Track {
    /// State before the transaction, as far as the operations reveal it.
    before: Option<Value>,
    after: Option<Value>,
    seen: bool,
    /// Identity this entity was renamed to.
    renamed_to: Option<Identity>,
    /// Target of a rename already emitted as an update pair.
    consumed: bool,
}

impl Track {
    fn touch_from(&mut self, previous: Option<Value>) {
        if !self.seen {
            self.before = previous;
            self.seen = true;
        }
    }
}

/// Recombine `ops` into at most one clear, remove, update and add, in that
/// order:
///
/// - a remove and an add of the same identity become an update;
/// - an update whose old and new values are equal disappears;
/// - renames stay update pairs;
/// - a clear drops everything before it.
///
/// The last emitted operation closes the transaction (`more=false`) and
/// `join_tag` is removed from the forks. With nothing left to say, a single
/// empty add carries the closing metadata.
pub fn recombine(ops: &[Operation], key: &Key, meta: &TxMeta, join_tag: Option<&str>) -> Vec<Operation> {
    let mut tracks: IndexMap<Identity, Track> = IndexMap::new();
    let mut cleared = false;

    for op in ops {
        match &op.change {
            Change::Clear => {
                tracks.clear();
                cleared = true;
            }
            Change::Add { values } => {
                for v in values {
                    let t = tracks.entry(key.identity(v)).or_default();
                    t.touch_from(None);
                    t.after = Some(v.clone());
                }
            }
            Change::Remove { values } => {
                for v in values {
                    let t = tracks.entry(key.identity(v)).or_default();
                    t.touch_from(Some(v.clone()));
                    t.after = None;
                }
            }
            Change::Update { values } => {
                for (old, new) in values {
                    let (io, inew) = (key.identity(old), key.identity(new));
                    if io == inew {
                        let t = tracks.entry(io).or_default();
                        t.touch_from(Some(old.clone()));
                        t.after = Some(new.clone());
                    } else {
                        let t = tracks.entry(io).or_default();
                        t.touch_from(Some(old.clone()));
                        t.after = None;
                        t.renamed_to = Some(inew.clone());
                        let target = tracks.entry(inew).or_default();
                        target.touch_from(None);
                        target.after = Some(new.clone());
                    }
                }
            }
        }
    }

    let mut removes = Vec::new();
    let mut updates = Vec::new();
    let mut adds = Vec::new();

    let ids: Vec<Identity> = tracks.keys().cloned().collect();
    for id in &ids {
        let Some(t) = tracks.get(id) else { continue };
        match (t.before.clone(), t.after.clone()) {
            (Some(b), Some(a)) => {
                if b != a {
                    updates.push((b, a));
                }
            }
            (Some(b), None) => {
                let rename = t.renamed_to.clone().and_then(|target| {
                    let tt = tracks.get(&target)?;
                    match (&tt.before, &tt.after) {
                        (None, Some(a)) if !tt.consumed => Some((target.clone(), a.clone())),
                        _ => None,
                    }
                });
                match rename {
                    Some((target, a)) => {
                        updates.push((b, a));
                        if let Some(tt) = tracks.get_mut(&target) {
                            tt.consumed = true;
                        }
                    }
                    None => removes.push(b),
                }
            }
            (None, Some(a)) => {
                if !t.consumed {
                    adds.push((id.clone(), a));
                }
            }
            (None, None) => {}
        }
    }
    // a rename target may precede its source in insertion order
    let adds: Vec<Value> = adds
        .into_iter()
        .filter(|(id, _)| !tracks.get(id).is_some_and(|t| t.consumed))
        .map(|(_, v)| v)
        .collect();

    let mut changes = Vec::new();
    if cleared {
        changes.push(Change::Clear);
    }
    if !removes.is_empty() {
        changes.push(Change::Remove { values: removes });
    }
    if !updates.is_empty() {
        changes.push(Change::Update { values: updates });
    }
    if !adds.is_empty() {
        changes.push(Change::Add { values: adds });
    }
    if changes.is_empty() {
        changes.push(Change::Add { values: Vec::new() });
    }

    let mut forks = meta.forks.clone();
    if let Some(tag) = join_tag {
        forks.retain(|f| f != tag);
    }
    let n = changes.len();
    changes
        .into_iter()
        .enumerate()
        .map(|(i, change)| {
            Operation::new(change, Default::default()).with_tx(TxMeta {
                id: meta.id.clone(),
                more: i + 1 < n,
                forks: forks.clone(),
            })
        })
        .collect()
}
