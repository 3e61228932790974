use super::reload::KernelStore;
use crate::errors::KsError;
use crate::utils::get_hash;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TableKind {
    Pid,
    Arg,
}

/// A membership table to be made kernel-resident: a content-derived id and
/// the sorted value set.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TableSpec {
    pub id: u32,
    pub entries: Vec<i64>,
}

impl TableSpec {
    pub(crate) fn new(kind: TableKind, index: u32, entries: Vec<i64>) -> TableSpec {
        let id = table_id(kind, index, &entries);
        TableSpec { id, entries }
    }
}

/// Canonical set form used for hashing and population: sorted, deduplicated.
pub(crate) fn entries_from<I>(values: I) -> Vec<i64>
where
    I: IntoIterator<Item = i64>,
{
    let mut v: Vec<i64> = values.into_iter().collect();
    v.sort_unstable();
    v.dedup();
    v
}

/// Deterministic identifier from the table kind, the argument index and the
/// value set. Identical filters therefore map to the same id across reloads
/// and attachments. Zero is reserved for "no table".
fn table_id(kind: TableKind, index: u32, entries: &[i64]) -> u32 {
    let h = get_hash((kind, index, entries));
    let id = (h as u32) ^ ((h >> 32) as u32);
    if id == 0 {
        1
    } else {
        id
    }
}

/// Adds a table to the compile output, deduplicating equal value sets. Two
/// distinct sets folding to the same 32-bit id would silently alias one
/// table for both filters, so that case is a hard error.
pub(crate) fn intern(out: &mut Vec<TableSpec>, spec: TableSpec) -> Result<u32, KsError> {
    let id = spec.id;
    if let Some(existing) = out.iter().find(|t| t.id == id) {
        if existing.entries != spec.entries {
            return Err(KsError::TableAllocation {
                table_id: id,
                reason: "id collision between distinct value sets".to_string(),
            });
        }
        return Ok(id);
    }
    out.push(spec);
    Ok(id)
}

/// Owns allocation and retirement of kernel-resident membership tables.
///
/// Callers hold the registry for a whole publish (stage .. confirm/abort),
/// so the reference bookkeeping never observes a half-applied reload. A
/// table is freed only when no live blob references it, and only from
/// `confirm` of the publish that superseded the referencing blob — the
/// one-generation lag that keeps in-flight kernel walks of the old blob
/// safe without reference counting kernel readers.
pub(crate) struct TableRegistry {
    live: HashMap<u32, HashSet<u32>>,
    allocated: HashSet<u32>,
}

impl TableRegistry {
    pub(crate) fn new() -> TableRegistry {
        TableRegistry {
            live: HashMap::new(),
            allocated: HashSet::new(),
        }
    }

    /// Allocates and populates candidate tables that are not yet
    /// kernel-resident. Returns the freshly allocated ids so a failed
    /// publish can be aborted. On error, this call's own allocations are
    /// rolled back and nothing else changes.
    pub(crate) fn stage(
        &mut self,
        store: &mut dyn KernelStore,
        specs: &[TableSpec],
    ) -> Result<Vec<u32>, KsError> {
        let mut fresh = Vec::new();
        for spec in specs {
            if self.allocated.contains(&spec.id) {
                continue;
            }
            let res = store
                .alloc_table(spec.id, spec.entries.len())
                .and_then(|_| store.write_table(spec.id, &spec.entries));
            if let Err(e) = res {
                self.rollback(store, &fresh);
                return Err(e);
            }
            self.allocated.insert(spec.id);
            fresh.push(spec.id);
        }
        Ok(fresh)
    }

    /// Drops a failed candidate's fresh tables. Ids referenced by a live
    /// blob are kept.
    pub(crate) fn abort(&mut self, store: &mut dyn KernelStore, fresh: &[u32]) {
        self.rollback(store, fresh);
    }

    /// Records the new reference set for an attachment and retires tables
    /// only the superseded blob referenced. Called after the slot flip is
    /// confirmed.
    pub(crate) fn confirm(
        &mut self,
        store: &mut dyn KernelStore,
        attach_idx: u32,
        new_ids: HashSet<u32>,
    ) {
        let old = self.live.insert(attach_idx, new_ids).unwrap_or_default();
        for id in old {
            if !self.referenced(id) {
                self.free(store, id);
            }
        }
    }

    /// Drops all of an attachment's references on sensor teardown.
    pub(crate) fn release(&mut self, store: &mut dyn KernelStore, attach_idx: u32) {
        let old = self.live.remove(&attach_idx).unwrap_or_default();
        for id in old {
            if !self.referenced(id) {
                self.free(store, id);
            }
        }
    }

    fn rollback(&mut self, store: &mut dyn KernelStore, ids: &[u32]) {
        for id in ids {
            if !self.referenced(*id) {
                self.free(store, *id);
            }
        }
    }

    fn referenced(&self, id: u32) -> bool {
        self.live.values().any(|s| s.contains(&id))
    }

    fn free(&mut self, store: &mut dyn KernelStore, id: u32) {
        self.allocated.remove(&id);
        match store.free_table(id) {
            Ok(()) => debug!("retired table {}", id),
            Err(e) => warn!(target: "error", "could not retire table {}: {}", id, e),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_allocated(&self, id: u32) -> bool {
        self.allocated.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::FakeStore;
    use super::*;

    fn spec(index: u32, entries: &[i64]) -> TableSpec {
        TableSpec::new(TableKind::Arg, index, entries_from(entries.iter().copied()))
    }

    #[test]
    fn ids_are_content_derived() {
        let a = spec(7, &[4443, 9999]);
        let b = spec(7, &[9999, 4443, 4443]);
        let c = spec(2, &[4443, 9999]);
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_ne!(a.id, 0);
        // Kind participates: a pid set never collides with an equal arg set.
        let p = TableSpec::new(TableKind::Pid, 7, entries_from([4443, 9999].into_iter()));
        assert_ne!(a.id, p.id);
    }

    #[test]
    fn intern_dedups_equal_sets_and_rejects_id_collisions() {
        let mut out = Vec::new();
        let a = spec(7, &[1, 2]);
        let id = intern(&mut out, a.clone()).unwrap();
        assert_eq!(intern(&mut out, a).unwrap(), id);
        assert_eq!(out.len(), 1);

        let forged = TableSpec {
            id,
            entries: vec![9],
        };
        assert!(matches!(
            intern(&mut out, forged),
            Err(KsError::TableAllocation { .. })
        ));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn stage_allocates_each_table_once() {
        let mut store = FakeStore::new();
        let mut reg = TableRegistry::new();
        let t = spec(7, &[1, 2, 3]);

        let fresh = reg.stage(&mut store, &[t.clone()]).unwrap();
        assert_eq!(fresh, vec![t.id]);
        let fresh2 = reg.stage(&mut store, &[t.clone()]).unwrap();
        assert!(fresh2.is_empty());
        assert_eq!(store.state.lock().unwrap().tables[&t.id], vec![1, 2, 3]);
    }

    #[test]
    fn confirm_retires_only_superseded_tables() {
        let mut store = FakeStore::new();
        let mut reg = TableRegistry::new();
        let old = spec(7, &[4443, 9999]);
        let new = spec(7, &[8888]);

        let _ = reg.stage(&mut store, &[old.clone()]).unwrap();
        reg.confirm(&mut store, 0, [old.id].into_iter().collect());

        let _ = reg.stage(&mut store, &[new.clone()]).unwrap();
        // Old table is still live until the superseding publish confirms.
        assert!(reg.is_allocated(old.id));
        reg.confirm(&mut store, 0, [new.id].into_iter().collect());

        let state = store.state.lock().unwrap();
        assert!(!state.tables.contains_key(&old.id));
        assert!(state.tables.contains_key(&new.id));
    }

    #[test]
    fn shared_tables_survive_until_last_reference() {
        let mut store = FakeStore::new();
        let mut reg = TableRegistry::new();
        let t = spec(7, &[1, 2]);

        let _ = reg.stage(&mut store, &[t.clone()]).unwrap();
        reg.confirm(&mut store, 0, [t.id].into_iter().collect());
        reg.confirm(&mut store, 1, [t.id].into_iter().collect());

        reg.release(&mut store, 0);
        assert!(store.state.lock().unwrap().tables.contains_key(&t.id));
        reg.release(&mut store, 1);
        assert!(!store.state.lock().unwrap().tables.contains_key(&t.id));
    }

    #[test]
    fn abort_frees_fresh_tables_only() {
        let mut store = FakeStore::new();
        let mut reg = TableRegistry::new();
        let live = spec(7, &[1]);
        let cand = spec(7, &[2]);

        let _ = reg.stage(&mut store, &[live.clone()]).unwrap();
        reg.confirm(&mut store, 0, [live.id].into_iter().collect());

        let fresh = reg.stage(&mut store, &[live.clone(), cand.clone()]).unwrap();
        assert_eq!(fresh, vec![cand.id]);
        reg.abort(&mut store, &fresh);

        let state = store.state.lock().unwrap();
        assert!(state.tables.contains_key(&live.id));
        assert!(!state.tables.contains_key(&cand.id));
    }

    #[test]
    fn failed_stage_rolls_back_own_allocations() {
        let mut store = FakeStore::new();
        let mut reg = TableRegistry::new();
        let a = spec(7, &[1]);
        let b = spec(7, &[2]);

        store.state.lock().unwrap().fail_alloc_after = Some(1);
        let err = reg.stage(&mut store, &[a.clone(), b.clone()]).unwrap_err();
        assert!(matches!(err, KsError::TableAllocation { .. }));

        let state = store.state.lock().unwrap();
        assert!(!state.tables.contains_key(&a.id));
        assert!(!state.tables.contains_key(&b.id));
        assert!(!reg.is_allocated(a.id));
    }
}
