use super::compiler;
use super::tables::TableRegistry;
use crate::errors::KsError;
use crate::policy::{ArgSpec, SelectorSpec};
use crate::tracker::IdentityContext;
use crate::utils::get_hash;
use kestrel_common::selectors::KsSelectorBuffer;
use parking_lot::Mutex;
use tracing::{debug, info};

/// Write side of the kernel-resident configuration, implemented over the
/// loader's maps in production and an in-memory fake in tests. The kernel
/// matcher is the only reader; nothing else mutates published state.
pub(crate) trait KernelStore: Send {
    /// Writes a candidate blob into one slot of an attachment's config
    /// region. The slot is inactive, so the write itself need not be
    /// atomic.
    fn write_blob(
        &mut self,
        attach_idx: u32,
        slot: u32,
        blob: &KsSelectorBuffer,
    ) -> Result<(), KsError>;

    /// Flips the active-slot index. This is the only write a kernel-side
    /// evaluation can observe mid-reload, and it is index-sized, so any
    /// single evaluation sees strictly the old or strictly the new blob.
    fn set_active_slot(&mut self, attach_idx: u32, slot: u32) -> Result<(), KsError>;

    fn alloc_table(&mut self, table_id: u32, size_hint: usize) -> Result<(), KsError>;
    fn write_table(&mut self, table_id: u32, entries: &[i64]) -> Result<(), KsError>;
    fn free_table(&mut self, table_id: u32) -> Result<(), KsError>;
}

/// One attached probe point, identified by its config-region index and a
/// display name ("syscalls/sys_enter_lseek", "kprobe/__x64_sys_lseek").
#[derive(Debug, Clone)]
pub(crate) struct Attachment {
    pub idx: u32,
    pub name: String,
}

#[derive(Debug, Default)]
struct AttachInner {
    active_slot: u32,
    generation: u64,
    last_hash: Option<u64>,
}

/// Compiles selector sets and publishes them into live attachments.
/// Reloads against the same attachment are serialized (the second caller
/// gets `ConcurrentReload`); different attachments proceed independently
/// up to the brief store/registry critical section.
pub(crate) struct ReloadCoordinator {
    store: Mutex<Box<dyn KernelStore>>,
    registry: Mutex<TableRegistry>,
    states: Vec<Mutex<AttachInner>>,
}

impl ReloadCoordinator {
    pub(crate) fn new(store: Box<dyn KernelStore>, attachments: usize) -> ReloadCoordinator {
        ReloadCoordinator {
            store: Mutex::new(store),
            registry: Mutex::new(TableRegistry::new()),
            states: (0..attachments).map(|_| Mutex::new(AttachInner::default())).collect(),
        }
    }

    /// Compiles and publishes the selector set for one attachment without
    /// touching its program. Returns false when the candidate is
    /// byte-identical to the live blob and nothing needed publishing.
    ///
    /// Failure order matters: compile errors and table allocation errors
    /// surface before any kernel-visible change; a failed blob write or
    /// slot flip leaves the previous blob active and releases the
    /// candidate's fresh tables.
    pub(crate) fn publish(
        &self,
        att: &Attachment,
        selectors: &[SelectorSpec],
        args: &[ArgSpec],
        ident: &IdentityContext,
    ) -> Result<bool, KsError> {
        let state = self
            .states
            .get(att.idx as usize)
            .ok_or_else(|| KsError::Publish {
                attachment: att.name.clone(),
                reason: "unknown attachment index".to_string(),
            })?;
        let mut inner = state.try_lock().ok_or(KsError::ConcurrentReload {
            attachment: att.name.clone(),
        })?;

        let compiled = compiler::compile_selectors(&att.name, selectors, args, ident)?;
        let hash = get_hash(compiled.bytes());
        if inner.last_hash == Some(hash) {
            debug!(
                "attachment {}: selector configuration unchanged, nothing to publish",
                att.name
            );
            return Ok(false);
        }

        let mut registry = self.registry.lock();
        let mut store = self.store.lock();
        let fresh = registry.stage(store.as_mut(), &compiled.tables)?;

        let next = inner.active_slot ^ 1;
        let published = store
            .write_blob(att.idx, next, &compiled.buffer)
            .and_then(|_| store.set_active_slot(att.idx, next));
        if let Err(e) = published {
            registry.abort(store.as_mut(), &fresh);
            return Err(e);
        }

        inner.active_slot = next;
        inner.generation += 1;
        inner.last_hash = Some(hash);

        registry.confirm(store.as_mut(), att.idx, compiled.table_ids());

        info!(
            target: "event",
            attachment = att.name.as_str(),
            generation = inner.generation,
            tables = compiled.tables.len(),
            "published selector configuration"
        );
        Ok(true)
    }

    /// Releases an attachment's configuration on sensor teardown; the
    /// program itself is detached by its owner.
    pub(crate) fn release(&self, att: &Attachment) {
        if let Some(state) = self.states.get(att.idx as usize) {
            let mut inner = state.lock();
            let mut registry = self.registry.lock();
            let mut store = self.store.lock();
            registry.release(store.as_mut(), att.idx);
            inner.last_hash = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{FakeStore, StoreOp};
    use super::*;
    use serde_json::json;

    fn args() -> Vec<ArgSpec> {
        serde_json::from_value(json!([{ "index": 7, "type": "ulong" }])).unwrap()
    }

    fn selectors(vals: &[i64], operator: &str) -> Vec<SelectorSpec> {
        serde_json::from_value(json!([{
            "match_args": [{ "index": 7, "operator": operator, "values": vals }]
        }]))
        .unwrap()
    }

    fn setup() -> (FakeStore, ReloadCoordinator, Attachment, IdentityContext) {
        let store = FakeStore::new();
        let coord = ReloadCoordinator::new(Box::new(store.clone()), 2);
        let att = Attachment {
            idx: 0,
            name: "syscalls/sys_enter_lseek".to_string(),
        };
        (store, coord, att, IdentityContext::for_test(1000, 1))
    }

    #[test]
    fn publish_writes_inactive_slot_then_flips() {
        let (store, coord, att, ident) = setup();

        let changed = coord.publish(&att, &selectors(&[4443], "eq"), &args(), &ident).unwrap();
        assert!(changed);

        let state = store.state.lock().unwrap();
        let blob_pos = state
            .ops
            .iter()
            .position(|op| matches!(op, StoreOp::WriteBlob { slot: 1, .. }))
            .unwrap();
        let flip_pos = state
            .ops
            .iter()
            .position(|op| matches!(op, StoreOp::SetActive { slot: 1, .. }))
            .unwrap();
        assert!(blob_pos < flip_pos);
        assert_eq!(state.active.get(&0), Some(&1));
    }

    #[test]
    fn reload_is_idempotent_for_equal_specs() {
        let (store, coord, att, ident) = setup();

        assert!(coord.publish(&att, &selectors(&[4443], "eq"), &args(), &ident).unwrap());
        let ops_after_first = store.state.lock().unwrap().ops.len();

        // Equal content, separately constructed spec.
        assert!(!coord.publish(&att, &selectors(&[4443], "eq"), &args(), &ident).unwrap());
        assert_eq!(store.state.lock().unwrap().ops.len(), ops_after_first);
    }

    #[test]
    fn events_never_observe_a_half_written_blob() {
        let (store, coord, att, ident) = setup();

        assert!(coord.publish(&att, &selectors(&[4443], "eq"), &args(), &ident).unwrap());
        let old = store.active_blob(0);

        assert!(coord.publish(&att, &selectors(&[9999], "eq"), &args(), &ident).unwrap());
        let new = store.active_blob(0);
        assert_ne!(old, new);

        // The fake snapshots the active blob after every store operation;
        // at no point does a reader see anything but the old or new bytes.
        let state = store.state.lock().unwrap();
        for snap in &state.snapshots {
            assert!(snap == &old || snap == &new);
        }
    }

    #[test]
    fn failed_compile_leaves_active_blob_untouched() {
        let (store, coord, att, ident) = setup();

        assert!(coord.publish(&att, &selectors(&[4443], "eq"), &args(), &ident).unwrap());
        let before = store.active_blob(0);
        let ops_before = store.state.lock().unwrap().ops.len();

        let err = coord
            .publish(&att, &selectors(&[4443], "approx"), &args(), &ident)
            .unwrap_err();
        match err {
            KsError::Selector { attachment, selector, source } => {
                assert_eq!(attachment, "syscalls/sys_enter_lseek");
                assert_eq!(selector, 0);
                assert!(matches!(*source, KsError::UnknownOperator(_)));
            }
            other => panic!("expected Selector error, got {:?}", other),
        }

        assert_eq!(store.active_blob(0), before);
        assert_eq!(store.state.lock().unwrap().ops.len(), ops_before);
    }

    #[test]
    fn failed_publish_releases_candidate_tables() {
        let (store, coord, att, ident) = setup();

        assert!(coord.publish(&att, &selectors(&[4443], "eq"), &args(), &ident).unwrap());
        let before = store.active_blob(0);

        store.state.lock().unwrap().fail_write_blob = true;
        let err = coord
            .publish(&att, &selectors(&[1, 2, 3], "in_map"), &args(), &ident)
            .unwrap_err();
        assert!(matches!(err, KsError::Publish { .. }));
        store.state.lock().unwrap().fail_write_blob = false;

        let state = store.state.lock().unwrap();
        assert_eq!(state.active.get(&0), Some(&1));
        assert!(state.tables.is_empty());
        drop(state);
        assert_eq!(store.active_blob(0), before);
    }

    #[test]
    fn superseded_tables_retire_one_generation_late() {
        let (store, coord, att, ident) = setup();

        assert!(coord.publish(&att, &selectors(&[4443, 9999], "in_map"), &args(), &ident).unwrap());
        assert_eq!(store.state.lock().unwrap().tables.len(), 1);

        assert!(coord.publish(&att, &selectors(&[8888], "in_map"), &args(), &ident).unwrap());
        let state = store.state.lock().unwrap();
        assert_eq!(state.tables.len(), 1);
        assert_eq!(state.tables.values().next().unwrap(), &vec![8888]);
        // Retirement happened after the flip, never before.
        let flip_pos = state
            .ops
            .iter()
            .rposition(|op| matches!(op, StoreOp::SetActive { .. }))
            .unwrap();
        let free_pos = state
            .ops
            .iter()
            .rposition(|op| matches!(op, StoreOp::FreeTable(_)))
            .unwrap();
        assert!(free_pos > flip_pos);
    }

    #[test]
    fn concurrent_reload_is_rejected() {
        let (_store, coord, att, ident) = setup();

        let _held = coord.states[0].lock();
        let err = coord
            .publish(&att, &selectors(&[4443], "eq"), &args(), &ident)
            .unwrap_err();
        assert!(matches!(err, KsError::ConcurrentReload { .. }));
    }

    #[test]
    fn independent_attachments_do_not_interfere() {
        let (store, coord, att, ident) = setup();
        let att2 = Attachment {
            idx: 1,
            name: "kprobe/__x64_sys_lseek".to_string(),
        };

        assert!(coord.publish(&att, &selectors(&[4443], "eq"), &args(), &ident).unwrap());
        assert!(coord.publish(&att2, &selectors(&[9999], "eq"), &args(), &ident).unwrap());

        let state = store.state.lock().unwrap();
        assert_eq!(state.active.get(&0), Some(&1));
        assert_eq!(state.active.get(&1), Some(&1));
        assert!(state.slots.contains_key(&(0, 1)));
        assert!(state.slots.contains_key(&(1, 1)));
    }

    #[test]
    fn release_frees_live_tables() {
        let (store, coord, att, ident) = setup();

        assert!(coord.publish(&att, &selectors(&[1, 2], "in_map"), &args(), &ident).unwrap());
        assert_eq!(store.state.lock().unwrap().tables.len(), 1);
        coord.release(&att);
        assert!(store.state.lock().unwrap().tables.is_empty());
    }
}
