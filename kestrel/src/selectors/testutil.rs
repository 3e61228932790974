use super::matcher::TableLookup;
use super::reload::KernelStore;
use crate::errors::KsError;
use kestrel_common::selectors::KsSelectorBuffer;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Every mutation the fake store records, in call order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StoreOp {
    WriteBlob { attach: u32, slot: u32 },
    SetActive { attach: u32, slot: u32 },
    AllocTable(u32),
    WriteTable(u32),
    FreeTable(u32),
}

#[derive(Debug, Default)]
pub(crate) struct FakeState {
    pub slots: BTreeMap<(u32, u32), Vec<u8>>,
    pub active: BTreeMap<u32, u32>,
    pub tables: BTreeMap<u32, Vec<i64>>,
    pub ops: Vec<StoreOp>,
    /// Active blob of attachment 0, captured after every mutation. Lets a
    /// test assert a reader could never have seen intermediate bytes.
    pub snapshots: Vec<Vec<u8>>,
    /// Fail the nth alloc_table call (counting successes down to zero).
    pub fail_alloc_after: Option<usize>,
    pub fail_write_blob: bool,
}

/// In-memory stand-in for the loader's maps. Clones share state, so a test
/// can hand a clone to the coordinator and keep one for assertions.
#[derive(Clone)]
pub(crate) struct FakeStore {
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeStore {
    pub(crate) fn new() -> FakeStore {
        FakeStore {
            state: Arc::new(Mutex::new(FakeState::default())),
        }
    }

    /// Bytes a kernel-side reader would walk right now for this attachment.
    pub(crate) fn active_blob(&self, attach: u32) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let slot = state.active.get(&attach).copied().unwrap_or(0);
        state.slots.get(&(attach, slot)).cloned().unwrap_or_default()
    }

    fn snapshot(state: &mut FakeState) {
        let slot = state.active.get(&0).copied().unwrap_or(0);
        if let Some(blob) = state.slots.get(&(0, slot)) {
            let blob = blob.clone();
            state.snapshots.push(blob);
        }
    }
}

impl KernelStore for FakeStore {
    fn write_blob(
        &mut self,
        attach_idx: u32,
        slot: u32,
        blob: &KsSelectorBuffer,
    ) -> Result<(), KsError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_write_blob {
            return Err(KsError::Publish {
                attachment: attach_idx.to_string(),
                reason: "injected blob write failure".to_string(),
            });
        }
        let len = blob.len as usize;
        state.slots.insert((attach_idx, slot), blob.data[..len].to_vec());
        state.ops.push(StoreOp::WriteBlob { attach: attach_idx, slot });
        FakeStore::snapshot(&mut state);
        Ok(())
    }

    fn set_active_slot(&mut self, attach_idx: u32, slot: u32) -> Result<(), KsError> {
        let mut state = self.state.lock().unwrap();
        state.active.insert(attach_idx, slot);
        state.ops.push(StoreOp::SetActive { attach: attach_idx, slot });
        FakeStore::snapshot(&mut state);
        Ok(())
    }

    fn alloc_table(&mut self, table_id: u32, _size_hint: usize) -> Result<(), KsError> {
        let mut state = self.state.lock().unwrap();
        if let Some(left) = state.fail_alloc_after {
            if left == 0 {
                return Err(KsError::TableAllocation {
                    table_id,
                    reason: "injected allocation failure".to_string(),
                });
            }
            state.fail_alloc_after = Some(left - 1);
        }
        state.tables.insert(table_id, Vec::new());
        state.ops.push(StoreOp::AllocTable(table_id));
        FakeStore::snapshot(&mut state);
        Ok(())
    }

    fn write_table(&mut self, table_id: u32, entries: &[i64]) -> Result<(), KsError> {
        let mut state = self.state.lock().unwrap();
        if !state.tables.contains_key(&table_id) {
            return Err(KsError::TableAllocation {
                table_id,
                reason: "write to unallocated table".to_string(),
            });
        }
        state.tables.insert(table_id, entries.to_vec());
        state.ops.push(StoreOp::WriteTable(table_id));
        FakeStore::snapshot(&mut state);
        Ok(())
    }

    fn free_table(&mut self, table_id: u32) -> Result<(), KsError> {
        let mut state = self.state.lock().unwrap();
        state.tables.remove(&table_id);
        state.ops.push(StoreOp::FreeTable(table_id));
        FakeStore::snapshot(&mut state);
        Ok(())
    }
}

impl TableLookup for FakeStore {
    fn contains(&self, table_id: u32, value: i64) -> bool {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(&table_id)
            .map(|entries| entries.contains(&value))
            .unwrap_or(false)
    }
}
