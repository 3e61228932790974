use crate::errors::KsError;
use crate::probes::Probe;
use crate::selectors::reload::KernelStore;
use crate::tracker::KsProcessTracker;
use aya::maps::{Array, HashMap as AyaHashMap, MapData};
use aya::Bpf;
use kestrel_common::selectors::{KsSelectorBuffer, KsTableKey};
use kestrel_common::BLOB_SLOTS;
use std::collections::HashMap;
use std::vec::Vec;

/// Upper bound on one membership table, matching the kernel map sizing.
const TABLE_ENTRIES_MAX: usize = 4096;

/// `KernelStore` over the loaded object's maps: the two-slot blob regions,
/// the per-attachment active-slot index, and the shared value-table map.
/// A userspace shadow of each table's keys makes rewrite and free exact
/// without iterating the kernel map.
pub(crate) struct AyaStore {
    blobs: Array<MapData, KsSelectorBuffer>,
    active: Array<MapData, u32>,
    tables: AyaHashMap<MapData, KsTableKey, u8>,
    shadow: HashMap<u32, Vec<i64>>,
}

impl AyaStore {
    pub(crate) fn new(bpf: &mut Bpf) -> Result<AyaStore, anyhow::Error> {
        let blobs = Array::try_from(
            bpf.take_map("KS_SELECTORS")
                .ok_or_else(|| anyhow::anyhow!("map KS_SELECTORS not found"))?,
        )?;
        let active = Array::try_from(
            bpf.take_map("KS_ACTIVE")
                .ok_or_else(|| anyhow::anyhow!("map KS_ACTIVE not found"))?,
        )?;
        let tables = AyaHashMap::try_from(
            bpf.take_map("KS_VALUE_TABLES")
                .ok_or_else(|| anyhow::anyhow!("map KS_VALUE_TABLES not found"))?,
        )?;

        Ok(AyaStore {
            blobs,
            active,
            tables,
            shadow: HashMap::new(),
        })
    }
}

impl KernelStore for AyaStore {
    fn write_blob(
        &mut self,
        attach_idx: u32,
        slot: u32,
        blob: &KsSelectorBuffer,
    ) -> Result<(), KsError> {
        let index = attach_idx * BLOB_SLOTS as u32 + slot;
        self.blobs.set(index, blob, 0).map_err(|e| KsError::Publish {
            attachment: attach_idx.to_string(),
            reason: format!("blob write: {}", e),
        })
    }

    fn set_active_slot(&mut self, attach_idx: u32, slot: u32) -> Result<(), KsError> {
        self.active.set(attach_idx, slot, 0).map_err(|e| KsError::Publish {
            attachment: attach_idx.to_string(),
            reason: format!("slot flip: {}", e),
        })
    }

    fn alloc_table(&mut self, table_id: u32, size_hint: usize) -> Result<(), KsError> {
        if size_hint > TABLE_ENTRIES_MAX {
            return Err(KsError::TableAllocation {
                table_id,
                reason: format!("{} entries exceed the {} cap", size_hint, TABLE_ENTRIES_MAX),
            });
        }
        self.shadow.insert(table_id, Vec::new());
        Ok(())
    }

    fn write_table(&mut self, table_id: u32, entries: &[i64]) -> Result<(), KsError> {
        let old = self.shadow.get(&table_id).cloned().ok_or_else(|| {
            KsError::TableAllocation {
                table_id,
                reason: "write to unallocated table".to_string(),
            }
        })?;
        for v in old {
            let _ = self.tables.remove(&KsTableKey::new(table_id, v));
        }
        for v in entries {
            self.tables
                .insert(KsTableKey::new(table_id, *v), 1, 0)
                .map_err(|e| KsError::TableAllocation {
                    table_id,
                    reason: format!("entry insert: {}", e),
                })?;
        }
        self.shadow.insert(table_id, entries.to_vec());
        Ok(())
    }

    fn free_table(&mut self, table_id: u32) -> Result<(), KsError> {
        if let Some(entries) = self.shadow.remove(&table_id) {
            for v in entries {
                let _ = self.tables.remove(&KsTableKey::new(table_id, v));
            }
        }
        Ok(())
    }
}

pub struct EbpfLoader {
    tracker: KsProcessTracker,
}

impl EbpfLoader {
    pub fn new(tracker: KsProcessTracker) -> EbpfLoader {
        EbpfLoader { tracker }
    }

    pub fn attach(&self, bpf: &mut Bpf, probes: Vec<Box<dyn Probe>>) -> Result<(), anyhow::Error> {
        for probe in probes {
            probe.init(bpf, self.tracker.snd.clone())?;
        }

        Ok(())
    }
}
