use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::record::TransferRecord;

/// Registry of active transfer records.
///
/// [`remove`](TransferStore::remove) is the exactly-once gate for terminal
/// transitions: only the caller that gets the record back may finish it.
pub trait TransferStore: Send + Sync {
    fn add(&self, record: Arc<TransferRecord>);

    fn get(&self, transfer_id: &str) -> Option<Arc<TransferRecord>>;

    /// Persists changes to a registered record. Returns `false` if the
    /// record is no longer registered.
    fn update(&self, record: &Arc<TransferRecord>) -> bool;

    fn remove(&self, transfer_id: &str) -> Option<Arc<TransferRecord>>;

    fn active_for_resource(&self, resource_id: &str) -> Vec<Arc<TransferRecord>>;
}

/// Process-local [`TransferStore`].
#[derive(Default)]
pub struct InMemoryTransferStore {
    records: RwLock<HashMap<String, Arc<TransferRecord>>>,
}

impl InMemoryTransferStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TransferStore for InMemoryTransferStore {
    fn add(&self, record: Arc<TransferRecord>) {
        let id = record.transfer_id().to_string();
        self.records.write().unwrap().insert(id, record);
    }

    fn get(&self, transfer_id: &str) -> Option<Arc<TransferRecord>> {
        self.records.read().unwrap().get(transfer_id).cloned()
    }

    fn update(&self, record: &Arc<TransferRecord>) -> bool {
        // Records are shared, so there is nothing to write back; only
        // report whether it is still registered.
        self.records
            .read()
            .unwrap()
            .get(record.transfer_id())
            .is_some_and(|stored| Arc::ptr_eq(stored, record))
    }

    fn remove(&self, transfer_id: &str) -> Option<Arc<TransferRecord>> {
        self.records.write().unwrap().remove(transfer_id)
    }

    fn active_for_resource(&self, resource_id: &str) -> Vec<Arc<TransferRecord>> {
        self.records
            .read()
            .unwrap()
            .values()
            .filter(|r| r.resource_id() == resource_id)
            .cloned()
            .collect()
    }
}
