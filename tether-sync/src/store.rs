//! The local replica boundary.
//!
//! The sync engine reads and writes the local copy of user data through
//! [`ItemStore`]. The durable store is an external collaborator; the
//! in-memory implementation here backs tests and fresh-profile defaults.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use tether_core::{DataType, ItemId, SyncError, SyncItem, SyncOperation};

/// Storage abstraction for the local replica.
///
/// "Dirty" means locally mutated and not yet acknowledged by the remote -
/// the local version must not be silently overwritten by a pull.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Latest local version of a record, if any.
    async fn get(&self, id: ItemId, data_type: DataType) -> Result<Option<SyncItem>, SyncError>;

    /// Apply a remote (or resolved) item: upsert for create/update, remove
    /// for delete. The record ends up clean.
    async fn apply_remote(&self, item: &SyncItem) -> Result<(), SyncError>;

    /// Record a local mutation. The record becomes dirty until acknowledged.
    async fn apply_local(&self, item: &SyncItem) -> Result<(), SyncError>;

    /// Clear the dirty flag once the remote acknowledged the record.
    async fn mark_clean(&self, id: ItemId, data_type: DataType) -> Result<(), SyncError>;

    async fn is_dirty(&self, id: ItemId, data_type: DataType) -> Result<bool, SyncError>;

    async fn list_dirty(&self) -> Result<Vec<SyncItem>, SyncError>;
}

// ============================================================================
// IN-MEMORY IMPLEMENTATION
// ============================================================================

#[derive(Debug, Clone)]
struct StoredRecord {
    item: SyncItem,
    dirty: bool,
}

/// RwLock-over-HashMap store keyed by `(id, data_type)`.
#[derive(Debug, Default)]
pub struct InMemoryItemStore {
    records: RwLock<HashMap<(ItemId, DataType), StoredRecord>>,
}

impl InMemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read_guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_guard().is_empty()
    }

    fn read_guard(&self) -> std::sync::RwLockReadGuard<'_, HashMap<(ItemId, DataType), StoredRecord>> {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_guard(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<(ItemId, DataType), StoredRecord>> {
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn store(&self, item: &SyncItem, dirty: bool) {
        let mut records = self.write_guard();
        match item.operation {
            SyncOperation::Delete => {
                if dirty {
                    // A local delete stays visible as a dirty tombstone until
                    // the remote acknowledges it.
                    records.insert(
                        item.record_key(),
                        StoredRecord {
                            item: item.clone(),
                            dirty,
                        },
                    );
                } else {
                    records.remove(&item.record_key());
                }
            }
            SyncOperation::Create | SyncOperation::Update => {
                records.insert(
                    item.record_key(),
                    StoredRecord {
                        item: item.clone(),
                        dirty,
                    },
                );
            }
        }
    }
}

#[async_trait]
impl ItemStore for InMemoryItemStore {
    async fn get(&self, id: ItemId, data_type: DataType) -> Result<Option<SyncItem>, SyncError> {
        Ok(self
            .read_guard()
            .get(&(id, data_type))
            .map(|record| record.item.clone()))
    }

    async fn apply_remote(&self, item: &SyncItem) -> Result<(), SyncError> {
        self.store(item, false);
        Ok(())
    }

    async fn apply_local(&self, item: &SyncItem) -> Result<(), SyncError> {
        self.store(item, true);
        Ok(())
    }

    async fn mark_clean(&self, id: ItemId, data_type: DataType) -> Result<(), SyncError> {
        let mut records = self.write_guard();
        if let Some(record) = records.get_mut(&(id, data_type)) {
            if record.dirty && record.item.operation == SyncOperation::Delete {
                // Acknowledged tombstones are gone for good.
                records.remove(&(id, data_type));
            } else {
                record.dirty = false;
            }
        }
        Ok(())
    }

    async fn is_dirty(&self, id: ItemId, data_type: DataType) -> Result<bool, SyncError> {
        Ok(self
            .read_guard()
            .get(&(id, data_type))
            .map(|record| record.dirty)
            .unwrap_or(false))
    }

    async fn list_dirty(&self) -> Result<Vec<SyncItem>, SyncError> {
        Ok(self
            .read_guard()
            .values()
            .filter(|record| record.dirty)
            .map(|record| record.item.clone())
            .collect())
    }
}

// ============================================================================
// TESTS
// ============================================================================
