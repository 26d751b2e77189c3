//! In-memory [`OperationStore`] backed by [`DashMap`].
//!
//! Rows are kept in serialized form, the way a database would hold them, so
//! callers never share mutable state with the store and every read returns
//! an independent copy. Version checks and state transition checks run
//! under the row's shard lock, which makes each update atomic.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kyma_broker_core::{now_millis, Operation, OperationState, OperationType};

use super::encryption::Encrypter;
use super::operations::{OperationStore, StorageError};

#[derive(Debug, Clone)]
struct StoredRow {
    data: String,
    version: u64,
    state: OperationState,
    instance_id: String,
    operation_type: OperationType,
    created_at: i64,
    encryption_mode: Option<String>,
}

/// Concurrent in-memory operation store.
#[derive(Debug, Default)]
pub struct MemoryOperationStore {
    rows: DashMap<String, StoredRow>,
    encrypter: Option<Arc<Encrypter>>,
}

impl MemoryOperationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that seals sensitive fields with `encrypter`.
    #[must_use]
    pub fn with_encrypter(encrypter: Arc<Encrypter>) -> Self {
        Self {
            rows: DashMap::new(),
            encrypter: Some(encrypter),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of rows per encryption mode tag. Rows without sensitive
    /// sealing are counted under the empty string.
    #[must_use]
    pub fn encryption_mode_stats(&self) -> BTreeMap<String, usize> {
        let mut stats = BTreeMap::new();
        for row in &self.rows {
            let mode = row.encryption_mode.clone().unwrap_or_default();
            *stats.entry(mode).or_insert(0) += 1;
        }
        stats
    }

    fn encode(&self, operation: &Operation) -> Result<StoredRow, StorageError> {
        let mut sealed = operation.clone();
        let encryption_mode = match &self.encrypter {
            Some(encrypter) => Some(encrypter.encrypt_sensitive(&mut sealed.provisioning_parameters)?),
            None => None,
        };
        let data = serde_json::to_string(&sealed).map_err(anyhow::Error::from)?;
        Ok(StoredRow {
            data,
            version: operation.version,
            state: operation.state,
            instance_id: operation.instance_id.clone(),
            operation_type: operation.operation_type,
            created_at: operation.created_at,
            encryption_mode,
        })
    }

    fn decode(&self, row: &StoredRow) -> Result<Operation, StorageError> {
        let mut operation: Operation =
            serde_json::from_str(&row.data).map_err(anyhow::Error::from)?;
        if let Some(encrypter) = &self.encrypter {
            encrypter.decrypt_sensitive(
                &mut operation.provisioning_parameters,
                row.encryption_mode.as_deref(),
            )?;
        }
        Ok(operation)
    }

    fn collect_sorted<F>(&self, filter: F) -> Result<Vec<Operation>, StorageError>
    where
        F: Fn(&StoredRow) -> bool,
    {
        let mut rows: Vec<StoredRow> = self
            .rows
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        rows.iter().map(|row| self.decode(row)).collect()
    }
}

#[async_trait]
impl OperationStore for MemoryOperationStore {
    async fn insert_operation(&self, operation: Operation) -> Result<Operation, StorageError> {
        let row = self.encode(&operation)?;
        match self.rows.entry(operation.id.clone()) {
            Entry::Occupied(_) => Err(StorageError::AlreadyExists { id: operation.id }),
            Entry::Vacant(slot) => {
                slot.insert(row);
                Ok(operation)
            }
        }
    }

    async fn get_operation_by_id(&self, id: &str) -> Result<Operation, StorageError> {
        let row = self
            .rows
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| StorageError::NotFound { id: id.to_string() })?;
        self.decode(&row)
    }

    async fn update_operation(&self, operation: Operation) -> Result<Operation, StorageError> {
        let mut row = self
            .rows
            .get_mut(&operation.id)
            .ok_or_else(|| StorageError::NotFound {
                id: operation.id.clone(),
            })?;

        if row.version != operation.version {
            return Err(StorageError::VersionConflict {
                id: operation.id,
                expected: operation.version,
                actual: row.version,
            });
        }
        if !row.state.can_transition_to(operation.state) {
            return Err(StorageError::InvalidTransition {
                id: operation.id,
                from: row.state,
                to: operation.state,
            });
        }

        let mut stored = operation;
        stored.version += 1;
        stored.updated_at = now_millis().max(stored.updated_at);
        *row = self.encode(&stored)?;
        Ok(stored)
    }

    async fn list_operations_by_instance_id(
        &self,
        instance_id: &str,
    ) -> Result<Vec<Operation>, StorageError> {
        self.collect_sorted(|row| row.instance_id == instance_id)
    }

    async fn get_not_finished_operations_by_type(
        &self,
        operation_type: OperationType,
    ) -> Result<Vec<Operation>, StorageError> {
        self.collect_sorted(|row| row.operation_type == operation_type && !row.state.is_terminal())
    }

    async fn delete_by_id(&self, id: &str) -> Result<(), StorageError> {
        self.rows
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound { id: id.to_string() })
    }
}
