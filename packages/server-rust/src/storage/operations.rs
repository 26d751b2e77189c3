//! Operation persistence contract.

use async_trait::async_trait;
use kyma_broker_core::{Operation, OperationState, OperationType};

use super::encryption::CodecError;

/// Errors returned by an [`OperationStore`].
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("operation {id} not found")]
    NotFound { id: String },
    #[error("operation {id} already exists")]
    AlreadyExists { id: String },
    /// The caller wrote from a stale copy; reload and retry.
    #[error("operation {id} was modified concurrently: expected version {expected}, stored version {actual}")]
    VersionConflict { id: String, expected: u64, actual: u64 },
    #[error("illegal state transition for operation {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: OperationState,
        to: OperationState,
    },
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("internal storage error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl StorageError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    #[must_use]
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, StorageError::VersionConflict { .. })
    }
}

/// Durable storage of operations with optimistic concurrency.
///
/// `update_operation` succeeds only when the incoming `version` equals the
/// stored one; the returned operation carries the incremented version and
/// must replace the caller's copy.
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Persists a new operation as given.
    ///
    /// # Errors
    ///
    /// [`StorageError::AlreadyExists`] if the ID is taken.
    async fn insert_operation(&self, operation: Operation) -> Result<Operation, StorageError>;

    /// # Errors
    ///
    /// [`StorageError::NotFound`] if no operation has this ID.
    async fn get_operation_by_id(&self, id: &str) -> Result<Operation, StorageError>;

    /// Version-checked write of the whole operation.
    ///
    /// # Errors
    ///
    /// [`StorageError::VersionConflict`] on a stale version,
    /// [`StorageError::InvalidTransition`] on an illegal state change.
    async fn update_operation(&self, operation: Operation) -> Result<Operation, StorageError>;

    /// All operations of an instance, oldest first.
    ///
    /// # Errors
    ///
    /// Backend failures only; an unknown instance yields an empty list.
    async fn list_operations_by_instance_id(
        &self,
        instance_id: &str,
    ) -> Result<Vec<Operation>, StorageError>;

    /// Non-terminal operations of a type, oldest first.
    ///
    /// # Errors
    ///
    /// Backend failures only.
    async fn get_not_finished_operations_by_type(
        &self,
        operation_type: OperationType,
    ) -> Result<Vec<Operation>, StorageError>;

    /// # Errors
    ///
    /// [`StorageError::NotFound`] if no operation has this ID.
    async fn delete_by_id(&self, id: &str) -> Result<(), StorageError>;
}
