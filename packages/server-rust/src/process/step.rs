//! The unit of work executed by a staged manager.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kyma_broker_core::Operation;

use crate::storage::StorageError;

/// Outcome of one step invocation.
///
/// - `Ok((op, Duration::ZERO))`: the step is done, continue with the next.
/// - `Ok((op, backoff))` with a positive backoff: re-run the operation after
///   `backoff`; the current stage is not finished.
/// - `Err(_)`: see [`StepError`].
pub type StepResult = Result<(Operation, Duration), StepError>;

/// Errors a step can report.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The operation was failed and the failure persisted. Terminal.
    #[error("step {step} failed the operation: {message}")]
    OperationFailed {
        operation: Box<Operation>,
        step: String,
        message: String,
    },
    /// Persisting progress failed. The operation is retried later.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// An error the step did not classify. The manager fails the operation.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One idempotent unit of work inside a stage.
///
/// A step receives the latest persisted operation and returns the operation
/// the manager should continue with. Any mutation meant to survive a crash
/// must be persisted through an `OperationManager` before returning. Steps
/// are shared across workers and must not hold per-operation state.
#[async_trait]
pub trait Step: Send + Sync {
    /// Stable name, used in logs, error metadata and retry bookkeeping.
    fn name(&self) -> &str;

    async fn run(&self, operation: Operation) -> StepResult;
}

/// Predicate deciding whether a step runs for a given operation. Evaluated
/// fresh on every pass against the current operation.
pub type StepCondition = Arc<dyn Fn(&Operation) -> bool + Send + Sync>;

/// Wraps a closure as a [`StepCondition`].
pub fn condition<F>(predicate: F) -> StepCondition
where
    F: Fn(&Operation) -> bool + Send + Sync + 'static,
{
    Arc::new(predicate)
}
