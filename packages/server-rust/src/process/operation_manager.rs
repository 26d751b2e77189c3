//! Persistence helper bound to one step.
//!
//! Steps never write to the store directly. They go through an
//! [`OperationManager`], which owns the failure, retry and version-conflict
//! bookkeeping so every step reports outcomes the same way.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use kyma_broker_core::time::elapsed_since;
use kyma_broker_core::{now_millis, ErrorComponent, LastError, Operation, OperationState};
use tracing::{error, info, warn};

use super::step::{StepError, StepResult};
use crate::storage::{OperationStore, StorageError};

/// Persists step outcomes for one step name and error component.
#[derive(Clone)]
pub struct OperationManager {
    store: Arc<dyn OperationStore>,
    step: String,
    component: ErrorComponent,
}

impl OperationManager {
    #[must_use]
    pub fn new(
        store: Arc<dyn OperationStore>,
        step: impl Into<String>,
        component: ErrorComponent,
    ) -> Self {
        Self {
            store,
            step: step.into(),
            component,
        }
    }

    #[must_use]
    pub fn step(&self) -> &str {
        &self.step
    }

    /// Marks the operation `Failed` with `message` as description and error
    /// metadata built from `cause`.
    ///
    /// Always returns `Err`: [`StepError::OperationFailed`] carrying the
    /// persisted operation, or [`StepError::Storage`] if the write failed
    /// (the step then fails again on the next pass).
    ///
    /// # Errors
    ///
    /// See above; there is no `Ok` outcome.
    pub async fn operation_failed(
        &self,
        operation: Operation,
        message: &str,
        cause: Option<&(dyn Display + Sync)>,
    ) -> StepResult {
        let reason = cause.map(ToString::to_string);
        let last_error = LastError::new(self.component, &self.step, message, reason.as_deref());

        let failed = self
            .update_operation(operation, |op| {
                op.state = OperationState::Failed;
                op.description = message.to_string();
                op.last_error = Some(last_error.clone());
            })
            .await?;

        error!(
            operation_id = %failed.id,
            step = %self.step,
            component = %self.component,
            reason = %last_error.reason,
            "{message}"
        );
        metrics::counter!(
            "broker_operations_finished_total",
            "type" => failed.operation_type.as_str(),
            "state" => "failed"
        )
        .increment(1);

        Err(StepError::OperationFailed {
            operation: Box::new(failed),
            step: self.step.clone(),
            message: message.to_string(),
        })
    }

    /// Asks for the step to be re-run after `interval`.
    ///
    /// The first call for this step persists the retry start time on the
    /// operation. Once more than `timeout` has passed since then, the call
    /// fails the operation instead.
    ///
    /// # Errors
    ///
    /// [`StepError::OperationFailed`] when the budget is exhausted,
    /// [`StepError::Storage`] if bookkeeping could not be persisted.
    pub async fn retry_operation(
        &self,
        operation: Operation,
        message: &str,
        cause: Option<&(dyn Display + Sync)>,
        interval: Duration,
        timeout: Duration,
    ) -> StepResult {
        let now = now_millis();
        match operation.retry_started_at.get(&self.step).copied() {
            Some(started) if elapsed_since(started, now) > timeout => {
                warn!(
                    operation_id = %operation.id,
                    step = %self.step,
                    ?timeout,
                    "retry budget exhausted"
                );
                self.operation_failed(operation, message, cause).await
            }
            Some(_) => {
                info!(
                    operation_id = %operation.id,
                    step = %self.step,
                    ?interval,
                    "{message}, retrying"
                );
                Ok((operation, interval))
            }
            None => {
                let reason = cause.map(ToString::to_string);
                let last_error =
                    LastError::new(self.component, &self.step, message, reason.as_deref());
                let step = self.step.clone();
                let updated = self
                    .update_operation(operation, |op| {
                        op.retry_started_at.entry(step.clone()).or_insert(now);
                        op.last_error = Some(last_error.clone());
                    })
                    .await?;
                info!(
                    operation_id = %updated.id,
                    step = %self.step,
                    ?interval,
                    ?timeout,
                    "{message}, first retry"
                );
                Ok((updated, interval))
            }
        }
    }

    /// Applies `mutate` and persists the result.
    ///
    /// On a version conflict the latest stored operation is reloaded and the
    /// mutation applied to it once more before giving up, so neither side's
    /// fields are silently dropped.
    ///
    /// # Errors
    ///
    /// Storage failures, or a second conflict in a row.
    pub async fn update_operation<F>(
        &self,
        operation: Operation,
        mutate: F,
    ) -> Result<Operation, StepError>
    where
        F: Fn(&mut Operation) + Send + Sync,
    {
        let id = operation.id.clone();
        let mut candidate = operation;
        mutate(&mut candidate);
        match self.store.update_operation(candidate).await {
            Ok(updated) => Ok(updated),
            Err(StorageError::VersionConflict { expected, actual, .. }) => {
                warn!(
                    operation_id = %id,
                    step = %self.step,
                    expected,
                    actual,
                    "version conflict, reapplying changes to the latest operation"
                );
                let mut latest = self.store.get_operation_by_id(&id).await?;
                mutate(&mut latest);
                Ok(self.store.update_operation(latest).await?)
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl std::fmt::Debug for OperationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationManager")
            .field("step", &self.step)
            .field("component", &self.component)
            .finish_non_exhaustive()
    }
}
