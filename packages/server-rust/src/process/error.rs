use super::step::StepError;
use crate::storage::StorageError;

/// Errors returned by the staged manager and executors.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("invalid process definition: {0}")]
    Configuration(String),
    #[error("stage {0} is not defined")]
    UnknownStage(String),
    #[error("operation {operation_id} failed in step {step}: {message}")]
    OperationFailed {
        operation_id: String,
        step: String,
        message: String,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ProcessError {
    /// Returns `true` if re-running the operation cannot help and the queue
    /// should drop it.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            ProcessError::Configuration(_)
            | ProcessError::UnknownStage(_)
            | ProcessError::OperationFailed { .. } => true,
            ProcessError::Storage(err) => err.is_not_found(),
            ProcessError::Internal(_) => false,
        }
    }
}

impl From<StepError> for ProcessError {
    fn from(err: StepError) -> Self {
        match err {
            StepError::OperationFailed {
                operation,
                step,
                message,
            } => ProcessError::OperationFailed {
                operation_id: operation.id,
                step,
                message,
            },
            StepError::Storage(err) => ProcessError::Storage(err),
            StepError::Other(err) => ProcessError::Internal(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(ProcessError::Configuration("x".into()).is_terminal());
        assert!(ProcessError::UnknownStage("x".into()).is_terminal());
        assert!(ProcessError::Storage(StorageError::NotFound { id: "a".into() }).is_terminal());
        assert!(!ProcessError::Storage(StorageError::VersionConflict {
            id: "a".into(),
            expected: 1,
            actual: 2
        })
        .is_terminal());
        assert!(!ProcessError::Internal(anyhow::anyhow!("boom")).is_terminal());
    }
}
