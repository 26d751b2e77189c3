//! Operation processing engine: steps, staged managers and work queues.

pub mod builder;
pub mod error;
pub mod manager;
pub mod operation_manager;
pub mod queue;
pub mod step;
pub mod steps;

pub use builder::ProcessBuilder;
pub use error::ProcessError;
pub use manager::{Executor, StagedManager, INTERNAL_ERROR, PROCESSING_FINISHED, TIME_LIMIT_REACHED};
pub use operation_manager::OperationManager;
pub use queue::Queue;
pub use step::{condition, Step, StepCondition, StepError, StepResult};
