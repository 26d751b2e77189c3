//! Kyma environment broker: staged, durable, retryable processing of
//! instance lifecycle operations.

pub mod clients;
pub mod config;
pub mod process;
pub mod processes;
pub mod service;
pub mod shutdown;
pub mod storage;

pub use config::BrokerConfig;
pub use process::{Executor, ProcessError, Queue, StagedManager, Step, StepError, StepResult};
pub use processes::{build_process, ProcessDependencies};
pub use shutdown::ShutdownController;
pub use storage::{MemoryOperationStore, OperationStore, StorageError};
