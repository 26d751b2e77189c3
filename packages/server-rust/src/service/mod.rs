//! Request side of the broker.
//!
//! 1. **Intake** (`intake`): lifecycle requests -> persisted operations -> queues
//! 2. **Middleware** (`middleware`): Tower layers around the intake

pub mod intake;
pub mod middleware;

pub use intake::{BrokerRequest, BrokerResponse, IntakeError, OperationIntake};
pub use middleware::build_intake_pipeline;
