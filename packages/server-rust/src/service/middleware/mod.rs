//! Tower middleware for the request intake.
//!
//! - [`metrics`]: request spans, counters and latency
//! - [`panic`]: turns handler panics into errors
//! - [`pipeline`]: composes the layers around the intake

pub mod metrics;
pub mod panic;
pub mod pipeline;

pub use metrics::MetricsLayer;
pub use panic::{PanicRecoveryLayer, RecoveredPanic};
pub use pipeline::build_intake_pipeline;
