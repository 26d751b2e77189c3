//! Composes the middleware layers around the operation intake.

use tower::ServiceBuilder;

use super::metrics::MetricsLayer;
use super::panic::PanicRecoveryLayer;
use crate::service::intake::{BrokerRequest, BrokerResponse, IntakeError, OperationIntake};

/// Wraps the intake with its middleware.
///
/// Layer order (outermost to innermost):
/// 1. `MetricsLayer`: span, outcome counters, latency
/// 2. `PanicRecoveryLayer`: a panicking handler answers with an error
#[must_use]
pub fn build_intake_pipeline(
    intake: OperationIntake,
) -> impl tower::Service<BrokerRequest, Response = BrokerResponse, Error = IntakeError, Future: Send> + Clone + Send
{
    ServiceBuilder::new()
        .layer(MetricsLayer)
        .layer(PanicRecoveryLayer)
        .service(intake)
}
