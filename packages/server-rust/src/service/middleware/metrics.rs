//! Request metrics: a span per request plus outcome counters and a
//! latency histogram.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::intake::{BrokerRequest, BrokerResponse, IntakeError};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<BrokerRequest> for MetricsService<S>
where
    S: Service<BrokerRequest, Response = BrokerResponse, Error = IntakeError> + Send,
    S::Future: Send + 'static,
{
    type Response = BrokerResponse;
    type Error = IntakeError;
    type Future = Pin<Box<dyn Future<Output = Result<BrokerResponse, IntakeError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: BrokerRequest) -> Self::Future {
        let kind = request.kind();
        let span = info_span!(
            "request",
            kind,
            instance_id = %request.instance_id(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(request);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(IntakeError::ShuttingDown) => "rejected",
                    Err(_) => "error",
                };

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);
                metrics::counter!("broker_requests_total", "kind" => kind, "outcome" => outcome).increment(1);
                metrics::histogram!("broker_request_duration_seconds", "kind" => kind)
                    .record(elapsed.as_secs_f64());

                tracing::debug!(kind, duration_ms, outcome, "request complete");
                result
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use kyma_broker_core::OperationState;
    use tower::ServiceExt;

    use super::*;

    struct Polls;

    impl Service<BrokerRequest> for Polls {
        type Response = BrokerResponse;
        type Error = IntakeError;
        type Future = Pin<Box<dyn Future<Output = Result<BrokerResponse, IntakeError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _request: BrokerRequest) -> Self::Future {
            Box::pin(async {
                Ok(BrokerResponse::LastOperation {
                    state: OperationState::InProgress,
                    description: "working".to_string(),
                })
            })
        }
    }

    #[tokio::test]
    async fn metrics_layer_passes_through_response() {
        let svc = MetricsLayer.layer(Polls);
        let response = svc
            .oneshot(BrokerRequest::LastOperation {
                instance_id: "inst".to_string(),
                operation_id: "op".to_string(),
            })
            .await
            .unwrap();
        assert!(matches!(
            response,
            BrokerResponse::LastOperation {
                state: OperationState::InProgress,
                ..
            }
        ));
    }
}
