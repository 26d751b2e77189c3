//! Panic recovery for request services.
//!
//! A panic inside the wrapped service, either while building the response
//! future or while polling it, becomes an error of the service's own error
//! type. The process keeps running and the caller gets an answer.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::FutureExt;
use tower::{Layer, Service};
use tracing::error;

use crate::process::queue::panic_message;

/// A panic caught by [`PanicRecoveryService`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("internal error: request handler panicked: {message}")]
pub struct RecoveredPanic {
    pub message: String,
}

impl RecoveredPanic {
    fn from_payload(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = panic_message(payload);
        error!(panic = %message, "request handler panicked");
        metrics::counter!("broker_request_panics_total").increment(1);
        Self { message }
    }
}

// ---------------------------------------------------------------------------
// PanicRecoveryLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct PanicRecoveryLayer;

impl<S> Layer<S> for PanicRecoveryLayer {
    type Service = PanicRecoveryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PanicRecoveryService { inner }
    }
}

// ---------------------------------------------------------------------------
// PanicRecoveryService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PanicRecoveryService<S> {
    inner: S,
}

impl<S, Request> Service<Request> for PanicRecoveryService<S>
where
    S: Service<Request>,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: From<RecoveredPanic> + Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let inner = &mut self.inner;
        let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| inner.call(request))) {
            Ok(fut) => fut,
            Err(payload) => {
                let err = RecoveredPanic::from_payload(payload.as_ref());
                return Box::pin(std::future::ready(Err(err.into())));
            }
        };
        Box::pin(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(RecoveredPanic::from_payload(payload.as_ref()).into()),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::*;

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error(transparent)]
        Panicked(#[from] RecoveredPanic),
    }

    /// Panics when asked to, either eagerly in `call` or inside the future.
    #[derive(Clone)]
    struct Fragile;

    #[derive(Clone, Copy)]
    enum Mode {
        Fine,
        PanicInCall,
        PanicInFuture,
    }

    impl Service<Mode> for Fragile {
        type Response = &'static str;
        type Error = TestError;
        type Future = Pin<Box<dyn Future<Output = Result<&'static str, TestError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, mode: Mode) -> Self::Future {
            assert!(!matches!(mode, Mode::PanicInCall), "call exploded");
            Box::pin(async move {
                assert!(!matches!(mode, Mode::PanicInFuture), "future exploded");
                Ok("fine")
            })
        }
    }

    #[tokio::test]
    async fn passes_through_normal_responses() {
        let svc = PanicRecoveryLayer.layer(Fragile);
        assert_eq!(svc.oneshot(Mode::Fine).await.unwrap(), "fine");
    }

    #[tokio::test]
    async fn converts_panics_into_errors() {
        for (mode, text) in [(Mode::PanicInCall, "call exploded"), (Mode::PanicInFuture, "future exploded")] {
            let svc = PanicRecoveryLayer.layer(Fragile);
            let TestError::Panicked(recovered) = svc.oneshot(mode).await.unwrap_err();
            assert_eq!(recovered.message, text);
        }
    }
}
