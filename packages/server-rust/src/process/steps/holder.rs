use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kyma_broker_core::Operation;
use tracing::info;

use crate::process::step::{Step, StepResult};

/// Wraps a step that may be held by configuration. A held step never runs;
/// it keeps asking for a backoff instead, parking the operation in its stage.
pub struct HolderStep {
    inner: Arc<dyn Step>,
    hold: bool,
    interval: Duration,
}

impl HolderStep {
    #[must_use]
    pub fn new(inner: Arc<dyn Step>, hold: bool, interval: Duration) -> Self {
        Self { inner, hold, interval }
    }
}

#[async_trait]
impl Step for HolderStep {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(&self, operation: Operation) -> StepResult {
        if self.hold {
            info!(step = self.inner.name(), interval = ?self.interval, "step is held");
            return Ok((operation, self.interval));
        }
        self.inner.run(operation).await
    }
}
