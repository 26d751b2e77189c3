//! Broker lifecycle: readiness, stop signal and tracking of running passes.
//!
//! Queues take a pass guard for every operation pass they start and stop
//! pulling work once the stop signal fires. The intake consults the health
//! state and refuses new operations while the broker drains.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Broker lifecycle state.
///
/// Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    /// Accepting requests and processing operations.
    Ready,
    /// Stop signalled; running passes finish, nothing new starts.
    Draining,
    /// Every running pass has finished.
    Stopped,
}

/// Coordinates a graceful stop of queues and intake.
#[derive(Debug)]
pub struct ShutdownController {
    stop: watch::Sender<bool>,
    running: Arc<AtomicU64>,
    health: Arc<ArcSwap<HealthState>>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            stop,
            running: Arc::new(AtomicU64::new(0)),
            health: Arc::new(ArcSwap::from_pointee(HealthState::Starting)),
        }
    }

    pub fn set_ready(&self) {
        self.health.store(Arc::new(HealthState::Ready));
    }

    /// Receiver that flips to `true` once [`Self::trigger_shutdown`] runs.
    #[must_use]
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// Moves to `Draining` and signals every queue to stop pulling work.
    pub fn trigger_shutdown(&self) {
        self.health.store(Arc::new(HealthState::Draining));
        self.stop.send_replace(true);
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.health.load()
    }

    /// `true` only while `Ready`.
    #[must_use]
    pub fn accepts_requests(&self) -> bool {
        self.health_state() == HealthState::Ready
    }

    /// Tracks one running operation pass until the guard is dropped. The
    /// guard is released during unwinding too.
    #[must_use]
    pub fn pass_guard(&self) -> PassGuard {
        self.running.fetch_add(1, Ordering::Relaxed);
        PassGuard {
            running: Arc::clone(&self.running),
        }
    }

    #[must_use]
    pub fn running_passes(&self) -> u64 {
        self.running.load(Ordering::Relaxed)
    }

    /// Waits until no pass is running, up to `timeout`. On success the
    /// state becomes `Stopped`; on timeout it stays `Draining` and `false`
    /// is returned.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.running.load(Ordering::Relaxed) == 0 {
                self.health.store(Arc::new(HealthState::Stopped));
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the running pass counter on drop.
#[derive(Debug)]
pub struct PassGuard {
    running: Arc<AtomicU64>,
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::Relaxed);
    }
}
