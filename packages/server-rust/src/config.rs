//! Broker configuration.
//!
//! One plain struct per concern, each with a `Default` that matches the
//! production defaults. [`BrokerConfig`] aggregates them and is built once
//! at startup; components receive the parts they need by value or `Arc`.

use std::time::Duration;

/// Pacing and budget for a step that retries on its own.
///
/// `interval` is the backoff between attempts; `timeout` is the cumulative
/// budget after which the step gives up and fails the operation. The two are
/// independent and configured per step class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryTuple {
    pub interval: Duration,
    pub timeout: Duration,
}

impl RetryTuple {
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Worker pool behaviour shared by all operation queues.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Delay before an operation is retried after a non-terminal engine
    /// error (e.g. the store was unreachable).
    pub error_backoff: Duration,
    /// Maximum time to wait for running steps to finish on shutdown.
    pub drain_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            error_backoff: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Worker counts per operation queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerCounts {
    pub provisioning: usize,
    pub deprovisioning: usize,
    pub update: usize,
    pub upgrade_cluster: usize,
}

impl Default for WorkerCounts {
    fn default() -> Self {
        Self {
            provisioning: 20,
            deprovisioning: 20,
            update: 20,
            upgrade_cluster: 10,
        }
    }
}

/// Limits applied by the staged manager to every operation it drives.
#[derive(Debug, Clone, Copy)]
pub struct ProcessConfig {
    /// Operations older than this are failed instead of processed further.
    pub operation_timeout: Duration,
    /// Once a single pass has run this long, the manager yields between
    /// stages so the operation goes back to the queue.
    pub max_pass_duration: Duration,
    /// Backoff of the start step while an earlier operation on the same
    /// instance is still open.
    pub instance_wait_interval: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(24 * 60 * 60),
            max_pass_duration: Duration::from_secs(2 * 60),
            instance_wait_interval: Duration::from_secs(30),
        }
    }
}

/// Per step class retry budgets.
#[derive(Debug, Clone, Copy)]
pub struct StepTimeouts {
    /// Loading plan configuration (template, channel).
    pub plan_config: RetryTuple,
    /// Resolving a cloud subscription or credentials binding.
    pub subscription: RetryTuple,
    /// Talking to the cluster API while creating resources.
    pub cluster_api: RetryTuple,
    /// Waiting for a created runtime resource to become ready.
    pub runtime_resource_create: RetryTuple,
    /// Waiting for an updated runtime resource to become ready.
    pub runtime_resource_update: RetryTuple,
    /// Waiting for a deleted runtime resource to disappear.
    pub runtime_resource_deletion: RetryTuple,
    /// Waiting for a cluster upgrade to settle.
    pub cluster_upgrade: RetryTuple,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        let ten_seconds = Duration::from_secs(10);
        Self {
            plan_config: RetryTuple::new(ten_seconds, Duration::from_secs(30)),
            subscription: RetryTuple::new(ten_seconds, Duration::from_secs(60)),
            cluster_api: RetryTuple::new(ten_seconds, Duration::from_secs(5 * 60)),
            runtime_resource_create: RetryTuple::new(ten_seconds, Duration::from_secs(60 * 60)),
            runtime_resource_update: RetryTuple::new(ten_seconds, Duration::from_secs(3 * 60 * 60)),
            runtime_resource_deletion: RetryTuple::new(ten_seconds, Duration::from_secs(60 * 60)),
            cluster_upgrade: RetryTuple::new(ten_seconds, Duration::from_secs(3 * 60 * 60)),
        }
    }
}

/// Configuration snapshot used to select steps when processes are built.
#[derive(Debug, Clone, Copy)]
pub struct ProvisioningFlags {
    /// Resolve cloud credentials through a credentials binding instead of a
    /// subscription secret.
    pub use_credentials_binding: bool,
    /// Hold steps that would allocate cloud resources.
    pub hold_steps: bool,
    /// Backoff reported by held steps.
    pub hold_interval: Duration,
}

impl Default for ProvisioningFlags {
    fn default() -> Self {
        Self {
            use_credentials_binding: false,
            hold_steps: false,
            hold_interval: Duration::from_secs(60),
        }
    }
}

/// Top-level broker configuration.
#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    pub workers: WorkerCounts,
    pub queue: QueueConfig,
    pub process: ProcessConfig,
    pub step_timeouts: StepTimeouts,
    pub flags: ProvisioningFlags,
}
