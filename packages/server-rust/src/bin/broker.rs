//! `kyma-broker`: runs the operation queues against in-memory collaborators.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use kyma_broker_core::plans::plan_ids;
use kyma_broker_core::{ErsContext, OperationType, PlanRegistry, ProvisioningParameters, RequestParameters};
use kyma_broker_server::clients::{
    CredentialsKind, InMemoryClusterClient, InMemorySubscriptionPool, PlanConfig, StaticPlanConfigProvider,
    DEFAULT_PLAN_CONFIG,
};
use kyma_broker_server::config::{BrokerConfig, ProcessConfig, ProvisioningFlags, QueueConfig, WorkerCounts};
use kyma_broker_server::service::{build_intake_pipeline, BrokerRequest, BrokerResponse, OperationIntake};
use kyma_broker_server::{build_process, MemoryOperationStore, OperationStore, ProcessDependencies, Queue, ShutdownController};
use tower::ServiceExt;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_KYMA_TEMPLATE: &str = r#"{"apiVersion":"operator.kyma-project.io/v1beta2","kind":"Kyma","metadata":{"name":"tbd","namespace":"kcp-system"},"spec":{"channel":"regular","modules":[]}}"#;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "kyma-broker", about = "Kyma environment broker operation processing")]
struct Args {
    #[arg(long, env = "BROKER_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    #[arg(long, env = "BROKER_PROVISIONING_WORKERS", default_value_t = 20)]
    provisioning_workers: usize,
    #[arg(long, env = "BROKER_DEPROVISIONING_WORKERS", default_value_t = 20)]
    deprovisioning_workers: usize,
    #[arg(long, env = "BROKER_UPDATE_WORKERS", default_value_t = 20)]
    update_workers: usize,
    #[arg(long, env = "BROKER_UPGRADE_CLUSTER_WORKERS", default_value_t = 10)]
    upgrade_cluster_workers: usize,

    /// Seconds before a failed pass is retried.
    #[arg(long, env = "BROKER_ERROR_BACKOFF_SECS", default_value_t = 60)]
    error_backoff_secs: u64,
    /// Seconds to wait for running passes on shutdown.
    #[arg(long, env = "BROKER_DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    drain_timeout_secs: u64,
    /// Hours after which an unfinished operation is failed.
    #[arg(long, env = "BROKER_OPERATION_TIMEOUT_HOURS", default_value_t = 24)]
    operation_timeout_hours: u64,

    #[arg(long, env = "BROKER_USE_CREDENTIALS_BINDING")]
    use_credentials_binding: bool,
    /// Park provisioning before cluster creation.
    #[arg(long, env = "BROKER_HOLD_STEPS")]
    hold_steps: bool,

    /// State reads before the in-memory cluster settles a change.
    #[arg(long, env = "BROKER_FAKE_CLUSTER_POLLS", default_value_t = 2)]
    fake_cluster_polls: u32,
    /// Accept one provisioning request for the given instance at startup.
    #[arg(long)]
    demo_provision: Option<String>,
    /// Plan of the startup provisioning request.
    #[arg(long, default_value = plan_ids::AWS)]
    demo_plan_id: String,
    #[arg(long, default_value = "eu-central-1")]
    demo_region: String,
    #[arg(long, default_value = "demo-global-account")]
    demo_global_account_id: String,
    #[arg(long, default_value = "demo-subaccount")]
    demo_subaccount_id: String,
}

impl Args {
    fn demo_parameters(&self, instance_id: &str) -> ProvisioningParameters {
        ProvisioningParameters {
            plan_id: self.demo_plan_id.clone(),
            ers_context: ErsContext {
                global_account_id: self.demo_global_account_id.clone(),
                subaccount_id: self.demo_subaccount_id.clone(),
                ..ErsContext::default()
            },
            parameters: RequestParameters {
                name: instance_id.to_string(),
                region: Some(self.demo_region.clone()),
                ..RequestParameters::default()
            },
            ..ProvisioningParameters::default()
        }
    }

    fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            workers: WorkerCounts {
                provisioning: self.provisioning_workers,
                deprovisioning: self.deprovisioning_workers,
                update: self.update_workers,
                upgrade_cluster: self.upgrade_cluster_workers,
            },
            queue: QueueConfig {
                error_backoff: Duration::from_secs(self.error_backoff_secs),
                drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            },
            process: ProcessConfig {
                operation_timeout: Duration::from_secs(self.operation_timeout_hours * 60 * 60),
                ..ProcessConfig::default()
            },
            flags: ProvisioningFlags {
                use_credentials_binding: self.use_credentials_binding,
                hold_steps: self.hold_steps,
                ..ProvisioningFlags::default()
            },
            ..BrokerConfig::default()
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

fn worker_count(workers: &WorkerCounts, operation_type: OperationType) -> usize {
    match operation_type {
        OperationType::Provision => workers.provisioning,
        OperationType::Deprovision => workers.deprovisioning,
        OperationType::Update => workers.update,
        OperationType::UpgradeCluster => workers.upgrade_cluster,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);
    let config = args.broker_config();

    let store: Arc<dyn OperationStore> = Arc::new(MemoryOperationStore::new());
    let deps = ProcessDependencies {
        store: Arc::clone(&store),
        cluster: Arc::new(InMemoryClusterClient::new(args.fake_cluster_polls)),
        plan_config: Arc::new(StaticPlanConfigProvider::new().with_plan(
            DEFAULT_PLAN_CONFIG,
            PlanConfig {
                kyma_template: DEFAULT_KYMA_TEMPLATE.to_string(),
            },
        )),
        subscriptions: Arc::new(
            InMemorySubscriptionPool::new()
                .with_free(CredentialsKind::SubscriptionSecret, &["secret-1", "secret-2", "secret-3"])
                .with_free(CredentialsKind::CredentialsBinding, &["binding-1", "binding-2", "binding-3"]),
        ),
        plans: Arc::new(PlanRegistry::kyma_defaults()),
    };

    let shutdown = Arc::new(ShutdownController::new());
    let mut queues = HashMap::new();
    for operation_type in OperationType::ALL {
        let manager = build_process(operation_type, &deps, &config)
            .with_context(|| format!("building the {operation_type} process"))?;
        let queue = Arc::new(Queue::new(
            operation_type.as_str(),
            Arc::new(manager),
            config.queue.clone(),
            Arc::clone(&shutdown),
        ));
        queue.run(shutdown.stop_signal(), worker_count(&config.workers, operation_type));
        queue
            .resume_unfinished(store.as_ref(), operation_type)
            .await
            .with_context(|| format!("resuming {operation_type} operations"))?;
        queues.insert(operation_type, queue);
    }

    let intake = build_intake_pipeline(OperationIntake::new(
        Arc::clone(&store),
        Arc::clone(&deps.plans),
        Arc::clone(&shutdown),
        queues.clone(),
    ));
    shutdown.set_ready();
    info!("broker ready");

    if let Some(instance_id) = &args.demo_provision {
        let request = BrokerRequest::Provision {
            instance_id: instance_id.clone(),
            operation_id: None,
            parameters: args.demo_parameters(instance_id),
        };
        if let BrokerResponse::Accepted { operation_id } = intake.clone().oneshot(request).await? {
            info!(%instance_id, %operation_id, "demo provisioning accepted");
        }
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");
    shutdown.trigger_shutdown();
    if !shutdown.wait_for_drain(config.queue.drain_timeout).await {
        warn!(running = shutdown.running_passes(), "drain timeout reached with passes still running");
    }
    for queue in queues.values() {
        queue.shutdown(config.queue.drain_timeout).await;
    }
    info!("broker stopped");
    Ok(())
}
