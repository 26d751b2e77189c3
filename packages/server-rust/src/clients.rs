//! Collaborators the provisioning steps talk to.
//!
//! Each external system is a trait so steps can be driven against the real
//! API or the in-memory implementations in this module. The in-memory
//! versions back the standalone binary and the tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// Cluster API
// ---------------------------------------------------------------------------

/// Desired shape of a runtime resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeResourceSpec {
    pub name: String,
    pub runtime_id: String,
    pub plan_name: String,
    pub region: Option<String>,
    pub machine_type: Option<String>,
    pub kubernetes_version: Option<String>,
    pub auto_scaler_min: Option<u32>,
    pub auto_scaler_max: Option<u32>,
    pub subscription_name: Option<String>,
}

/// Observed state of a runtime resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeResourceState {
    Pending,
    Ready,
    Failed { reason: String },
}

/// Kyma custom resource to apply on the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KymaResource {
    pub name: String,
    pub namespace: String,
    pub template: String,
    pub channel: String,
}

/// Cluster-side operations needed by the steps.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn create_runtime_resource(&self, spec: &RuntimeResourceSpec) -> anyhow::Result<()>;

    async fn update_runtime_resource(&self, spec: &RuntimeResourceSpec) -> anyhow::Result<()>;

    /// `None` if the resource does not exist.
    async fn runtime_resource_state(&self, name: &str) -> anyhow::Result<Option<RuntimeResourceState>>;

    /// Deleting a missing resource succeeds.
    async fn delete_runtime_resource(&self, name: &str) -> anyhow::Result<()>;

    async fn apply_kyma_resource(&self, resource: &KymaResource) -> anyhow::Result<()>;

    /// Stores Service Manager credentials for the BTP operator on the runtime.
    async fn apply_btp_operator_credentials(
        &self,
        runtime_id: &str,
        credentials: &BTreeMap<String, String>,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
struct FakeRuntime {
    spec: RuntimeResourceSpec,
    polls_until_ready: u32,
    deleting_polls: Option<u32>,
}

/// In-memory cluster. A runtime resource turns `Ready` after a fixed number
/// of state reads; a deleted one disappears after the same number of reads.
#[derive(Debug, Default)]
pub struct InMemoryClusterClient {
    runtimes: Mutex<HashMap<String, FakeRuntime>>,
    kyma_resources: Mutex<HashMap<String, KymaResource>>,
    btp_credentials: Mutex<HashMap<String, BTreeMap<String, String>>>,
    polls_to_settle: u32,
}

impl InMemoryClusterClient {
    /// `polls_to_settle` state reads are needed before a create, update or
    /// delete takes effect.
    #[must_use]
    pub fn new(polls_to_settle: u32) -> Self {
        Self {
            polls_to_settle,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn runtime_spec(&self, name: &str) -> Option<RuntimeResourceSpec> {
        self.runtimes.lock().get(name).map(|r| r.spec.clone())
    }

    #[must_use]
    pub fn kyma_resource(&self, name: &str) -> Option<KymaResource> {
        self.kyma_resources.lock().get(name).cloned()
    }

    #[must_use]
    pub fn btp_credentials(&self, runtime_id: &str) -> Option<BTreeMap<String, String>> {
        self.btp_credentials.lock().get(runtime_id).cloned()
    }
}

#[async_trait]
impl ClusterClient for InMemoryClusterClient {
    async fn create_runtime_resource(&self, spec: &RuntimeResourceSpec) -> anyhow::Result<()> {
        let mut runtimes = self.runtimes.lock();
        runtimes.entry(spec.name.clone()).or_insert_with(|| FakeRuntime {
            spec: spec.clone(),
            polls_until_ready: self.polls_to_settle,
            deleting_polls: None,
        });
        Ok(())
    }

    async fn update_runtime_resource(&self, spec: &RuntimeResourceSpec) -> anyhow::Result<()> {
        let mut runtimes = self.runtimes.lock();
        let runtime = runtimes
            .get_mut(&spec.name)
            .ok_or_else(|| anyhow::anyhow!("runtime resource {} not found", spec.name))?;
        if runtime.spec != *spec {
            runtime.spec = spec.clone();
            runtime.polls_until_ready = self.polls_to_settle;
        }
        Ok(())
    }

    async fn runtime_resource_state(&self, name: &str) -> anyhow::Result<Option<RuntimeResourceState>> {
        let mut runtimes = self.runtimes.lock();
        let Some(runtime) = runtimes.get_mut(name) else {
            return Ok(None);
        };
        if let Some(remaining) = runtime.deleting_polls.as_mut() {
            if *remaining == 0 {
                runtimes.remove(name);
                return Ok(None);
            }
            *remaining -= 1;
            return Ok(Some(RuntimeResourceState::Pending));
        }
        if runtime.polls_until_ready == 0 {
            return Ok(Some(RuntimeResourceState::Ready));
        }
        runtime.polls_until_ready -= 1;
        Ok(Some(RuntimeResourceState::Pending))
    }

    async fn delete_runtime_resource(&self, name: &str) -> anyhow::Result<()> {
        if let Some(runtime) = self.runtimes.lock().get_mut(name) {
            runtime.deleting_polls.get_or_insert(self.polls_to_settle);
        }
        Ok(())
    }

    async fn apply_kyma_resource(&self, resource: &KymaResource) -> anyhow::Result<()> {
        self.kyma_resources
            .lock()
            .insert(resource.name.clone(), resource.clone());
        Ok(())
    }

    async fn apply_btp_operator_credentials(
        &self,
        runtime_id: &str,
        credentials: &BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        self.btp_credentials
            .lock()
            .insert(runtime_id.to_string(), credentials.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Plan configuration
// ---------------------------------------------------------------------------

/// Per-plan runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanConfig {
    /// Kyma resource template. JSON, so it is valid YAML as well.
    pub kyma_template: String,
}

/// Supplies the configuration of a plan.
#[async_trait]
pub trait PlanConfigProvider: Send + Sync {
    async fn plan_config(&self, plan_name: &str) -> anyhow::Result<PlanConfig>;
}

/// Plan name used when no plan specific entry exists.
pub const DEFAULT_PLAN_CONFIG: &str = "default";

/// Fixed plan configuration, with an optional `default` entry as fallback.
#[derive(Debug, Default)]
pub struct StaticPlanConfigProvider {
    configs: HashMap<String, PlanConfig>,
}

impl StaticPlanConfigProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_plan(mut self, plan_name: &str, config: PlanConfig) -> Self {
        self.configs.insert(plan_name.to_string(), config);
        self
    }
}

#[async_trait]
impl PlanConfigProvider for StaticPlanConfigProvider {
    async fn plan_config(&self, plan_name: &str) -> anyhow::Result<PlanConfig> {
        self.configs
            .get(plan_name)
            .or_else(|| self.configs.get(DEFAULT_PLAN_CONFIG))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no configuration for plan {plan_name}"))
    }
}

// ---------------------------------------------------------------------------
// Cloud subscriptions
// ---------------------------------------------------------------------------

/// How cloud credentials are attached to a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialsKind {
    SubscriptionSecret,
    CredentialsBinding,
}

/// Request for cloud credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub global_account_id: String,
    pub subaccount_id: String,
    pub plan_name: String,
    pub region: Option<String>,
}

/// Finds (or claims) the cloud credentials for a new cluster.
#[async_trait]
pub trait SubscriptionResolver: Send + Sync {
    /// `Ok(None)` means nothing is available yet.
    async fn resolve(&self, kind: CredentialsKind, request: &SubscriptionRequest) -> anyhow::Result<Option<String>>;
}

/// Pool of unclaimed credentials names per kind. Claims are sticky per
/// global account.
#[derive(Debug, Default)]
pub struct InMemorySubscriptionPool {
    free: Mutex<HashMap<CredentialsKind, Vec<String>>>,
    claimed: Mutex<HashMap<(CredentialsKind, String), String>>,
}

impl InMemorySubscriptionPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_free(self, kind: CredentialsKind, names: &[&str]) -> Self {
        self.free
            .lock()
            .entry(kind)
            .or_default()
            .extend(names.iter().map(ToString::to_string));
        self
    }
}

#[async_trait]
impl SubscriptionResolver for InMemorySubscriptionPool {
    async fn resolve(&self, kind: CredentialsKind, request: &SubscriptionRequest) -> anyhow::Result<Option<String>> {
        let key = (kind, request.global_account_id.clone());
        let mut claimed = self.claimed.lock();
        if let Some(name) = claimed.get(&key) {
            return Ok(Some(name.clone()));
        }
        let next = self.free.lock().get_mut(&kind).and_then(Vec::pop);
        if let Some(name) = &next {
            claimed.insert(key, name.clone());
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> RuntimeResourceSpec {
        RuntimeResourceSpec {
            name: name.to_string(),
            runtime_id: "rid".to_string(),
            plan_name: "aws".to_string(),
            ..RuntimeResourceSpec::default()
        }
    }

    #[tokio::test]
    async fn runtime_becomes_ready_after_polls() {
        let cluster = InMemoryClusterClient::new(2);
        cluster.create_runtime_resource(&spec("rt")).await.unwrap();

        assert_eq!(cluster.runtime_resource_state("rt").await.unwrap(), Some(RuntimeResourceState::Pending));
        assert_eq!(cluster.runtime_resource_state("rt").await.unwrap(), Some(RuntimeResourceState::Pending));
        assert_eq!(cluster.runtime_resource_state("rt").await.unwrap(), Some(RuntimeResourceState::Ready));
    }

    #[tokio::test]
    async fn deleted_runtime_disappears_after_polls() {
        let cluster = InMemoryClusterClient::new(1);
        cluster.create_runtime_resource(&spec("rt")).await.unwrap();
        cluster.delete_runtime_resource("rt").await.unwrap();

        assert_eq!(cluster.runtime_resource_state("rt").await.unwrap(), Some(RuntimeResourceState::Pending));
        assert_eq!(cluster.runtime_resource_state("rt").await.unwrap(), None);
        cluster.delete_runtime_resource("rt").await.unwrap();
    }

    #[tokio::test]
    async fn update_of_missing_runtime_fails() {
        let cluster = InMemoryClusterClient::new(0);
        assert!(cluster.update_runtime_resource(&spec("nope")).await.is_err());
    }

    #[tokio::test]
    async fn static_provider_falls_back_to_default() {
        let provider = StaticPlanConfigProvider::new().with_plan(
            DEFAULT_PLAN_CONFIG,
            PlanConfig {
                kyma_template: r#"{"kind":"Kyma"}"#.to_string(),
            },
        );
        assert_eq!(provider.plan_config("trial").await.unwrap().kyma_template, r#"{"kind":"Kyma"}"#);
        assert!(StaticPlanConfigProvider::new().plan_config("trial").await.is_err());
    }

    #[tokio::test]
    async fn subscription_claims_are_sticky() {
        let pool = InMemorySubscriptionPool::new().with_free(CredentialsKind::SubscriptionSecret, &["s1", "s2"]);
        let request = SubscriptionRequest {
            global_account_id: "ga".to_string(),
            subaccount_id: "sa".to_string(),
            plan_name: "aws".to_string(),
            region: None,
        };
        let first = pool.resolve(CredentialsKind::SubscriptionSecret, &request).await.unwrap();
        let again = pool.resolve(CredentialsKind::SubscriptionSecret, &request).await.unwrap();
        assert_eq!(first, again);
        assert!(pool.resolve(CredentialsKind::CredentialsBinding, &request).await.unwrap().is_none());
    }
}
