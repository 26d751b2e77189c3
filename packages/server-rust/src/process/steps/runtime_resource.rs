//! Steps that manage the runtime resource describing the cluster.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kyma_broker_core::{ErrorComponent, Operation, PlanRegistry};
use tracing::info;

use crate::clients::{ClusterClient, RuntimeResourceSpec, RuntimeResourceState};
use crate::config::RetryTuple;
use crate::process::operation_manager::OperationManager;
use crate::process::step::{Step, StepResult};
use crate::storage::OperationStore;

/// Builds the desired runtime resource from the operation. `None` until
/// the runtime ID and resource name have been assigned.
#[must_use]
pub fn runtime_resource_spec(operation: &Operation, plans: &PlanRegistry) -> Option<RuntimeResourceSpec> {
    let details = &operation.instance_details;
    let params = &operation.provisioning_parameters;
    let updating = operation.updating_parameters.as_ref();
    Some(RuntimeResourceSpec {
        name: details.runtime_resource_name.clone()?,
        runtime_id: details.runtime_id.clone()?,
        plan_name: plans.plan_name(&params.plan_id).unwrap_or_default().to_string(),
        region: params.parameters.region.clone(),
        machine_type: updating
            .and_then(|u| u.machine_type.clone())
            .or_else(|| params.parameters.machine_type.clone()),
        kubernetes_version: updating.and_then(|u| u.kubernetes_version.clone()),
        auto_scaler_min: updating.and_then(|u| u.auto_scaler_min),
        auto_scaler_max: updating.and_then(|u| u.auto_scaler_max),
        subscription_name: details.subscription_name.clone(),
    })
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

/// Creates the runtime resource. Creating an existing resource is a no-op
/// on the cluster side, so re-runs are safe.
pub struct CreateRuntimeResourceStep {
    operation_manager: OperationManager,
    cluster: Arc<dyn ClusterClient>,
    plans: Arc<PlanRegistry>,
    retry: RetryTuple,
}

impl CreateRuntimeResourceStep {
    pub const NAME: &'static str = "Create_Runtime_Resource";

    #[must_use]
    pub fn new(
        store: Arc<dyn OperationStore>,
        cluster: Arc<dyn ClusterClient>,
        plans: Arc<PlanRegistry>,
        retry: RetryTuple,
    ) -> Self {
        Self {
            operation_manager: OperationManager::new(store, Self::NAME, ErrorComponent::InfrastructureManager),
            cluster,
            plans,
            retry,
        }
    }
}

#[async_trait]
impl Step for CreateRuntimeResourceStep {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self, operation: Operation) -> StepResult {
        let Some(spec) = runtime_resource_spec(&operation, &self.plans) else {
            return self
                .operation_manager
                .operation_failed(operation, "runtime resource name is not set", None)
                .await;
        };
        match self.cluster.create_runtime_resource(&spec).await {
            Ok(()) => {
                info!(runtime_resource = %spec.name, "runtime resource created");
                Ok((operation, Duration::ZERO))
            }
            Err(err) => {
                self.operation_manager
                    .retry_operation(
                        operation,
                        "unable to create runtime resource",
                        Some(&err),
                        self.retry.interval,
                        self.retry.timeout,
                    )
                    .await
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Update / upgrade
// ---------------------------------------------------------------------------

/// Applies the updating parameters to an existing runtime resource. Used
/// for plain updates and for cluster upgrades under different names.
pub struct UpdateRuntimeResourceStep {
    operation_manager: OperationManager,
    cluster: Arc<dyn ClusterClient>,
    plans: Arc<PlanRegistry>,
    retry: RetryTuple,
}

impl UpdateRuntimeResourceStep {
    pub const UPDATE: &'static str = "Update_Runtime_Resource";
    pub const UPGRADE_CLUSTER: &'static str = "Upgrade_Cluster";

    #[must_use]
    pub fn new(
        name: &str,
        store: Arc<dyn OperationStore>,
        cluster: Arc<dyn ClusterClient>,
        plans: Arc<PlanRegistry>,
        retry: RetryTuple,
    ) -> Self {
        Self {
            operation_manager: OperationManager::new(store, name, ErrorComponent::InfrastructureManager),
            cluster,
            plans,
            retry,
        }
    }
}

#[async_trait]
impl Step for UpdateRuntimeResourceStep {
    fn name(&self) -> &str {
        self.operation_manager.step()
    }

    async fn run(&self, operation: Operation) -> StepResult {
        if operation.updating_parameters.is_none() {
            return self
                .operation_manager
                .operation_failed(operation, "updating parameters are missing", None)
                .await;
        }
        let Some(spec) = runtime_resource_spec(&operation, &self.plans) else {
            return self
                .operation_manager
                .operation_failed(operation, "runtime resource name is not set", None)
                .await;
        };
        match self.cluster.update_runtime_resource(&spec).await {
            Ok(()) => {
                info!(runtime_resource = %spec.name, kubernetes_version = ?spec.kubernetes_version, "runtime resource updated");
                Ok((operation, Duration::ZERO))
            }
            Err(err) => {
                self.operation_manager
                    .retry_operation(
                        operation,
                        "unable to update runtime resource",
                        Some(&err),
                        self.retry.interval,
                        self.retry.timeout,
                    )
                    .await
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

/// Waits until the runtime resource reports `Ready`, within the retry
/// budget of the step class it checks.
pub struct CheckRuntimeResourceStep {
    operation_manager: OperationManager,
    cluster: Arc<dyn ClusterClient>,
    retry: RetryTuple,
}

impl CheckRuntimeResourceStep {
    pub const NAME: &'static str = "Check_Runtime_Resource";

    #[must_use]
    pub fn new(store: Arc<dyn OperationStore>, cluster: Arc<dyn ClusterClient>, retry: RetryTuple) -> Self {
        Self {
            operation_manager: OperationManager::new(store, Self::NAME, ErrorComponent::InfrastructureManager),
            cluster,
            retry,
        }
    }
}

#[async_trait]
impl Step for CheckRuntimeResourceStep {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self, operation: Operation) -> StepResult {
        let Some(name) = operation.instance_details.runtime_resource_name.clone() else {
            return self
                .operation_manager
                .operation_failed(operation, "runtime resource name is not set", None)
                .await;
        };
        let state = match self.cluster.runtime_resource_state(&name).await {
            Ok(state) => state,
            Err(err) => {
                return self
                    .operation_manager
                    .retry_operation(
                        operation,
                        "unable to read runtime resource",
                        Some(&err),
                        self.retry.interval,
                        self.retry.timeout,
                    )
                    .await;
            }
        };
        match state {
            Some(RuntimeResourceState::Ready) => {
                info!(runtime_resource = %name, "runtime resource is ready");
                Ok((operation, Duration::ZERO))
            }
            Some(RuntimeResourceState::Pending) => {
                self.operation_manager
                    .retry_operation(
                        operation,
                        "runtime resource is not ready yet",
                        None,
                        self.retry.interval,
                        self.retry.timeout,
                    )
                    .await
            }
            Some(RuntimeResourceState::Failed { reason }) => {
                self.operation_manager
                    .operation_failed(operation, "runtime resource failed", Some(&reason))
                    .await
            }
            None => {
                self.operation_manager
                    .operation_failed(operation, "runtime resource does not exist", None)
                    .await
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

/// Requests deletion of the runtime resource. Nothing to do if the
/// operation never got a resource name.
pub struct DeleteRuntimeResourceStep {
    operation_manager: OperationManager,
    cluster: Arc<dyn ClusterClient>,
    retry: RetryTuple,
}

impl DeleteRuntimeResourceStep {
    pub const NAME: &'static str = "Delete_Runtime_Resource";

    #[must_use]
    pub fn new(store: Arc<dyn OperationStore>, cluster: Arc<dyn ClusterClient>, retry: RetryTuple) -> Self {
        Self {
            operation_manager: OperationManager::new(store, Self::NAME, ErrorComponent::InfrastructureManager),
            cluster,
            retry,
        }
    }
}

#[async_trait]
impl Step for DeleteRuntimeResourceStep {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self, operation: Operation) -> StepResult {
        let Some(name) = operation.instance_details.runtime_resource_name.clone() else {
            info!("no runtime resource recorded, nothing to delete");
            return Ok((operation, Duration::ZERO));
        };
        match self.cluster.delete_runtime_resource(&name).await {
            Ok(()) => Ok((operation, Duration::ZERO)),
            Err(err) => {
                self.operation_manager
                    .retry_operation(
                        operation,
                        "unable to delete runtime resource",
                        Some(&err),
                        self.retry.interval,
                        self.retry.timeout,
                    )
                    .await
            }
        }
    }
}

/// Waits until the runtime resource is gone.
pub struct CheckRuntimeResourceDeletionStep {
    operation_manager: OperationManager,
    cluster: Arc<dyn ClusterClient>,
    retry: RetryTuple,
}

impl CheckRuntimeResourceDeletionStep {
    pub const NAME: &'static str = "Check_Runtime_Resource_Deletion";

    #[must_use]
    pub fn new(store: Arc<dyn OperationStore>, cluster: Arc<dyn ClusterClient>, retry: RetryTuple) -> Self {
        Self {
            operation_manager: OperationManager::new(store, Self::NAME, ErrorComponent::InfrastructureManager),
            cluster,
            retry,
        }
    }
}

#[async_trait]
impl Step for CheckRuntimeResourceDeletionStep {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self, operation: Operation) -> StepResult {
        let Some(name) = operation.instance_details.runtime_resource_name.clone() else {
            return Ok((operation, Duration::ZERO));
        };
        match self.cluster.runtime_resource_state(&name).await {
            Ok(None) => {
                info!(runtime_resource = %name, "runtime resource deleted");
                Ok((operation, Duration::ZERO))
            }
            Ok(Some(_)) => {
                self.operation_manager
                    .retry_operation(
                        operation,
                        "runtime resource still exists",
                        None,
                        self.retry.interval,
                        self.retry.timeout,
                    )
                    .await
            }
            Err(err) => {
                self.operation_manager
                    .retry_operation(
                        operation,
                        "unable to read runtime resource",
                        Some(&err),
                        self.retry.interval,
                        self.retry.timeout,
                    )
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use kyma_broker_core::fixture::{fix_deprovisioning_operation, fix_provisioning_operation};
    use kyma_broker_core::{OperationState, UpdatingParameters};

    use super::*;
    use crate::clients::InMemoryClusterClient;
    use crate::process::step::StepError;
    use crate::storage::MemoryOperationStore;

    fn retry() -> RetryTuple {
        RetryTuple::new(Duration::from_secs(10), Duration::from_secs(600))
    }

    async fn stored(store: &MemoryOperationStore, mut op: Operation) -> Operation {
        op.state = OperationState::InProgress;
        op.instance_details.runtime_id = Some("runtime-1".to_string());
        op.instance_details.runtime_resource_name = Some("runtime-1".to_string());
        store.insert_operation(op).await.unwrap()
    }

    #[tokio::test]
    async fn create_then_wait_until_ready() {
        let store = Arc::new(MemoryOperationStore::new());
        let cluster = Arc::new(InMemoryClusterClient::new(1));
        let plans = Arc::new(PlanRegistry::kyma_defaults());
        let op = stored(&store, fix_provisioning_operation("op", "inst")).await;

        let create = CreateRuntimeResourceStep::new(store.clone(), cluster.clone(), plans, retry());
        let (op, backoff) = create.run(op).await.unwrap();
        assert!(backoff.is_zero());
        assert_eq!(cluster.runtime_spec("runtime-1").unwrap().plan_name, "aws");

        let check = CheckRuntimeResourceStep::new(store.clone(), cluster.clone(), retry());
        let (op, backoff) = check.run(op).await.unwrap();
        assert_eq!(backoff, Duration::from_secs(10));
        let (_, backoff) = check.run(op).await.unwrap();
        assert!(backoff.is_zero());
    }

    #[tokio::test]
    async fn create_without_name_fails() {
        let store = Arc::new(MemoryOperationStore::new());
        let mut op = fix_provisioning_operation("op", "inst");
        op.state = OperationState::InProgress;
        let op = store.insert_operation(op).await.unwrap();
        let create = CreateRuntimeResourceStep::new(
            store.clone(),
            Arc::new(InMemoryClusterClient::new(0)),
            Arc::new(PlanRegistry::kyma_defaults()),
            retry(),
        );
        let err = create.run(op).await.unwrap_err();
        assert!(matches!(err, StepError::OperationFailed { .. }));
    }

    #[tokio::test]
    async fn missing_resource_fails_readiness_check() {
        let store = Arc::new(MemoryOperationStore::new());
        let op = stored(&store, fix_provisioning_operation("op", "inst")).await;
        let check = CheckRuntimeResourceStep::new(store.clone(), Arc::new(InMemoryClusterClient::new(0)), retry());
        assert!(matches!(check.run(op).await, Err(StepError::OperationFailed { .. })));
    }

    #[tokio::test]
    async fn update_applies_new_parameters() {
        let store = Arc::new(MemoryOperationStore::new());
        let cluster = Arc::new(InMemoryClusterClient::new(0));
        let plans = Arc::new(PlanRegistry::kyma_defaults());
        let mut op = fix_provisioning_operation("op", "inst");
        op.updating_parameters = Some(UpdatingParameters {
            kubernetes_version: Some("1.31".to_string()),
            ..UpdatingParameters::default()
        });
        let op = stored(&store, op).await;
        let create = CreateRuntimeResourceStep::new(store.clone(), cluster.clone(), plans.clone(), retry());
        let (op, _) = create.run(op).await.unwrap();

        let upgrade = UpdateRuntimeResourceStep::new(
            UpdateRuntimeResourceStep::UPGRADE_CLUSTER,
            store.clone(),
            cluster.clone(),
            plans,
            retry(),
        );
        assert_eq!(upgrade.name(), "Upgrade_Cluster");
        upgrade.run(op).await.unwrap();
        assert_eq!(
            cluster.runtime_spec("runtime-1").unwrap().kubernetes_version.as_deref(),
            Some("1.31")
        );
    }

    #[tokio::test]
    async fn deletion_is_checked_until_resource_is_gone() {
        let store = Arc::new(MemoryOperationStore::new());
        let cluster = Arc::new(InMemoryClusterClient::new(1));
        let plans = PlanRegistry::kyma_defaults();
        let op = stored(&store, fix_deprovisioning_operation("op", "inst")).await;
        cluster
            .create_runtime_resource(&runtime_resource_spec(&op, &plans).unwrap())
            .await
            .unwrap();

        let delete = DeleteRuntimeResourceStep::new(store.clone(), cluster.clone(), retry());
        let (op, _) = delete.run(op).await.unwrap();

        let check = CheckRuntimeResourceDeletionStep::new(store.clone(), cluster.clone(), retry());
        let (op, backoff) = check.run(op).await.unwrap();
        assert!(!backoff.is_zero());
        let (_, backoff) = check.run(op).await.unwrap();
        assert!(backoff.is_zero());
    }

    #[tokio::test]
    async fn delete_without_resource_is_noop() {
        let store = Arc::new(MemoryOperationStore::new());
        let mut op = fix_deprovisioning_operation("op", "inst");
        op.instance_details.runtime_resource_name = None;
        let op = store.insert_operation(op).await.unwrap();
        let delete = DeleteRuntimeResourceStep::new(store.clone(), Arc::new(InMemoryClusterClient::new(0)), retry());
        let (_, backoff) = delete.run(op).await.unwrap();
        assert!(backoff.is_zero());
    }
}
