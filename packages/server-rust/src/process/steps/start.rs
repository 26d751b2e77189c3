use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kyma_broker_core::{ErrorComponent, Operation, OperationType};
use tracing::info;

use crate::process::operation_manager::OperationManager;
use crate::process::step::{Step, StepResult};
use crate::storage::OperationStore;

/// Serializes operations of one instance: waits while an older operation
/// on the same instance is still open. Follow-up operations then take the
/// instance details of the latest provisioning, which may have finished
/// after they were accepted.
pub struct StartStep {
    store: Arc<dyn OperationStore>,
    operation_manager: OperationManager,
    wait_interval: Duration,
}

impl StartStep {
    pub const NAME: &'static str = "Starting";

    #[must_use]
    pub fn new(store: Arc<dyn OperationStore>, wait_interval: Duration) -> Self {
        Self {
            operation_manager: OperationManager::new(Arc::clone(&store), Self::NAME, ErrorComponent::Database),
            store,
            wait_interval,
        }
    }
}

#[async_trait]
impl Step for StartStep {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self, operation: Operation) -> StepResult {
        let siblings = self
            .store
            .list_operations_by_instance_id(&operation.instance_id)
            .await?;
        let blocking = siblings.iter().find(|other| {
            other.id != operation.id
                && !other.is_terminal()
                && (other.created_at, &other.id) < (operation.created_at, &operation.id)
        });
        if let Some(other) = blocking {
            info!(
                blocking_operation = %other.id,
                blocking_type = %other.operation_type,
                "waiting for an earlier operation on the instance"
            );
            return Ok((operation, self.wait_interval));
        }

        let details = if operation.operation_type == OperationType::Provision {
            None
        } else {
            siblings
                .iter()
                .rev()
                .find(|other| other.operation_type == OperationType::Provision)
                .map(|provisioning| provisioning.instance_details.clone())
        };
        let description = format!("{} started", operation.operation_type);
        let unchanged = operation.description == description
            && details.as_ref().is_none_or(|d| *d == operation.instance_details);
        if unchanged {
            return Ok((operation, Duration::ZERO));
        }

        let updated = self
            .operation_manager
            .update_operation(operation, |op| {
                op.description.clone_from(&description);
                if let Some(details) = &details {
                    op.instance_details = details.clone();
                }
            })
            .await?;
        Ok((updated, Duration::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use kyma_broker_core::fixture::{fix_deprovisioning_operation, fix_operation, fix_provisioning_operation};
    use kyma_broker_core::OperationState;

    use super::*;
    use crate::storage::MemoryOperationStore;

    #[tokio::test]
    async fn waits_for_earlier_open_operation() {
        let store = Arc::new(MemoryOperationStore::new());
        let mut earlier = fix_deprovisioning_operation("op-deprovision", "inst-1");
        earlier.created_at = 1_000;
        store.insert_operation(earlier).await.unwrap();
        let mut op = fix_provisioning_operation("op-provision", "inst-1");
        op.created_at = 2_000;
        op.state = OperationState::InProgress;
        let op = store.insert_operation(op).await.unwrap();

        let step = StartStep::new(store.clone(), Duration::from_secs(60));
        let (_, backoff) = step.run(op).await.unwrap();
        assert_eq!(backoff, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn proceeds_when_earlier_operations_finished() {
        let store = Arc::new(MemoryOperationStore::new());
        let mut earlier = fix_provisioning_operation("op-old", "inst-1");
        earlier.created_at = 1_000;
        earlier.state = OperationState::Succeeded;
        store.insert_operation(earlier).await.unwrap();
        let mut later = fix_provisioning_operation("op-later", "inst-1");
        later.created_at = 3_000;
        store.insert_operation(later).await.unwrap();
        let mut op = fix_provisioning_operation("op-new", "inst-1");
        op.created_at = 2_000;
        op.state = OperationState::InProgress;
        let op = store.insert_operation(op).await.unwrap();

        let step = StartStep::new(store.clone(), Duration::from_secs(60));
        let (op, backoff) = step.run(op).await.unwrap();
        assert!(backoff.is_zero());
        assert_eq!(op.description, "provision started");
        assert_eq!(op.version, 1);
    }

    #[tokio::test]
    async fn update_waits_behind_in_flight_provisioning() {
        let store = Arc::new(MemoryOperationStore::new());
        let mut provisioning = fix_provisioning_operation("op-provision", "inst-1");
        provisioning.created_at = 1_000;
        provisioning.state = OperationState::InProgress;
        store.insert_operation(provisioning).await.unwrap();
        let mut update = fix_operation("op-update", "inst-1", OperationType::Update);
        update.created_at = 2_000;
        update.state = OperationState::InProgress;
        let update = store.insert_operation(update).await.unwrap();

        let step = StartStep::new(store.clone(), Duration::from_secs(30));
        let (update, backoff) = step.run(update).await.unwrap();
        assert_eq!(backoff, Duration::from_secs(30));
        assert_eq!(update.version, 0);
    }

    #[tokio::test]
    async fn follow_up_takes_details_of_finished_provisioning() {
        let store = Arc::new(MemoryOperationStore::new());
        let mut provisioning = fix_provisioning_operation("op-provision", "inst-1");
        provisioning.created_at = 1_000;
        provisioning.state = OperationState::InProgress;
        let provisioning = store.insert_operation(provisioning).await.unwrap();
        // Accepted while provisioning still ran: no runtime known yet.
        let mut deprovisioning = fix_deprovisioning_operation("op-deprovision", "inst-1");
        deprovisioning.created_at = 2_000;
        deprovisioning.state = OperationState::InProgress;
        let deprovisioning = store.insert_operation(deprovisioning).await.unwrap();

        let mut provisioned = provisioning;
        provisioned.instance_details.runtime_id = Some("rt-1".to_string());
        provisioned.instance_details.runtime_resource_name = Some("rt-1".to_string());
        provisioned.state = OperationState::Succeeded;
        store.update_operation(provisioned).await.unwrap();

        let step = StartStep::new(store.clone(), Duration::from_secs(30));
        let (deprovisioning, backoff) = step.run(deprovisioning).await.unwrap();
        assert!(backoff.is_zero());
        assert_eq!(deprovisioning.instance_details.runtime_resource_name.as_deref(), Some("rt-1"));
        let stored = store.get_operation_by_id("op-deprovision").await.unwrap();
        assert_eq!(stored.instance_details.runtime_id.as_deref(), Some("rt-1"));
    }
}
