use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kyma_broker_core::{ErrorComponent, Operation};
use tracing::info;

use crate::process::operation_manager::OperationManager;
use crate::process::step::{Step, StepResult};
use crate::storage::OperationStore;

/// Namespace the Kyma resource lives in unless the template says otherwise.
pub const KYMA_NAMESPACE: &str = "kcp-system";

/// Assigns the runtime ID and derives the resource names from it. Keeps
/// whatever an earlier pass already persisted.
pub struct GenerateRuntimeIdStep {
    operation_manager: OperationManager,
}

impl GenerateRuntimeIdStep {
    pub const NAME: &'static str = "Generate_Runtime_ID";

    #[must_use]
    pub fn new(store: Arc<dyn OperationStore>) -> Self {
        Self {
            operation_manager: OperationManager::new(store, Self::NAME, ErrorComponent::Broker),
        }
    }
}

#[async_trait]
impl Step for GenerateRuntimeIdStep {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self, operation: Operation) -> StepResult {
        let details = &operation.instance_details;
        if details.runtime_id.is_some()
            && details.runtime_resource_name.is_some()
            && details.kyma_resource_name.is_some()
        {
            return Ok((operation, Duration::ZERO));
        }

        let candidate = uuid::Uuid::new_v4().to_string();
        let updated = self
            .operation_manager
            .update_operation(operation, |op| {
                let details = &mut op.instance_details;
                let runtime_id = details.runtime_id.get_or_insert_with(|| candidate.clone()).clone();
                details.runtime_resource_name.get_or_insert_with(|| runtime_id.clone());
                details.kyma_resource_name.get_or_insert_with(|| runtime_id.clone());
                details
                    .kyma_resource_namespace
                    .get_or_insert_with(|| KYMA_NAMESPACE.to_string());
            })
            .await?;
        info!(runtime_id = ?updated.instance_details.runtime_id, "runtime id assigned");
        Ok((updated, Duration::ZERO))
    }
}
