use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kyma_broker_core::{ErrorComponent, Operation};
use serde_json::{Map, Value};
use tracing::info;

use crate::clients::{ClusterClient, KymaResource};
use crate::config::RetryTuple;
use crate::process::operation_manager::OperationManager;
use crate::process::step::{Step, StepResult};
use crate::storage::OperationStore;

pub const LABEL_RUNTIME_ID: &str = "kyma-project.io/runtime-id";
pub const LABEL_GLOBAL_ACCOUNT_ID: &str = "kyma-project.io/global-account-id";
pub const LABEL_SUBACCOUNT_ID: &str = "kyma-project.io/subaccount-id";

/// Applies the Kyma resource built from the template stored by
/// [`super::InitKymaTemplateStep`].
pub struct ApplyKymaResourceStep {
    operation_manager: OperationManager,
    cluster: Arc<dyn ClusterClient>,
    retry: RetryTuple,
}

impl ApplyKymaResourceStep {
    pub const NAME: &'static str = "Apply_Kyma_Resource";

    #[must_use]
    pub fn new(store: Arc<dyn OperationStore>, cluster: Arc<dyn ClusterClient>, retry: RetryTuple) -> Self {
        Self {
            operation_manager: OperationManager::new(store, Self::NAME, ErrorComponent::LifecycleManager),
            cluster,
            retry,
        }
    }
}

/// Stamps name, namespace and ownership labels onto the template.
fn render(operation: &Operation, name: &str, namespace: &str, template: &str) -> Result<String, serde_json::Error> {
    let mut document: Value = serde_json::from_str(template)?;
    let Some(root) = document.as_object_mut() else {
        return Err(serde::de::Error::custom("kyma template is not an object"));
    };
    let metadata = root
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    if !metadata.is_object() {
        *metadata = Value::Object(Map::new());
    }
    if let Some(metadata) = metadata.as_object_mut() {
        metadata.insert("name".to_string(), Value::String(name.to_string()));
        metadata.insert("namespace".to_string(), Value::String(namespace.to_string()));
        let labels = metadata
            .entry("labels")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(labels) = labels.as_object_mut() {
            let ers = &operation.provisioning_parameters.ers_context;
            let runtime_id = operation.instance_details.runtime_id.clone().unwrap_or_default();
            labels.insert(LABEL_RUNTIME_ID.to_string(), Value::String(runtime_id));
            labels.insert(
                LABEL_GLOBAL_ACCOUNT_ID.to_string(),
                Value::String(ers.global_account_id.clone()),
            );
            labels.insert(LABEL_SUBACCOUNT_ID.to_string(), Value::String(ers.subaccount_id.clone()));
        }
    }
    serde_json::to_string(&document)
}

#[async_trait]
impl Step for ApplyKymaResourceStep {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self, operation: Operation) -> StepResult {
        let details = &operation.instance_details;
        let (Some(name), Some(namespace), Some(template)) = (
            details.kyma_resource_name.clone(),
            details.kyma_resource_namespace.clone(),
            details.kyma_template.clone(),
        ) else {
            return self
                .operation_manager
                .operation_failed(operation, "kyma resource name or template is not set", None)
                .await;
        };

        let rendered = match render(&operation, &name, &namespace, &template) {
            Ok(rendered) => rendered,
            Err(err) => {
                return self
                    .operation_manager
                    .operation_failed(operation, "unable to render kyma resource", Some(&err))
                    .await;
            }
        };
        let resource = KymaResource {
            name,
            namespace,
            template: rendered,
            channel: details.kyma_channel.clone().unwrap_or_default(),
        };

        match self.cluster.apply_kyma_resource(&resource).await {
            Ok(()) => {
                info!(kyma_resource = %resource.name, namespace = %resource.namespace, "kyma resource applied");
                Ok((operation, Duration::ZERO))
            }
            Err(err) => {
                self.operation_manager
                    .retry_operation(
                        operation,
                        "unable to apply kyma resource",
                        Some(&err),
                        self.retry.interval,
                        self.retry.timeout,
                    )
                    .await
            }
        }
    }
}
