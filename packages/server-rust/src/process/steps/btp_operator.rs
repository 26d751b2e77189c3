use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kyma_broker_core::{ErrorComponent, Operation};
use tracing::info;

use crate::clients::ClusterClient;
use crate::config::RetryTuple;
use crate::process::operation_manager::OperationManager;
use crate::process::step::{Step, StepResult};
use crate::storage::OperationStore;

/// Writes the service-manager credentials from the ERS context into the
/// cluster so the BTP operator can start. Registered behind
/// [`super::conditions::when_btp_operator_credentials_provided`].
pub struct InjectBtpOperatorCredentialsStep {
    operation_manager: OperationManager,
    cluster: Arc<dyn ClusterClient>,
    retry: RetryTuple,
}

impl InjectBtpOperatorCredentialsStep {
    pub const NAME: &'static str = "Inject_BTP_Operator_Credentials";

    #[must_use]
    pub fn new(store: Arc<dyn OperationStore>, cluster: Arc<dyn ClusterClient>, retry: RetryTuple) -> Self {
        Self {
            operation_manager: OperationManager::new(store, Self::NAME, ErrorComponent::KubernetesApi),
            cluster,
            retry,
        }
    }
}

#[async_trait]
impl Step for InjectBtpOperatorCredentialsStep {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self, operation: Operation) -> StepResult {
        let Some(runtime_id) = operation.instance_details.runtime_id.clone() else {
            return self
                .operation_manager
                .operation_failed(operation, "runtime id is not set", None)
                .await;
        };
        let Some(creds) = operation
            .provisioning_parameters
            .ers_context
            .sm_operator_credentials
            .as_ref()
        else {
            return self
                .operation_manager
                .operation_failed(operation, "service manager credentials are missing", None)
                .await;
        };

        let secret = BTreeMap::from([
            ("clientid".to_string(), creds.client_id.clone()),
            ("clientsecret".to_string(), creds.client_secret.clone()),
            ("sm_url".to_string(), creds.service_manager_url.clone()),
            ("tokenurl".to_string(), creds.url.clone()),
            ("cluster_id".to_string(), runtime_id.clone()),
        ]);

        match self.cluster.apply_btp_operator_credentials(&runtime_id, &secret).await {
            Ok(()) => {
                info!(runtime_id = %runtime_id, "btp operator credentials injected");
                Ok((operation, Duration::ZERO))
            }
            Err(err) => {
                self.operation_manager
                    .retry_operation(
                        operation,
                        "unable to inject btp operator credentials",
                        Some(&err),
                        self.retry.interval,
                        self.retry.timeout,
                    )
                    .await
            }
        }
    }
}
