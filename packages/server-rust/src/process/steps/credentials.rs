use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kyma_broker_core::{ErrorComponent, Operation, PlanRegistry};
use tracing::info;

use crate::clients::{CredentialsKind, SubscriptionRequest, SubscriptionResolver};
use crate::config::RetryTuple;
use crate::process::operation_manager::OperationManager;
use crate::process::step::{Step, StepResult};
use crate::storage::OperationStore;

/// Resolves the cloud credentials a new cluster is created with. Two
/// flavours exist (subscription secret, credentials binding); exactly one
/// is registered, depending on configuration.
pub struct ResolveCredentialsStep {
    kind: CredentialsKind,
    operation_manager: OperationManager,
    plans: Arc<PlanRegistry>,
    resolver: Arc<dyn SubscriptionResolver>,
    retry: RetryTuple,
}

impl ResolveCredentialsStep {
    pub const SUBSCRIPTION_SECRET: &'static str = "Resolve_Subscription_Secret";
    pub const CREDENTIALS_BINDING: &'static str = "Resolve_Credentials_Binding";

    #[must_use]
    pub fn new(
        kind: CredentialsKind,
        store: Arc<dyn OperationStore>,
        plans: Arc<PlanRegistry>,
        resolver: Arc<dyn SubscriptionResolver>,
        retry: RetryTuple,
    ) -> Self {
        let name = match kind {
            CredentialsKind::SubscriptionSecret => Self::SUBSCRIPTION_SECRET,
            CredentialsKind::CredentialsBinding => Self::CREDENTIALS_BINDING,
        };
        Self {
            kind,
            operation_manager: OperationManager::new(store, name, ErrorComponent::Gardener),
            plans,
            resolver,
            retry,
        }
    }
}

#[async_trait]
impl Step for ResolveCredentialsStep {
    fn name(&self) -> &str {
        self.operation_manager.step()
    }

    async fn run(&self, operation: Operation) -> StepResult {
        if operation.instance_details.subscription_name.is_some() {
            return Ok((operation, Duration::ZERO));
        }

        let params = &operation.provisioning_parameters;
        let request = SubscriptionRequest {
            global_account_id: params.ers_context.global_account_id.clone(),
            subaccount_id: params.ers_context.subaccount_id.clone(),
            plan_name: self.plans.plan_name(&params.plan_id).unwrap_or_default().to_string(),
            region: params.parameters.region.clone(),
        };

        match self.resolver.resolve(self.kind, &request).await {
            Ok(Some(name)) => {
                info!(subscription = %name, "cloud credentials resolved");
                let updated = self
                    .operation_manager
                    .update_operation(operation, |op| {
                        op.instance_details.subscription_name = Some(name.clone());
                    })
                    .await?;
                Ok((updated, Duration::ZERO))
            }
            Ok(None) => {
                self.operation_manager
                    .retry_operation(
                        operation,
                        "no free cloud credentials available",
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
                        "unable to resolve cloud credentials",
                        Some(&err),
                        self.retry.interval,
                        self.retry.timeout,
                    )
                    .await
            }
        }
    }
}
