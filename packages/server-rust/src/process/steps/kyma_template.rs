use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kyma_broker_core::{ErrorComponent, Operation, PlanRegistry};
use serde_json::Value;
use tracing::info;

use crate::clients::PlanConfigProvider;
use crate::config::RetryTuple;
use crate::process::operation_manager::OperationManager;
use crate::process::step::{Step, StepResult};
use crate::storage::OperationStore;

/// Channels a user may request instead of the plan default.
pub const ALLOWED_CHANNELS: [&str; 2] = ["fast", "regular"];

#[derive(Debug, thiserror::Error)]
enum TemplateError {
    #[error("kyma template is not a valid document: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("spec not found in kyma template")]
    MissingSpec,
    #[error("invalid channel value: {0}. Allowed values are 'fast' or 'regular'")]
    InvalidChannel(String),
}

/// Loads the Kyma template of the operation's plan, applies the user's
/// channel override and stores the result on the operation.
pub struct InitKymaTemplateStep {
    operation_manager: OperationManager,
    plans: Arc<PlanRegistry>,
    config_provider: Arc<dyn PlanConfigProvider>,
    retry: RetryTuple,
}

impl InitKymaTemplateStep {
    pub const NAME: &'static str = "Init_Kyma_Template";

    #[must_use]
    pub fn new(
        store: Arc<dyn OperationStore>,
        plans: Arc<PlanRegistry>,
        config_provider: Arc<dyn PlanConfigProvider>,
        retry: RetryTuple,
    ) -> Self {
        Self {
            operation_manager: OperationManager::new(store, Self::NAME, ErrorComponent::Broker),
            plans,
            config_provider,
            retry,
        }
    }
}

struct ResolvedTemplate {
    template: String,
    namespace: Option<String>,
    channel: Option<String>,
}

fn resolve_template(template: &str, user_channel: Option<&str>) -> Result<ResolvedTemplate, TemplateError> {
    let mut document: Value = serde_json::from_str(template)?;
    let namespace = document
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .map(ToString::to_string);

    let user_channel = user_channel.filter(|c| !c.is_empty());
    let Some(channel) = user_channel else {
        let channel = document
            .pointer("/spec/channel")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        return Ok(ResolvedTemplate {
            template: template.to_string(),
            namespace,
            channel,
        });
    };

    if !ALLOWED_CHANNELS.contains(&channel) {
        return Err(TemplateError::InvalidChannel(channel.to_string()));
    }
    let spec = document
        .get_mut("spec")
        .and_then(Value::as_object_mut)
        .ok_or(TemplateError::MissingSpec)?;
    spec.insert("channel".to_string(), Value::String(channel.to_string()));
    Ok(ResolvedTemplate {
        template: serde_json::to_string(&document)?,
        namespace,
        channel: Some(channel.to_string()),
    })
}

#[async_trait]
impl Step for InitKymaTemplateStep {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self, operation: Operation) -> StepResult {
        let plan_id = operation.provisioning_parameters.plan_id.clone();
        let Some(plan_name) = self.plans.plan_name(&plan_id).map(ToString::to_string) else {
            return self
                .operation_manager
                .operation_failed(operation, &format!("PlanID {plan_id} not found in plan catalog"), None)
                .await;
        };

        let config = match self.config_provider.plan_config(&plan_name).await {
            Ok(config) => config,
            Err(err) => {
                return self
                    .operation_manager
                    .retry_operation(
                        operation,
                        &format!("unable to provide configuration for plan {plan_name}"),
                        Some(&err),
                        self.retry.interval,
                        self.retry.timeout,
                    )
                    .await;
            }
        };

        let user_channel = operation
            .provisioning_parameters
            .parameters
            .modules
            .as_ref()
            .and_then(|m| m.channel.clone());
        let resolved = match resolve_template(&config.kyma_template, user_channel.as_deref()) {
            Ok(resolved) => resolved,
            Err(err @ TemplateError::InvalidChannel(_)) => {
                return self
                    .operation_manager
                    .operation_failed(operation, "unable to apply channel override", Some(&err))
                    .await;
            }
            Err(err) => {
                return self
                    .operation_manager
                    .operation_failed(operation, "unable to create a kyma template", Some(&err))
                    .await;
            }
        };

        info!(plan = %plan_name, channel = ?resolved.channel, "kyma template resolved");
        let updated = self
            .operation_manager
            .update_operation(operation, |op| {
                if let Some(namespace) = &resolved.namespace {
                    op.instance_details.kyma_resource_namespace = Some(namespace.clone());
                }
                op.instance_details.kyma_template = Some(resolved.template.clone());
                op.instance_details.kyma_channel.clone_from(&resolved.channel);
            })
            .await?;
        Ok((updated, Duration::ZERO))
    }
}
