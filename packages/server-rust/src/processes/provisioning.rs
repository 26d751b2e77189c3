//! Provisioning: resolve template and credentials, create the runtime
//! resource, wait for it, then hand the cluster over to Kyma.

use std::sync::Arc;

use crate::clients::CredentialsKind;
use crate::config::BrokerConfig;
use crate::process::steps::conditions::{skip_for_own_cluster_plan, when_btp_operator_credentials_provided};
use crate::process::steps::{
    ApplyKymaResourceStep, CheckRuntimeResourceStep, CreateRuntimeResourceStep, GenerateRuntimeIdStep,
    HolderStep, InitKymaTemplateStep, InjectBtpOperatorCredentialsStep, ResolveCredentialsStep, StartStep,
};
use crate::process::{ProcessBuilder, ProcessError, StagedManager};

use super::ProcessDependencies;

pub const STAGE_START: &str = "start";
pub const STAGE_CREATE_RUNTIME: &str = "create_runtime";
pub const STAGE_CHECK_RUNTIME_RESOURCE: &str = "check_runtime_resource";
pub const STAGE_CREATE_KYMA_RESOURCE: &str = "create_kyma_resource";

/// # Errors
///
/// Returns [`ProcessError::Configuration`] if the stage layout is invalid.
pub fn build(deps: &ProcessDependencies, config: &BrokerConfig) -> Result<StagedManager, ProcessError> {
    let timeouts = &config.step_timeouts;
    let flags = &config.flags;
    let store = &deps.store;

    let credentials = |kind| {
        Arc::new(ResolveCredentialsStep::new(
            kind,
            Arc::clone(store),
            Arc::clone(&deps.plans),
            Arc::clone(&deps.subscriptions),
            timeouts.subscription,
        ))
    };
    let create_runtime = Arc::new(HolderStep::new(
        Arc::new(CreateRuntimeResourceStep::new(
            Arc::clone(store),
            Arc::clone(&deps.cluster),
            Arc::clone(&deps.plans),
            timeouts.cluster_api,
        )),
        flags.hold_steps,
        flags.hold_interval,
    ));

    ProcessBuilder::new("provisioning", Arc::clone(store), config.process)
        .stages(&[
            STAGE_START,
            STAGE_CREATE_RUNTIME,
            STAGE_CHECK_RUNTIME_RESOURCE,
            STAGE_CREATE_KYMA_RESOURCE,
        ])
        .step(
            STAGE_START,
            Arc::new(StartStep::new(Arc::clone(store), config.process.instance_wait_interval)),
        )
        .step(
            STAGE_CREATE_RUNTIME,
            Arc::new(InitKymaTemplateStep::new(
                Arc::clone(store),
                Arc::clone(&deps.plans),
                Arc::clone(&deps.plan_config),
                timeouts.plan_config,
            )),
        )
        .step(STAGE_CREATE_RUNTIME, Arc::new(GenerateRuntimeIdStep::new(Arc::clone(store))))
        .step_if(
            !flags.use_credentials_binding,
            STAGE_CREATE_RUNTIME,
            credentials(CredentialsKind::SubscriptionSecret),
            Some(skip_for_own_cluster_plan()),
        )
        .step_if(
            flags.use_credentials_binding,
            STAGE_CREATE_RUNTIME,
            credentials(CredentialsKind::CredentialsBinding),
            Some(skip_for_own_cluster_plan()),
        )
        .step_when(STAGE_CREATE_RUNTIME, create_runtime, skip_for_own_cluster_plan())
        .step_when(
            STAGE_CHECK_RUNTIME_RESOURCE,
            Arc::new(CheckRuntimeResourceStep::new(
                Arc::clone(store),
                Arc::clone(&deps.cluster),
                timeouts.runtime_resource_create,
            )),
            skip_for_own_cluster_plan(),
        )
        .step_when(
            STAGE_CREATE_KYMA_RESOURCE,
            Arc::new(InjectBtpOperatorCredentialsStep::new(
                Arc::clone(store),
                Arc::clone(&deps.cluster),
                timeouts.cluster_api,
            )),
            when_btp_operator_credentials_provided(),
        )
        .step(
            STAGE_CREATE_KYMA_RESOURCE,
            Arc::new(ApplyKymaResourceStep::new(
                Arc::clone(store),
                Arc::clone(&deps.cluster),
                timeouts.cluster_api,
            )),
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processes::tests::deps;

    #[test]
    fn subscription_secret_is_the_default_credentials_source() {
        let manager = build(&deps(), &BrokerConfig::default()).unwrap();
        let steps = manager.step_names(STAGE_CREATE_RUNTIME).unwrap();
        assert_eq!(
            steps,
            [
                InitKymaTemplateStep::NAME,
                GenerateRuntimeIdStep::NAME,
                ResolveCredentialsStep::SUBSCRIPTION_SECRET,
                CreateRuntimeResourceStep::NAME,
            ]
        );
    }

    #[test]
    fn credentials_binding_replaces_subscription_secret() {
        let mut config = BrokerConfig::default();
        config.flags.use_credentials_binding = true;
        let manager = build(&deps(), &config).unwrap();
        let steps = manager.step_names(STAGE_CREATE_RUNTIME).unwrap();
        assert!(steps.contains(&ResolveCredentialsStep::CREDENTIALS_BINDING));
        assert!(!steps.contains(&ResolveCredentialsStep::SUBSCRIPTION_SECRET));
    }

    #[test]
    fn stages_are_declared_in_order() {
        let manager = build(&deps(), &BrokerConfig::default()).unwrap();
        assert_eq!(
            manager.stage_names().collect::<Vec<_>>(),
            [
                STAGE_START,
                STAGE_CREATE_RUNTIME,
                STAGE_CHECK_RUNTIME_RESOURCE,
                STAGE_CREATE_KYMA_RESOURCE
            ]
        );
    }
}
