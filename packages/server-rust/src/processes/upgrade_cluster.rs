//! Cluster upgrade: roll the runtime resource to a new Kubernetes version.
//! The upgrade stage opens with the start step, so an upgrade waits for
//! earlier operations on the instance and works on current details.

use std::sync::Arc;

use crate::config::BrokerConfig;
use crate::process::steps::conditions::skip_for_own_cluster_plan;
use crate::process::steps::{CheckRuntimeResourceStep, StartStep, UpdateRuntimeResourceStep};
use crate::process::{ProcessBuilder, ProcessError, StagedManager};

use super::ProcessDependencies;

pub const STAGE_UPGRADE_CLUSTER: &str = "upgrade_cluster";
pub const STAGE_CHECK_RUNTIME_RESOURCE: &str = "check_runtime_resource";

/// # Errors
///
/// Returns [`ProcessError::Configuration`] if the stage layout is invalid.
pub fn build(deps: &ProcessDependencies, config: &BrokerConfig) -> Result<StagedManager, ProcessError> {
    let store = &deps.store;
    let retry = config.step_timeouts.cluster_upgrade;
    ProcessBuilder::new("upgrade_cluster", Arc::clone(store), config.process)
        .stages(&[STAGE_UPGRADE_CLUSTER, STAGE_CHECK_RUNTIME_RESOURCE])
        .step(
            STAGE_UPGRADE_CLUSTER,
            Arc::new(StartStep::new(Arc::clone(store), config.process.instance_wait_interval)),
        )
        .step_when(
            STAGE_UPGRADE_CLUSTER,
            Arc::new(UpdateRuntimeResourceStep::new(
                UpdateRuntimeResourceStep::UPGRADE_CLUSTER,
                Arc::clone(store),
                Arc::clone(&deps.cluster),
                Arc::clone(&deps.plans),
                retry,
            )),
            skip_for_own_cluster_plan(),
        )
        .step_when(
            STAGE_CHECK_RUNTIME_RESOURCE,
            Arc::new(CheckRuntimeResourceStep::new(
                Arc::clone(store),
                Arc::clone(&deps.cluster),
                retry,
            )),
            skip_for_own_cluster_plan(),
        )
        .build()
}
