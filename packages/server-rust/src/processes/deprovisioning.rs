//! Deprovisioning: delete the runtime resource and wait until it is gone.

use std::sync::Arc;

use crate::config::BrokerConfig;
use crate::process::steps::conditions::skip_for_own_cluster_plan;
use crate::process::steps::{CheckRuntimeResourceDeletionStep, DeleteRuntimeResourceStep, StartStep};
use crate::process::{ProcessBuilder, ProcessError, StagedManager};

use super::ProcessDependencies;

pub const STAGE_START: &str = "start";
pub const STAGE_DELETE_RUNTIME_RESOURCE: &str = "delete_runtime_resource";
pub const STAGE_CHECK_RUNTIME_RESOURCE_DELETION: &str = "check_runtime_resource_deletion";

/// # Errors
///
/// Returns [`ProcessError::Configuration`] if the stage layout is invalid.
pub fn build(deps: &ProcessDependencies, config: &BrokerConfig) -> Result<StagedManager, ProcessError> {
    let store = &deps.store;
    let deletion = config.step_timeouts.runtime_resource_deletion;
    ProcessBuilder::new("deprovisioning", Arc::clone(store), config.process)
        .stages(&[STAGE_START, STAGE_DELETE_RUNTIME_RESOURCE, STAGE_CHECK_RUNTIME_RESOURCE_DELETION])
        .step(
            STAGE_START,
            Arc::new(StartStep::new(Arc::clone(store), config.process.instance_wait_interval)),
        )
        .step_when(
            STAGE_DELETE_RUNTIME_RESOURCE,
            Arc::new(DeleteRuntimeResourceStep::new(
                Arc::clone(store),
                Arc::clone(&deps.cluster),
                config.step_timeouts.cluster_api,
            )),
            skip_for_own_cluster_plan(),
        )
        .step_when(
            STAGE_CHECK_RUNTIME_RESOURCE_DELETION,
            Arc::new(CheckRuntimeResourceDeletionStep::new(
                Arc::clone(store),
                Arc::clone(&deps.cluster),
                deletion,
            )),
            skip_for_own_cluster_plan(),
        )
        .build()
}
