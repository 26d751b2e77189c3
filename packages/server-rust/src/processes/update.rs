//! Update: apply new cluster parameters and wait for the runtime resource.

use std::sync::Arc;

use crate::config::BrokerConfig;
use crate::process::steps::conditions::skip_for_own_cluster_plan;
use crate::process::steps::{CheckRuntimeResourceStep, StartStep, UpdateRuntimeResourceStep};
use crate::process::{ProcessBuilder, ProcessError, StagedManager};

use super::ProcessDependencies;

pub const STAGE_START: &str = "start";
pub const STAGE_UPDATE_RUNTIME: &str = "update_runtime";
pub const STAGE_CHECK_RUNTIME_RESOURCE: &str = "check_runtime_resource";

/// # Errors
///
/// Returns [`ProcessError::Configuration`] if the stage layout is invalid.
pub fn build(deps: &ProcessDependencies, config: &BrokerConfig) -> Result<StagedManager, ProcessError> {
    let store = &deps.store;
    let retry = config.step_timeouts.runtime_resource_update;
    ProcessBuilder::new("update", Arc::clone(store), config.process)
        .stages(&[STAGE_START, STAGE_UPDATE_RUNTIME, STAGE_CHECK_RUNTIME_RESOURCE])
        .step(
            STAGE_START,
            Arc::new(StartStep::new(Arc::clone(store), config.process.instance_wait_interval)),
        )
        .step_when(
            STAGE_UPDATE_RUNTIME,
            Arc::new(UpdateRuntimeResourceStep::new(
                UpdateRuntimeResourceStep::UPDATE,
                Arc::clone(store),
                Arc::clone(&deps.cluster),
                Arc::clone(&deps.plans),
                config.step_timeouts.cluster_api,
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
