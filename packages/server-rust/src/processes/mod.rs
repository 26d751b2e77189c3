//! Stage layouts of the broker's operation types.
//!
//! Each process is assembled once at startup from a [`BrokerConfig`]
//! snapshot. Configuration decides which of several mutually exclusive
//! steps gets registered; nothing is re-decided while operations run.

use std::sync::Arc;

use kyma_broker_core::{OperationType, PlanRegistry};

use crate::clients::{ClusterClient, PlanConfigProvider, SubscriptionResolver};
use crate::config::BrokerConfig;
use crate::process::{ProcessError, StagedManager};
use crate::storage::OperationStore;

pub mod deprovisioning;
pub mod provisioning;
pub mod update;
pub mod upgrade_cluster;

/// Collaborators shared by every process.
#[derive(Clone)]
pub struct ProcessDependencies {
    pub store: Arc<dyn OperationStore>,
    pub cluster: Arc<dyn ClusterClient>,
    pub plan_config: Arc<dyn PlanConfigProvider>,
    pub subscriptions: Arc<dyn SubscriptionResolver>,
    pub plans: Arc<PlanRegistry>,
}

/// Builds the staged manager for `operation_type`.
///
/// # Errors
///
/// Returns [`ProcessError::Configuration`] if a stage layout is invalid.
pub fn build_process(
    operation_type: OperationType,
    deps: &ProcessDependencies,
    config: &BrokerConfig,
) -> Result<StagedManager, ProcessError> {
    match operation_type {
        OperationType::Provision => provisioning::build(deps, config),
        OperationType::Deprovision => deprovisioning::build(deps, config),
        OperationType::Update => update::build(deps, config),
        OperationType::UpgradeCluster => upgrade_cluster::build(deps, config),
    }
}
