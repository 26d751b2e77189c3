//! Operation model shared by the processing engine and its collaborators.
//!
//! An [`Operation`] is the durable record of one lifecycle action against an
//! instance. It carries identity, progress ([`OperationState`] plus the list of
//! finished stages), the optimistic-concurrency `version`, and the immutable
//! input captured when the request was accepted.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::LastError;

/// Kind of lifecycle action an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationType {
    Provision,
    Deprovision,
    Update,
    UpgradeCluster,
}

impl OperationType {
    /// All operation types, in the order queues are usually started.
    pub const ALL: [OperationType; 4] = [
        OperationType::Provision,
        OperationType::Deprovision,
        OperationType::Update,
        OperationType::UpgradeCluster,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::Provision => "provision",
            OperationType::Deprovision => "deprovision",
            OperationType::Update => "update",
            OperationType::UpgradeCluster => "upgradeCluster",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress state of an operation.
///
/// State machine: Pending -> `InProgress` -> {Succeeded | Failed}.
/// `Succeeded` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl OperationState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OperationState::Pending => "pending",
            OperationState::InProgress => "in progress",
            OperationState::Succeeded => "succeeded",
            OperationState::Failed => "failed",
        }
    }

    /// Returns `true` for `Succeeded` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationState::Succeeded | OperationState::Failed)
    }

    /// Returns `true` if moving from `self` to `next` is a legal transition.
    ///
    /// Staying in the same non-terminal state is allowed (plain progress
    /// writes). Terminal states accept no transition at all, not even to
    /// themselves.
    #[must_use]
    pub fn can_transition_to(self, next: OperationState) -> bool {
        use OperationState::{Failed, InProgress, Pending, Succeeded};
        matches!(
            (self, next),
            (Pending, Pending | InProgress)
                | (InProgress, InProgress | Succeeded | Failed)
        )
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service Manager operator credentials forwarded by the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmOperatorCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub service_manager_url: String,
    pub url: String,
    pub xsappname: String,
}

/// Platform context attached to a provisioning request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErsContext {
    pub tenant_id: String,
    pub subaccount_id: String,
    pub global_account_id: String,
    pub sm_operator_credentials: Option<SmOperatorCredentials>,
}

/// Module selection requested by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModulesParameters {
    /// Release channel override (`fast` or `regular`).
    pub channel: Option<String>,
}

/// User-supplied parameters of a provisioning request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestParameters {
    pub name: String,
    pub region: Option<String>,
    pub machine_type: Option<String>,
    /// Kubeconfig of an externally managed cluster (own cluster plan only).
    #[serde(default)]
    pub kubeconfig: String,
    pub modules: Option<ModulesParameters>,
}

/// Input captured when the instance was requested. Immutable for the life
/// of an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningParameters {
    pub plan_id: String,
    pub service_id: String,
    pub platform_region: String,
    pub ers_context: ErsContext,
    pub parameters: RequestParameters,
}

/// Parameters of an update or cluster upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatingParameters {
    pub machine_type: Option<String>,
    pub auto_scaler_min: Option<u32>,
    pub auto_scaler_max: Option<u32>,
    pub kubernetes_version: Option<String>,
}

/// Details about the managed environment, filled in by steps as the
/// operation progresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDetails {
    pub runtime_id: Option<String>,
    pub runtime_resource_name: Option<String>,
    /// Subscription secret or credentials binding used for the cluster.
    pub subscription_name: Option<String>,
    pub kyma_resource_name: Option<String>,
    pub kyma_resource_namespace: Option<String>,
    pub kyma_template: Option<String>,
    pub kyma_channel: Option<String>,
}

/// Durable record of one lifecycle action's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    pub instance_id: String,
    #[serde(rename = "type")]
    pub operation_type: OperationType,
    pub state: OperationState,
    pub description: String,
    /// Stage names already completed, in completion order.
    pub finished_stages: Vec<String>,
    pub last_error: Option<LastError>,
    /// Incremented by the store on every successful write.
    pub version: u64,
    pub created_at: i64,
    pub updated_at: i64,
    /// Wall-clock millis of the first retry requested by each step.
    #[serde(default)]
    pub retry_started_at: BTreeMap<String, i64>,
    pub provisioning_parameters: ProvisioningParameters,
    #[serde(default)]
    pub updating_parameters: Option<UpdatingParameters>,
    #[serde(default)]
    pub instance_details: InstanceDetails,
}

impl Operation {
    /// Creates a new `Pending` operation with version 0.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        instance_id: impl Into<String>,
        operation_type: OperationType,
        provisioning_parameters: ProvisioningParameters,
        now: i64,
    ) -> Self {
        Self {
            id: id.into(),
            instance_id: instance_id.into(),
            operation_type,
            state: OperationState::Pending,
            description: "Operation created".to_string(),
            finished_stages: Vec::new(),
            last_error: None,
            version: 0,
            created_at: now,
            updated_at: now,
            retry_started_at: BTreeMap::new(),
            provisioning_parameters,
            updating_parameters: None,
            instance_details: InstanceDetails::default(),
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    #[must_use]
    pub fn is_stage_finished(&self, stage: &str) -> bool {
        self.finished_stages.iter().any(|s| s == stage)
    }

    /// Appends `stage` to the finished list. Returns `false` if it was
    /// already there (the list never holds duplicates).
    pub fn finish_stage(&mut self, stage: &str) -> bool {
        if self.is_stage_finished(stage) {
            return false;
        }
        self.finished_stages.push(stage.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_op() -> Operation {
        Operation::new(
            "op-1",
            "inst-1",
            OperationType::Provision,
            ProvisioningParameters::default(),
            1_000,
        )
    }

    #[test]
    fn new_operation_is_pending_at_version_zero() {
        let op = make_op();
        assert_eq!(op.state, OperationState::Pending);
        assert_eq!(op.version, 0);
        assert!(op.finished_stages.is_empty());
        assert_eq!(op.created_at, op.updated_at);
    }

    #[test]
    fn finish_stage_never_duplicates() {
        let mut op = make_op();
        assert!(op.finish_stage("start"));
        assert!(!op.finish_stage("start"));
        assert!(op.finish_stage("create_runtime"));
        assert_eq!(op.finished_stages, vec!["start", "create_runtime"]);
        assert!(op.is_stage_finished("start"));
        assert!(!op.is_stage_finished("check_runtime_resource"));
    }

    #[test]
    fn legal_state_transitions() {
        use OperationState::{Failed, InProgress, Pending, Succeeded};
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Succeeded));
        assert!(InProgress.can_transition_to(Failed));
        assert!(InProgress.can_transition_to(InProgress));

        assert!(!Pending.can_transition_to(Succeeded));
        assert!(!Succeeded.can_transition_to(InProgress));
        assert!(!Failed.can_transition_to(Failed));
        assert!(!Succeeded.can_transition_to(Succeeded));
    }

    #[test]
    fn terminal_states() {
        assert!(OperationState::Succeeded.is_terminal());
        assert!(OperationState::Failed.is_terminal());
        assert!(!OperationState::Pending.is_terminal());
        assert!(!OperationState::InProgress.is_terminal());
    }

    #[test]
    fn serializes_type_field_as_type() {
        let op = make_op();
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "provision");
        assert_eq!(json["state"], "pending");
        assert!(json.get("finishedStages").is_some());
    }

    proptest::proptest! {
        #[test]
        fn finished_stages_grow_monotonically(stages in proptest::collection::vec("[a-d]", 0..32)) {
            let mut op = make_op();
            let mut previous_len = 0;
            for stage in &stages {
                op.finish_stage(stage);
                proptest::prop_assert!(op.finished_stages.len() >= previous_len);
                proptest::prop_assert!(op.is_stage_finished(stage));
                previous_len = op.finished_stages.len();
            }
            let mut unique = op.finished_stages.clone();
            unique.sort();
            unique.dedup();
            proptest::prop_assert_eq!(unique.len(), op.finished_stages.len());
        }
    }
}
