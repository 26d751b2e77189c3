//! Operation fixtures for tests across the workspace.

use crate::plans::plan_ids;
use crate::time::now_millis;
use crate::types::{
    ErsContext, Operation, OperationState, OperationType, ProvisioningParameters,
    RequestParameters,
};

pub const GLOBAL_ACCOUNT_ID: &str = "ga-id";
pub const SUBACCOUNT_ID: &str = "sa-id";
pub const REGION: &str = "eu-central-1";

/// Provisioning parameters for the AWS plan.
#[must_use]
pub fn fix_provisioning_parameters(name: &str) -> ProvisioningParameters {
    ProvisioningParameters {
        plan_id: plan_ids::AWS.to_string(),
        service_id: "47c9dcbf-ff30-448e-ab36-d3bad66ba281".to_string(),
        platform_region: "cf-eu10".to_string(),
        ers_context: ErsContext {
            tenant_id: "tenant".to_string(),
            subaccount_id: SUBACCOUNT_ID.to_string(),
            global_account_id: GLOBAL_ACCOUNT_ID.to_string(),
            sm_operator_credentials: None,
        },
        parameters: RequestParameters {
            name: name.to_string(),
            region: Some(REGION.to_string()),
            ..RequestParameters::default()
        },
    }
}

/// A fresh, unpersisted `Pending` operation.
#[must_use]
pub fn fix_operation(id: &str, instance_id: &str, operation_type: OperationType) -> Operation {
    let mut op = Operation::new(
        id,
        instance_id,
        operation_type,
        fix_provisioning_parameters(&format!("cluster-{instance_id}")),
        now_millis(),
    );
    op.description = format!("Description for operation {id}");
    op
}

#[must_use]
pub fn fix_provisioning_operation(id: &str, instance_id: &str) -> Operation {
    fix_operation(id, instance_id, OperationType::Provision)
}

/// A deprovisioning operation already being processed.
#[must_use]
pub fn fix_deprovisioning_operation(id: &str, instance_id: &str) -> Operation {
    let mut op = fix_operation(id, instance_id, OperationType::Deprovision);
    op.state = OperationState::InProgress;
    op
}
