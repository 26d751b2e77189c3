//! Step conditions shared by the process definitions.

use kyma_broker_core::{is_own_cluster_plan, Operation};

use crate::process::step::{condition, StepCondition};

/// Runs the step for every plan except own cluster.
#[must_use]
pub fn skip_for_own_cluster_plan() -> StepCondition {
    condition(|op: &Operation| !is_own_cluster_plan(&op.provisioning_parameters.plan_id))
}

/// Runs the step only for the own cluster plan.
#[must_use]
pub fn do_for_own_cluster_plan_only() -> StepCondition {
    condition(|op: &Operation| is_own_cluster_plan(&op.provisioning_parameters.plan_id))
}

/// Runs the step only if the platform forwarded Service Manager credentials.
#[must_use]
pub fn when_btp_operator_credentials_provided() -> StepCondition {
    condition(|op: &Operation| {
        op.provisioning_parameters
            .ers_context
            .sm_operator_credentials
            .as_ref()
            .is_some_and(|c| !c.client_id.is_empty() && !c.client_secret.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use kyma_broker_core::fixture::fix_provisioning_operation;
    use kyma_broker_core::plans::plan_ids;
    use kyma_broker_core::SmOperatorCredentials;

    use super::*;

    #[test]
    fn own_cluster_conditions_are_complementary() {
        let mut op = fix_provisioning_operation("op", "inst");
        assert!(skip_for_own_cluster_plan()(&op));
        assert!(!do_for_own_cluster_plan_only()(&op));

        op.provisioning_parameters.plan_id = plan_ids::OWN_CLUSTER.to_string();
        assert!(!skip_for_own_cluster_plan()(&op));
        assert!(do_for_own_cluster_plan_only()(&op));
    }

    #[test]
    fn btp_credentials_need_id_and_secret() {
        let mut op = fix_provisioning_operation("op", "inst");
        let cond = when_btp_operator_credentials_provided();
        assert!(!cond(&op));

        op.provisioning_parameters.ers_context.sm_operator_credentials = Some(SmOperatorCredentials {
            client_id: "id".to_string(),
            ..SmOperatorCredentials::default()
        });
        assert!(!cond(&op));

        if let Some(creds) = op.provisioning_parameters.ers_context.sm_operator_credentials.as_mut() {
            creds.client_secret = "secret".to_string();
        }
        assert!(cond(&op));
    }
}
