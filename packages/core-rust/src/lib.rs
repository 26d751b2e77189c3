//! Kyma environment broker core: operation model, plan catalog, and error
//! metadata shared by the processing engine and its collaborators.

pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod fixture;
pub mod plans;
pub mod time;
pub mod types;

pub use error::{sanitize_reason, ErrorComponent, LastError};
pub use plans::{is_own_cluster_plan, PlanError, PlanRegistry};
pub use time::now_millis;
pub use types::{
    ErsContext, InstanceDetails, ModulesParameters, Operation, OperationState, OperationType,
    ProvisioningParameters, RequestParameters, SmOperatorCredentials, UpdatingParameters,
};
