//! Concrete steps used by the broker processes.

pub mod btp_operator;
pub mod conditions;
pub mod credentials;
pub mod holder;
pub mod kyma_resource;
pub mod kyma_template;
pub mod runtime_id;
pub mod runtime_resource;
pub mod start;

pub use btp_operator::InjectBtpOperatorCredentialsStep;
pub use credentials::ResolveCredentialsStep;
pub use holder::HolderStep;
pub use kyma_resource::ApplyKymaResourceStep;
pub use kyma_template::InitKymaTemplateStep;
pub use runtime_id::GenerateRuntimeIdStep;
pub use runtime_resource::{
    CheckRuntimeResourceDeletionStep, CheckRuntimeResourceStep, CreateRuntimeResourceStep,
    DeleteRuntimeResourceStep, UpdateRuntimeResourceStep,
};
pub use start::StartStep;
