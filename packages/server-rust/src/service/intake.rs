//! Request intake: turns broker requests into persisted operations.
//!
//! Accepting a lifecycle request means inserting a `Pending` operation and
//! adding its ID to the queue of its type. The response only carries the
//! operation ID; callers poll [`BrokerRequest::LastOperation`] for state
//! and description.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use kyma_broker_core::{
    now_millis, Operation, OperationState, OperationType, PlanRegistry, ProvisioningParameters,
    UpdatingParameters,
};
use tower::Service;
use tracing::info;

use super::middleware::RecoveredPanic;
use crate::process::Queue;
use crate::shutdown::ShutdownController;
use crate::storage::{OperationStore, StorageError};

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum BrokerRequest {
    Provision {
        instance_id: String,
        /// Reusing an ID makes the request idempotent.
        operation_id: Option<String>,
        parameters: ProvisioningParameters,
    },
    Deprovision {
        instance_id: String,
    },
    Update {
        instance_id: String,
        parameters: UpdatingParameters,
    },
    UpgradeCluster {
        instance_id: String,
        kubernetes_version: String,
    },
    LastOperation {
        instance_id: String,
        operation_id: String,
    },
}

impl BrokerRequest {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerRequest::Provision { .. } => "provision",
            BrokerRequest::Deprovision { .. } => "deprovision",
            BrokerRequest::Update { .. } => "update",
            BrokerRequest::UpgradeCluster { .. } => "upgrade_cluster",
            BrokerRequest::LastOperation { .. } => "last_operation",
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        match self {
            BrokerRequest::Provision { instance_id, .. }
            | BrokerRequest::Deprovision { instance_id }
            | BrokerRequest::Update { instance_id, .. }
            | BrokerRequest::UpgradeCluster { instance_id, .. }
            | BrokerRequest::LastOperation { instance_id, .. } => instance_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerResponse {
    Accepted {
        operation_id: String,
    },
    LastOperation {
        state: OperationState,
        description: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("broker is not accepting requests")]
    ShuttingDown,
    #[error("plan {plan_id} is not in the catalog")]
    UnknownPlan { plan_id: String },
    #[error("instance {instance_id} not found")]
    InstanceNotFound { instance_id: String },
    #[error("operation {operation_id} not found")]
    OperationNotFound { operation_id: String },
    #[error("no queue registered for {operation_type} operations")]
    NoQueue { operation_type: OperationType },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Panicked(#[from] RecoveredPanic),
}

// ---------------------------------------------------------------------------
// OperationIntake
// ---------------------------------------------------------------------------

/// `tower::Service` accepting [`BrokerRequest`]s.
#[derive(Clone)]
pub struct OperationIntake {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn OperationStore>,
    plans: Arc<PlanRegistry>,
    shutdown: Arc<ShutdownController>,
    queues: HashMap<OperationType, Arc<Queue>>,
}

impl OperationIntake {
    #[must_use]
    pub fn new(
        store: Arc<dyn OperationStore>,
        plans: Arc<PlanRegistry>,
        shutdown: Arc<ShutdownController>,
        queues: HashMap<OperationType, Arc<Queue>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                plans,
                shutdown,
                queues,
            }),
        }
    }
}

impl Inner {
    async fn handle(&self, request: BrokerRequest) -> Result<BrokerResponse, IntakeError> {
        let operation = match request {
            BrokerRequest::LastOperation {
                instance_id,
                operation_id,
            } => return self.last_operation(&instance_id, &operation_id).await,
            _ if !self.shutdown.accepts_requests() => return Err(IntakeError::ShuttingDown),
            BrokerRequest::Provision {
                instance_id,
                operation_id,
                parameters,
            } => {
                if self.plans.plan_name(&parameters.plan_id).is_none() {
                    return Err(IntakeError::UnknownPlan {
                        plan_id: parameters.plan_id,
                    });
                }
                let id = operation_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                Operation::new(id, instance_id, OperationType::Provision, parameters, now_millis())
            }
            BrokerRequest::Deprovision { instance_id } => {
                self.follow_up(&instance_id, OperationType::Deprovision, None).await?
            }
            BrokerRequest::Update {
                instance_id,
                parameters,
            } => {
                self.follow_up(&instance_id, OperationType::Update, Some(parameters))
                    .await?
            }
            BrokerRequest::UpgradeCluster {
                instance_id,
                kubernetes_version,
            } => {
                let parameters = UpdatingParameters {
                    kubernetes_version: Some(kubernetes_version),
                    ..UpdatingParameters::default()
                };
                self.follow_up(&instance_id, OperationType::UpgradeCluster, Some(parameters))
                    .await?
            }
        };
        self.accept(operation).await
    }

    /// Builds an operation that continues the life of a provisioned
    /// instance: same input, same instance details. Its creation time is
    /// strictly after every earlier operation of the instance, so the start
    /// step orders it behind them. The details are refreshed there too.
    async fn follow_up(
        &self,
        instance_id: &str,
        operation_type: OperationType,
        updating: Option<UpdatingParameters>,
    ) -> Result<Operation, IntakeError> {
        let operations = self.store.list_operations_by_instance_id(instance_id).await?;
        let provisioning = operations
            .iter()
            .rev()
            .find(|op| op.operation_type == OperationType::Provision)
            .ok_or_else(|| IntakeError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;
        let latest_created_at = operations.iter().map(|op| op.created_at).max().unwrap_or_default();
        let mut operation = Operation::new(
            uuid::Uuid::new_v4().to_string(),
            instance_id,
            operation_type,
            provisioning.provisioning_parameters.clone(),
            now_millis().max(latest_created_at + 1),
        );
        operation.instance_details = provisioning.instance_details.clone();
        operation.updating_parameters = updating;
        Ok(operation)
    }

    async fn accept(&self, operation: Operation) -> Result<BrokerResponse, IntakeError> {
        let queue = self
            .queues
            .get(&operation.operation_type)
            .ok_or(IntakeError::NoQueue {
                operation_type: operation.operation_type,
            })?;
        let operation_id = operation.id.clone();
        match self.store.insert_operation(operation).await {
            Ok(stored) => {
                info!(
                    operation_id = %stored.id,
                    instance_id = %stored.instance_id,
                    operation_type = %stored.operation_type,
                    "operation accepted"
                );
            }
            Err(StorageError::AlreadyExists { .. }) => {
                info!(operation_id = %operation_id, "operation already accepted");
            }
            Err(err) => return Err(err.into()),
        }
        queue.add(&operation_id);
        Ok(BrokerResponse::Accepted { operation_id })
    }

    async fn last_operation(&self, instance_id: &str, operation_id: &str) -> Result<BrokerResponse, IntakeError> {
        let not_found = || IntakeError::OperationNotFound {
            operation_id: operation_id.to_string(),
        };
        let operation = match self.store.get_operation_by_id(operation_id).await {
            Ok(operation) => operation,
            Err(err) if err.is_not_found() => return Err(not_found()),
            Err(err) => return Err(err.into()),
        };
        if operation.instance_id != instance_id {
            return Err(not_found());
        }
        Ok(BrokerResponse::LastOperation {
            state: operation.state,
            description: operation.description,
        })
    }
}

impl Service<BrokerRequest> for OperationIntake {
    type Response = BrokerResponse;
    type Error = IntakeError;
    type Future = Pin<Box<dyn Future<Output = Result<BrokerResponse, IntakeError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: BrokerRequest) -> Self::Future {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { inner.handle(request).await })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use kyma_broker_core::fixture::fix_provisioning_parameters;
    use tower::ServiceExt;

    use super::*;
    use crate::config::QueueConfig;
    use crate::process::{Executor, ProcessError};
    use crate::storage::MemoryOperationStore;

    struct NoopExecutor;

    #[async_trait]
    impl Executor for NoopExecutor {
        async fn execute_by_id(&self, operation_id: &str) -> Result<(Operation, Duration), ProcessError> {
            Err(ProcessError::Configuration(format!("not executed: {operation_id}")))
        }

        async fn fail_after_panic(&self, operation_id: &str) -> Result<Operation, ProcessError> {
            Err(ProcessError::Configuration(format!("not executed: {operation_id}")))
        }
    }

    struct Harness {
        store: Arc<MemoryOperationStore>,
        shutdown: Arc<ShutdownController>,
        queues: HashMap<OperationType, Arc<Queue>>,
        intake: OperationIntake,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryOperationStore::new());
        let shutdown = Arc::new(ShutdownController::new());
        shutdown.set_ready();
        let queues: HashMap<_, _> = OperationType::ALL
            .into_iter()
            .map(|operation_type| {
                let queue = Queue::new(
                    operation_type.as_str(),
                    Arc::new(NoopExecutor),
                    QueueConfig::default(),
                    Arc::clone(&shutdown),
                );
                (operation_type, Arc::new(queue))
            })
            .collect();
        let intake = OperationIntake::new(
            store.clone(),
            Arc::new(PlanRegistry::kyma_defaults()),
            Arc::clone(&shutdown),
            queues.clone(),
        );
        Harness {
            store,
            shutdown,
            queues,
            intake,
        }
    }

    fn provision(instance_id: &str, operation_id: &str) -> BrokerRequest {
        BrokerRequest::Provision {
            instance_id: instance_id.to_string(),
            operation_id: Some(operation_id.to_string()),
            parameters: fix_provisioning_parameters("cluster"),
        }
    }

    #[tokio::test]
    async fn provision_persists_pending_operation_and_queues_it() {
        let h = harness();
        let response = h.intake.clone().oneshot(provision("inst", "op-1")).await.unwrap();
        assert_eq!(
            response,
            BrokerResponse::Accepted {
                operation_id: "op-1".to_string()
            }
        );
        let stored = h.store.get_operation_by_id("op-1").await.unwrap();
        assert_eq!(stored.state, OperationState::Pending);
        assert_eq!(h.queues[&OperationType::Provision].len(), 1);
    }

    #[tokio::test]
    async fn repeated_provision_is_idempotent() {
        let h = harness();
        h.intake.clone().oneshot(provision("inst", "op-1")).await.unwrap();
        let again = h.intake.clone().oneshot(provision("inst", "op-1")).await.unwrap();
        assert!(matches!(again, BrokerResponse::Accepted { .. }));
        assert_eq!(h.store.len(), 1);
        assert_eq!(h.queues[&OperationType::Provision].len(), 1);
    }

    #[tokio::test]
    async fn unknown_plan_is_rejected() {
        let h = harness();
        let mut parameters = fix_provisioning_parameters("cluster");
        parameters.plan_id = "nope".to_string();
        let request = BrokerRequest::Provision {
            instance_id: "inst".to_string(),
            operation_id: None,
            parameters,
        };
        let err = h.intake.clone().oneshot(request).await.unwrap_err();
        assert!(matches!(err, IntakeError::UnknownPlan { .. }));
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn deprovision_inherits_instance_details() {
        let h = harness();
        h.intake.clone().oneshot(provision("inst", "op-1")).await.unwrap();
        let mut provisioned = h.store.get_operation_by_id("op-1").await.unwrap();
        provisioned.instance_details.runtime_id = Some("rt".to_string());
        h.store.update_operation(provisioned).await.unwrap();

        let request = BrokerRequest::Deprovision {
            instance_id: "inst".to_string(),
        };
        let BrokerResponse::Accepted { operation_id } = h.intake.clone().oneshot(request).await.unwrap() else {
            panic!("expected accepted");
        };
        let deprovisioning = h.store.get_operation_by_id(&operation_id).await.unwrap();
        assert_eq!(deprovisioning.operation_type, OperationType::Deprovision);
        assert_eq!(deprovisioning.instance_details.runtime_id.as_deref(), Some("rt"));
        assert_eq!(h.queues[&OperationType::Deprovision].len(), 1);
    }

    #[tokio::test]
    async fn follow_up_is_ordered_after_existing_operations() {
        let h = harness();
        // Clock skew: the provisioning row claims a creation time ahead of ours.
        let mut provisioning = Operation::new(
            "op-1",
            "inst",
            OperationType::Provision,
            fix_provisioning_parameters("cluster"),
            now_millis() + 60_000,
        );
        provisioning.state = OperationState::InProgress;
        let provisioning = h.store.insert_operation(provisioning).await.unwrap();

        let request = BrokerRequest::Deprovision {
            instance_id: "inst".to_string(),
        };
        let BrokerResponse::Accepted { operation_id } = h.intake.clone().oneshot(request).await.unwrap() else {
            panic!("expected accepted");
        };
        let deprovisioning = h.store.get_operation_by_id(&operation_id).await.unwrap();
        assert!(deprovisioning.created_at > provisioning.created_at);
    }

    #[tokio::test]
    async fn upgrade_of_unknown_instance_fails() {
        let h = harness();
        let request = BrokerRequest::UpgradeCluster {
            instance_id: "ghost".to_string(),
            kubernetes_version: "1.31".to_string(),
        };
        let err = h.intake.clone().oneshot(request).await.unwrap_err();
        assert!(matches!(err, IntakeError::InstanceNotFound { .. }));
    }

    #[tokio::test]
    async fn last_operation_reports_state_and_checks_instance() {
        let h = harness();
        h.intake.clone().oneshot(provision("inst", "op-1")).await.unwrap();

        let ok = h
            .intake
            .clone()
            .oneshot(BrokerRequest::LastOperation {
                instance_id: "inst".to_string(),
                operation_id: "op-1".to_string(),
            })
            .await
            .unwrap();
        assert!(matches!(
            ok,
            BrokerResponse::LastOperation {
                state: OperationState::Pending,
                ..
            }
        ));

        let err = h
            .intake
            .clone()
            .oneshot(BrokerRequest::LastOperation {
                instance_id: "other".to_string(),
                operation_id: "op-1".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::OperationNotFound { .. }));
    }

    #[tokio::test]
    async fn draining_broker_refuses_new_operations_but_answers_polls() {
        let h = harness();
        h.intake.clone().oneshot(provision("inst", "op-1")).await.unwrap();
        h.shutdown.trigger_shutdown();

        let err = h.intake.clone().oneshot(provision("inst-2", "op-2")).await.unwrap_err();
        assert!(matches!(err, IntakeError::ShuttingDown));
        let poll = h
            .intake
            .clone()
            .oneshot(BrokerRequest::LastOperation {
                instance_id: "inst".to_string(),
                operation_id: "op-1".to_string(),
            })
            .await;
        assert!(poll.is_ok());
    }
}
