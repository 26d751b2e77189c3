//! Staged execution of an operation.
//!
//! A [`StagedManager`] owns an ordered list of stages, each an ordered list
//! of steps. One call to [`StagedManager::execute`] is one pass: it skips
//! stages already recorded on the operation, runs the rest in order, and
//! persists a checkpoint after each completed stage. The pass ends early
//! when a step asks for a backoff, fails the operation, or the pass budget
//! runs out. Re-running a pass on the same operation is always safe.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kyma_broker_core::time::elapsed_since;
use kyma_broker_core::{now_millis, ErrorComponent, Operation, OperationState};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use super::error::ProcessError;
use super::operation_manager::OperationManager;
use super::step::{Step, StepCondition, StepError};
use crate::config::ProcessConfig;
use crate::storage::OperationStore;

/// Description set when every stage has completed.
pub const PROCESSING_FINISHED: &str = "Processing finished";
/// Description set when the operation outlived the process timeout.
pub const TIME_LIMIT_REACHED: &str = "operation has reached the time limit";
/// Description set when a pass over the operation panicked.
pub const INTERNAL_ERROR: &str = "operation failed: internal error";

const MANAGER_STEP: &str = "Staged_Manager";

/// Runs an operation by ID. Implemented by [`StagedManager`]; the queue
/// depends only on this trait.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Reloads the operation and runs one pass.
    ///
    /// # Errors
    ///
    /// See [`StagedManager::execute`].
    async fn execute_by_id(&self, operation_id: &str) -> Result<(Operation, Duration), ProcessError>;

    /// Persists `Failed` for an operation whose pass panicked, so it is
    /// neither resumed after a restart nor left blocking its instance.
    /// The panic payload stays in the logs.
    ///
    /// # Errors
    ///
    /// [`ProcessError::Storage`] if the failure could not be persisted.
    async fn fail_after_panic(&self, operation_id: &str) -> Result<Operation, ProcessError>;
}

struct RegisteredStep {
    step: Arc<dyn Step>,
    condition: Option<StepCondition>,
}

struct Stage {
    name: String,
    steps: Vec<RegisteredStep>,
}

/// Drives operations through a fixed sequence of stages.
pub struct StagedManager {
    name: String,
    store: Arc<dyn OperationStore>,
    stages: Vec<Stage>,
    config: ProcessConfig,
}

impl StagedManager {
    /// Creates a manager with no stages. `name` identifies the process in
    /// logs (e.g. `provisioning`).
    #[must_use]
    pub fn new(name: impl Into<String>, store: Arc<dyn OperationStore>, config: ProcessConfig) -> Self {
        Self {
            name: name.into(),
            store,
            stages: Vec::new(),
            config,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|s| s.name.as_str())
    }

    /// Step names of `stage`, in execution order.
    #[must_use]
    pub fn step_names(&self, stage: &str) -> Option<Vec<&str>> {
        self.stages
            .iter()
            .find(|s| s.name == stage)
            .map(|s| s.steps.iter().map(|r| r.step.name()).collect())
    }

    /// Declares the ordered stage list. Can be called once.
    ///
    /// # Errors
    ///
    /// [`ProcessError::Configuration`] if stages are already defined, the
    /// list is empty, or a name repeats.
    pub fn define_stages<I, S>(&mut self, names: I) -> Result<(), ProcessError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !self.stages.is_empty() {
            return Err(ProcessError::Configuration(format!(
                "stages of process {} are already defined",
                self.name
            )));
        }
        let mut stages: Vec<Stage> = Vec::new();
        for name in names {
            let name = name.into();
            if name.is_empty() {
                return Err(ProcessError::Configuration("stage name is empty".to_string()));
            }
            if stages.iter().any(|s| s.name == name) {
                return Err(ProcessError::Configuration(format!(
                    "stage {name} is defined twice"
                )));
            }
            stages.push(Stage {
                name,
                steps: Vec::new(),
            });
        }
        if stages.is_empty() {
            return Err(ProcessError::Configuration(
                "a process needs at least one stage".to_string(),
            ));
        }
        self.stages = stages;
        Ok(())
    }

    /// Appends `step` to `stage`. `None` as condition means always run.
    ///
    /// # Errors
    ///
    /// [`ProcessError::UnknownStage`] if `stage` was not defined.
    pub fn add_step(
        &mut self,
        stage: &str,
        step: Arc<dyn Step>,
        condition: Option<StepCondition>,
    ) -> Result<(), ProcessError> {
        let target = self
            .stages
            .iter_mut()
            .find(|s| s.name == stage)
            .ok_or_else(|| ProcessError::UnknownStage(stage.to_string()))?;
        debug!(process = %self.name, stage, step = step.name(), "step registered");
        target.steps.push(RegisteredStep { step, condition });
        Ok(())
    }

    /// Runs one pass over `operation`.
    ///
    /// Returns the latest operation and a backoff. A zero backoff with a
    /// terminal operation means processing is over; a zero backoff with a
    /// non-terminal operation means "run again right away"; a positive
    /// backoff means "run again after that delay".
    ///
    /// # Errors
    ///
    /// [`ProcessError::OperationFailed`] once the failure is persisted,
    /// [`ProcessError::Storage`] if a write failed (not terminal unless the
    /// operation vanished), [`ProcessError::Configuration`] if the process
    /// has no stages.
    pub async fn execute(&self, operation: Operation) -> Result<(Operation, Duration), ProcessError> {
        if operation.is_terminal() {
            debug!(operation_id = %operation.id, state = %operation.state, "operation already finished");
            return Ok((operation, Duration::ZERO));
        }
        if self.stages.is_empty() {
            return Err(ProcessError::Configuration(format!(
                "process {} has no stages",
                self.name
            )));
        }

        let manager = OperationManager::new(Arc::clone(&self.store), MANAGER_STEP, ErrorComponent::Broker);

        let mut operation = operation;
        if operation.state == OperationState::Pending {
            operation = manager
                .update_operation(operation, |op| {
                    if op.state == OperationState::Pending {
                        op.state = OperationState::InProgress;
                        op.description = "Operation in progress".to_string();
                    }
                })
                .await?;
            info!(process = %self.name, operation_id = %operation.id, "operation started");
        }

        if elapsed_since(operation.created_at, now_millis()) > self.config.operation_timeout {
            warn!(operation_id = %operation.id, timeout = ?self.config.operation_timeout, "{TIME_LIMIT_REACHED}");
            return Err(manager
                .operation_failed(operation, TIME_LIMIT_REACHED, None)
                .await
                .map_or_else(ProcessError::from, |_| {
                    ProcessError::Internal(anyhow::anyhow!("operation failure was not reported"))
                }));
        }

        let pass_started = Instant::now();
        let mut completed_this_pass = 0usize;

        for stage in &self.stages {
            if operation.is_stage_finished(&stage.name) {
                continue;
            }
            if completed_this_pass > 0 && pass_started.elapsed() >= self.config.max_pass_duration {
                debug!(
                    operation_id = %operation.id,
                    next_stage = %stage.name,
                    "pass budget used, yielding to the queue"
                );
                return Ok((operation, Duration::ZERO));
            }

            operation = match self.run_stage(stage, operation).await? {
                StageOutcome::Completed(op) => op,
                StageOutcome::Paused(op, backoff) => return Ok((op, backoff)),
            };
            if operation.is_terminal() {
                return Ok((operation, Duration::ZERO));
            }

            let stage_name = stage.name.clone();
            operation = manager
                .update_operation(operation, move |op| {
                    op.finish_stage(&stage_name);
                })
                .await?;
            completed_this_pass += 1;
            info!(operation_id = %operation.id, stage = %stage.name, "stage finished");
        }

        let operation = manager
            .update_operation(operation, |op| {
                op.state = OperationState::Succeeded;
                op.description = PROCESSING_FINISHED.to_string();
            })
            .await?;
        info!(process = %self.name, operation_id = %operation.id, "{PROCESSING_FINISHED}");
        metrics::counter!(
            "broker_operations_finished_total",
            "type" => operation.operation_type.as_str(),
            "state" => "succeeded"
        )
        .increment(1);
        Ok((operation, Duration::ZERO))
    }

    async fn run_stage(&self, stage: &Stage, operation: Operation) -> Result<StageOutcome, ProcessError> {
        let mut operation = operation;
        for registered in &stage.steps {
            let step_name = registered.step.name();
            if let Some(condition) = &registered.condition {
                if !condition(&operation) {
                    debug!(operation_id = %operation.id, step = step_name, "condition not met, skipping step");
                    continue;
                }
            }

            let span = info_span!(
                "step",
                step = step_name,
                stage = %stage.name,
                operation_id = %operation.id
            );
            let started = Instant::now();
            let result = registered.step.run(operation.clone()).instrument(span).await;
            metrics::histogram!("broker_step_duration_seconds", "step" => step_name.to_string())
                .record(started.elapsed().as_secs_f64());

            match result {
                Ok((updated, backoff)) => {
                    operation = updated;
                    if operation.is_terminal() {
                        return Ok(StageOutcome::Completed(operation));
                    }
                    if !backoff.is_zero() {
                        debug!(operation_id = %operation.id, step = step_name, ?backoff, "step requested backoff");
                        return Ok(StageOutcome::Paused(operation, backoff));
                    }
                }
                Err(StepError::Other(err)) => {
                    // Unclassified step errors end the operation.
                    let manager = OperationManager::new(
                        Arc::clone(&self.store),
                        step_name,
                        ErrorComponent::NotSet,
                    );
                    let message = format!("step {step_name} failed");
                    let failure = manager.operation_failed(operation, &message, Some(&err)).await;
                    return Err(failure.map_or_else(ProcessError::from, |_| {
                        ProcessError::Internal(anyhow::anyhow!("operation failure was not reported"))
                    }));
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(StageOutcome::Completed(operation))
    }
}

enum StageOutcome {
    Completed(Operation),
    Paused(Operation, Duration),
}

#[async_trait]
impl Executor for StagedManager {
    async fn execute_by_id(&self, operation_id: &str) -> Result<(Operation, Duration), ProcessError> {
        let operation = self.store.get_operation_by_id(operation_id).await?;
        self.execute(operation).await
    }

    async fn fail_after_panic(&self, operation_id: &str) -> Result<Operation, ProcessError> {
        let operation = self.store.get_operation_by_id(operation_id).await?;
        if operation.is_terminal() {
            return Ok(operation);
        }
        let manager = OperationManager::new(Arc::clone(&self.store), MANAGER_STEP, ErrorComponent::Broker);
        match manager.operation_failed(operation, INTERNAL_ERROR, None).await {
            Ok((operation, _)) => Ok(operation),
            Err(StepError::OperationFailed { operation, .. }) => Ok(*operation),
            Err(err) => Err(err.into()),
        }
    }
}

impl std::fmt::Debug for StagedManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedManager")
            .field("name", &self.name)
            .field("stages", &self.stage_names().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use kyma_broker_core::fixture::fix_provisioning_operation;
    use parking_lot::Mutex;

    use super::*;
    use crate::process::step::{condition, StepResult};
    use crate::storage::MemoryOperationStore;

    /// Records every invocation into a shared log and returns a scripted
    /// backoff sequence (zero once the script is exhausted).
    struct ScriptedStep {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        backoffs: Mutex<Vec<Duration>>,
    }

    impl ScriptedStep {
        fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Self::with_backoffs(name, log, Vec::new())
        }

        fn with_backoffs(name: &str, log: &Arc<Mutex<Vec<String>>>, backoffs: Vec<Duration>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                log: Arc::clone(log),
                backoffs: Mutex::new(backoffs),
            })
        }
    }

    #[async_trait]
    impl Step for ScriptedStep {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, operation: Operation) -> StepResult {
            self.log.lock().push(self.name.clone());
            let mut backoffs = self.backoffs.lock();
            let backoff = if backoffs.is_empty() {
                Duration::ZERO
            } else {
                backoffs.remove(0)
            };
            Ok((operation, backoff))
        }
    }

    struct FailingStep;

    #[async_trait]
    impl Step for FailingStep {
        fn name(&self) -> &str {
            "Failing_Step"
        }

        async fn run(&self, _operation: Operation) -> StepResult {
            Err(anyhow::anyhow!("unexpected response, password=hunter2").into())
        }
    }

    fn setup() -> (Arc<MemoryOperationStore>, StagedManager) {
        let store = Arc::new(MemoryOperationStore::new());
        let manager = StagedManager::new(
            "test",
            Arc::clone(&store) as Arc<dyn OperationStore>,
            ProcessConfig::default(),
        );
        (store, manager)
    }

    #[test]
    fn define_stages_rejects_invalid_lists() {
        let (_, mut manager) = setup();
        assert!(matches!(
            manager.define_stages(Vec::<String>::new()),
            Err(ProcessError::Configuration(_))
        ));
        assert!(matches!(
            manager.define_stages(["a", "b", "a"]),
            Err(ProcessError::Configuration(_))
        ));
        manager.define_stages(["a", "b"]).unwrap();
        assert!(matches!(
            manager.define_stages(["c"]),
            Err(ProcessError::Configuration(_))
        ));
        assert_eq!(manager.stage_names().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn add_step_to_unknown_stage_fails() {
        let (_, mut manager) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        manager.define_stages(["a"]).unwrap();
        let err = manager
            .add_step("missing", ScriptedStep::new("s", &log), None)
            .unwrap_err();
        assert!(matches!(err, ProcessError::UnknownStage(name) if name == "missing"));
    }

    #[tokio::test]
    async fn runs_all_stages_in_order_and_succeeds() {
        let (store, mut manager) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        manager.define_stages(["start", "work"]).unwrap();
        manager.add_step("start", ScriptedStep::new("s1", &log), None).unwrap();
        manager.add_step("work", ScriptedStep::new("s2", &log), None).unwrap();
        manager.add_step("work", ScriptedStep::new("s3", &log), None).unwrap();

        let op = store
            .insert_operation(fix_provisioning_operation("op-1", "inst-1"))
            .await
            .unwrap();
        let (op, backoff) = manager.execute(op).await.unwrap();

        assert_eq!(backoff, Duration::ZERO);
        assert_eq!(*log.lock(), vec!["s1", "s2", "s3"]);
        assert_eq!(op.state, OperationState::Succeeded);
        assert_eq!(op.description, PROCESSING_FINISHED);
        assert_eq!(op.finished_stages, vec!["start", "work"]);
        assert_eq!(store.get_operation_by_id("op-1").await.unwrap(), op);
    }

    #[tokio::test]
    async fn backoff_pauses_stage_and_resume_skips_finished_stages() {
        let (store, mut manager) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        manager.define_stages(["s1", "s2"]).unwrap();
        manager.add_step("s1", ScriptedStep::new("A", &log), None).unwrap();
        manager
            .add_step(
                "s2",
                ScriptedStep::with_backoffs("B", &log, vec![Duration::from_secs(5)]),
                None,
            )
            .unwrap();
        manager.add_step("s2", ScriptedStep::new("C", &log), None).unwrap();

        let op = store
            .insert_operation(fix_provisioning_operation("op-1", "inst-1"))
            .await
            .unwrap();
        let (op, backoff) = manager.execute(op).await.unwrap();
        assert_eq!(backoff, Duration::from_secs(5));
        assert_eq!(op.finished_stages, vec!["s1"]);
        assert_eq!(op.state, OperationState::InProgress);
        assert_eq!(*log.lock(), vec!["A", "B"]);

        let (op, backoff) = manager.execute_by_id("op-1").await.unwrap();
        assert_eq!(backoff, Duration::ZERO);
        assert_eq!(*log.lock(), vec!["A", "B", "B", "C"]);
        assert_eq!(op.finished_stages, vec!["s1", "s2"]);
        assert_eq!(op.state, OperationState::Succeeded);
    }

    #[tokio::test]
    async fn false_condition_skips_step() {
        let (store, mut manager) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        manager.define_stages(["only"]).unwrap();
        manager
            .add_step("only", ScriptedStep::new("skipped", &log), Some(condition(|_| false)))
            .unwrap();
        manager
            .add_step("only", ScriptedStep::new("ran", &log), Some(condition(|_| true)))
            .unwrap();

        let op = store
            .insert_operation(fix_provisioning_operation("op-1", "inst-1"))
            .await
            .unwrap();
        let (op, _) = manager.execute(op).await.unwrap();
        assert_eq!(*log.lock(), vec!["ran"]);
        assert_eq!(op.state, OperationState::Succeeded);
    }

    #[tokio::test]
    async fn terminal_operation_is_returned_untouched() {
        let (store, mut manager) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        manager.define_stages(["only"]).unwrap();
        manager.add_step("only", ScriptedStep::new("s", &log), None).unwrap();

        let mut op = fix_provisioning_operation("op-1", "inst-1");
        op.state = OperationState::Failed;
        let op = store.insert_operation(op).await.unwrap();
        let (returned, backoff) = manager.execute(op.clone()).await.unwrap();

        assert_eq!(returned, op);
        assert_eq!(backoff, Duration::ZERO);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn unclassified_step_error_fails_operation() {
        let (store, mut manager) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        manager.define_stages(["only"]).unwrap();
        manager.add_step("only", Arc::new(FailingStep), None).unwrap();
        manager.add_step("only", ScriptedStep::new("after", &log), None).unwrap();

        let op = store
            .insert_operation(fix_provisioning_operation("op-1", "inst-1"))
            .await
            .unwrap();
        let err = manager.execute(op).await.unwrap_err();
        assert!(err.is_terminal());
        assert!(log.lock().is_empty());

        let stored = store.get_operation_by_id("op-1").await.unwrap();
        assert_eq!(stored.state, OperationState::Failed);
        let last_error = stored.last_error.unwrap();
        assert_eq!(last_error.step, "Failing_Step");
        assert!(!last_error.reason.contains("hunter2"));
    }

    #[tokio::test]
    async fn expired_operation_is_failed_with_time_limit() {
        let store = Arc::new(MemoryOperationStore::new());
        let mut manager = StagedManager::new(
            "test",
            Arc::clone(&store) as Arc<dyn OperationStore>,
            ProcessConfig {
                operation_timeout: Duration::from_secs(60),
                ..ProcessConfig::default()
            },
        );
        let log = Arc::new(Mutex::new(Vec::new()));
        manager.define_stages(["only"]).unwrap();
        manager.add_step("only", ScriptedStep::new("s", &log), None).unwrap();

        let mut op = fix_provisioning_operation("op-1", "inst-1");
        op.state = OperationState::InProgress;
        op.created_at = now_millis() - 120_000;
        let op = store.insert_operation(op).await.unwrap();

        let err = manager.execute(op).await.unwrap_err();
        assert!(matches!(err, ProcessError::OperationFailed { .. }));
        let stored = store.get_operation_by_id("op-1").await.unwrap();
        assert_eq!(stored.state, OperationState::Failed);
        assert_eq!(stored.description, TIME_LIMIT_REACHED);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn exhausted_pass_budget_yields_between_stages() {
        let store = Arc::new(MemoryOperationStore::new());
        let mut manager = StagedManager::new(
            "test",
            Arc::clone(&store) as Arc<dyn OperationStore>,
            ProcessConfig {
                max_pass_duration: Duration::ZERO,
                ..ProcessConfig::default()
            },
        );
        let log = Arc::new(Mutex::new(Vec::new()));
        manager.define_stages(["a", "b"]).unwrap();
        manager.add_step("a", ScriptedStep::new("first", &log), None).unwrap();
        manager.add_step("b", ScriptedStep::new("second", &log), None).unwrap();

        let op = store
            .insert_operation(fix_provisioning_operation("op-1", "inst-1"))
            .await
            .unwrap();
        let (op, backoff) = manager.execute(op).await.unwrap();
        assert_eq!(backoff, Duration::ZERO);
        assert_eq!(op.state, OperationState::InProgress);
        assert_eq!(op.finished_stages, vec!["a"]);

        let (op, _) = manager.execute(op).await.unwrap();
        assert_eq!(op.state, OperationState::Succeeded);
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn missing_operation_is_terminal_error() {
        let (_, mut manager) = setup();
        manager.define_stages(["only"]).unwrap();
        let err = manager.execute_by_id("ghost").await.unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn step_counter_sees_each_pass() {
        struct Counting(AtomicUsize);

        #[async_trait]
        impl Step for Counting {
            fn name(&self) -> &str {
                "Counting"
            }

            async fn run(&self, operation: Operation) -> StepResult {
                let calls = self.0.fetch_add(1, Ordering::SeqCst);
                let backoff = if calls < 2 { Duration::from_millis(1) } else { Duration::ZERO };
                Ok((operation, backoff))
            }
        }

        let (store, mut manager) = setup();
        let step = Arc::new(Counting(AtomicUsize::new(0)));
        manager.define_stages(["only"]).unwrap();
        manager.add_step("only", Arc::clone(&step) as Arc<dyn Step>, None).unwrap();
        store
            .insert_operation(fix_provisioning_operation("op-1", "inst-1"))
            .await
            .unwrap();

        let mut passes = 0;
        loop {
            passes += 1;
            let (op, backoff) = manager.execute_by_id("op-1").await.unwrap();
            if op.is_terminal() {
                assert!(backoff.is_zero());
                break;
            }
        }
        assert_eq!(passes, 3);
        assert_eq!(step.0.load(Ordering::SeqCst), 3);
    }
}
