//! Declarative assembly of a [`StagedManager`].
//!
//! Processes are described as a list of step entries, each tagged with its
//! stage, an optional run condition and whether configuration disabled it.
//! Disabled entries are dropped at build time, which is how mutually
//! exclusive implementations of one step are selected from configuration.

use std::sync::Arc;

use tracing::debug;

use super::error::ProcessError;
use super::manager::StagedManager;
use super::step::{Step, StepCondition};
use crate::config::ProcessConfig;
use crate::storage::OperationStore;

struct Entry {
    stage: String,
    step: Arc<dyn Step>,
    condition: Option<StepCondition>,
    disabled: bool,
}

/// Builder for a [`StagedManager`].
pub struct ProcessBuilder {
    name: String,
    store: Arc<dyn OperationStore>,
    config: ProcessConfig,
    stages: Vec<String>,
    entries: Vec<Entry>,
}

impl ProcessBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>, store: Arc<dyn OperationStore>, config: ProcessConfig) -> Self {
        Self {
            name: name.into(),
            store,
            config,
            stages: Vec::new(),
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn stages(mut self, names: &[&str]) -> Self {
        self.stages = names.iter().map(ToString::to_string).collect();
        self
    }

    /// Adds a step that always runs.
    #[must_use]
    pub fn step(self, stage: &str, step: Arc<dyn Step>) -> Self {
        self.entry(stage, step, None, false)
    }

    /// Adds a step guarded by `condition`.
    #[must_use]
    pub fn step_when(self, stage: &str, step: Arc<dyn Step>, condition: StepCondition) -> Self {
        self.entry(stage, step, Some(condition), false)
    }

    /// Adds a step that is registered only if `enabled`.
    #[must_use]
    pub fn step_if(
        self,
        enabled: bool,
        stage: &str,
        step: Arc<dyn Step>,
        condition: Option<StepCondition>,
    ) -> Self {
        self.entry(stage, step, condition, !enabled)
    }

    fn entry(
        mut self,
        stage: &str,
        step: Arc<dyn Step>,
        condition: Option<StepCondition>,
        disabled: bool,
    ) -> Self {
        self.entries.push(Entry {
            stage: stage.to_string(),
            step,
            condition,
            disabled,
        });
        self
    }

    /// Defines the stages and registers every enabled step.
    ///
    /// # Errors
    ///
    /// Propagates [`StagedManager::define_stages`] and
    /// [`StagedManager::add_step`] failures.
    pub fn build(self) -> Result<StagedManager, ProcessError> {
        let mut manager = StagedManager::new(self.name, self.store, self.config);
        manager.define_stages(self.stages)?;
        for entry in self.entries {
            if entry.disabled {
                debug!(process = %manager.name(), step = entry.step.name(), "step disabled by configuration");
                continue;
            }
            manager.add_step(&entry.stage, entry.step, entry.condition)?;
        }
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use kyma_broker_core::Operation;

    use super::*;
    use crate::process::step::{condition, StepResult};
    use crate::storage::MemoryOperationStore;

    struct Named(&'static str);

    #[async_trait]
    impl Step for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn run(&self, operation: Operation) -> StepResult {
            Ok((operation, Duration::ZERO))
        }
    }

    fn builder() -> ProcessBuilder {
        ProcessBuilder::new(
            "test",
            Arc::new(MemoryOperationStore::new()),
            ProcessConfig::default(),
        )
    }

    #[test]
    fn disabled_entries_are_not_registered() {
        let use_binding = true;
        let manager = builder()
            .stages(&["start", "create"])
            .step("start", Arc::new(Named("Start")))
            .step_if(!use_binding, "create", Arc::new(Named("Resolve_Secret")), None)
            .step_if(use_binding, "create", Arc::new(Named("Resolve_Binding")), None)
            .step_when("create", Arc::new(Named("Conditional")), condition(|_| true))
            .build()
            .unwrap();

        assert_eq!(manager.step_names("start").unwrap(), vec!["Start"]);
        assert_eq!(
            manager.step_names("create").unwrap(),
            vec!["Resolve_Binding", "Conditional"]
        );
    }

    #[test]
    fn unknown_stage_fails_build() {
        let err = builder()
            .stages(&["start"])
            .step("nope", Arc::new(Named("Start")))
            .build()
            .unwrap_err();
        assert!(matches!(err, ProcessError::UnknownStage(_)));
    }

    #[test]
    fn disabled_entry_on_unknown_stage_is_ignored() {
        let manager = builder()
            .stages(&["start"])
            .step_if(false, "nope", Arc::new(Named("Start")), None)
            .build()
            .unwrap();
        assert!(manager.step_names("start").unwrap().is_empty());
    }
}
