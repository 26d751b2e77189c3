//! Work queue of operation IDs.
//!
//! Semantics follow a classic controller work queue:
//!
//! - an ID waiting in the queue is stored once, however often it is added;
//! - an ID is handed to at most one worker at a time;
//! - an ID added while a worker holds it is remembered and queued again
//!   when that worker is done.
//!
//! Workers reload the operation through an [`Executor`] on every pass and
//! decide from the outcome whether to drop the ID, queue it again now, or
//! queue it again after a delay. Each pass runs in its own task, so a panic
//! inside a step ends that pass only: the operation is marked failed, and
//! the ID is dropped and never retried.

use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use kyma_broker_core::OperationType;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::manager::Executor;
use crate::config::QueueConfig;
use crate::shutdown::ShutdownController;
use crate::storage::{OperationStore, StorageError};

#[derive(Debug, Default)]
struct Items {
    ready: VecDeque<String>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    dirty: HashSet<String>,
    stopped: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    items: Mutex<Items>,
    notify: Notify,
}

impl QueueState {
    fn add(&self, id: &str) {
        let mut items = self.items.lock();
        if items.stopped {
            return;
        }
        if items.processing.contains(id) {
            items.dirty.insert(id.to_string());
            return;
        }
        if items.queued.insert(id.to_string()) {
            items.ready.push_back(id.to_string());
            drop(items);
            self.notify.notify_one();
        }
    }

    fn take(&self) -> Option<String> {
        let mut items = self.items.lock();
        let id = items.ready.pop_front()?;
        items.queued.remove(&id);
        items.processing.insert(id.clone());
        Some(id)
    }

    fn done(&self, id: &str) {
        let mut items = self.items.lock();
        items.processing.remove(id);
        if items.dirty.remove(id) && !items.stopped && items.queued.insert(id.to_string()) {
            items.ready.push_back(id.to_string());
            drop(items);
            self.notify.notify_one();
        }
    }

    fn stop(&self) {
        self.items.lock().stopped = true;
        self.notify.notify_waiters();
    }

    async fn next(&self, stop: &mut watch::Receiver<bool>) -> Option<String> {
        loop {
            if *stop.borrow() {
                self.stop();
                return None;
            }
            let notified = self.notify.notified();
            if self.items.lock().stopped {
                return None;
            }
            if let Some(id) = self.take() {
                return Some(id);
            }
            tokio::select! {
                () = notified => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        self.stop();
                        return None;
                    }
                }
            }
        }
    }
}

/// Queue of operation IDs processed by a pool of workers.
pub struct Queue {
    name: String,
    executor: Arc<dyn Executor>,
    config: QueueConfig,
    shutdown: Arc<ShutdownController>,
    state: Arc<QueueState>,
    stop: Mutex<Option<watch::Receiver<bool>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Queue {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        executor: Arc<dyn Executor>,
        config: QueueConfig,
        shutdown: Arc<ShutdownController>,
    ) -> Self {
        Self {
            name: name.into(),
            executor,
            config,
            shutdown,
            state: Arc::new(QueueState::default()),
            stop: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues `operation_id`. No-op if it is already waiting or the queue
    /// has stopped.
    pub fn add(&self, operation_id: &str) {
        debug!(queue = %self.name, operation_id, "operation added");
        self.state.add(operation_id);
    }

    /// Enqueues `operation_id` once `delay` has passed. A zero delay adds
    /// immediately. Pending delays are abandoned when the queue stops.
    pub fn add_after(&self, operation_id: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(operation_id);
            return;
        }
        let stop = self.stop.lock().clone();
        schedule(&self.state, operation_id.to_string(), delay, stop);
    }

    /// Number of IDs waiting for a worker.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.items.lock().ready.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts `workers` workers (at least one). They stop pulling new IDs
    /// once `stop` turns `true`; passes already running finish normally.
    pub fn run(&self, stop: watch::Receiver<bool>, workers: usize) {
        *self.stop.lock() = Some(stop.clone());
        let mut handles = self.workers.lock();
        for index in 0..workers.max(1) {
            let worker = Worker {
                queue: self.name.clone(),
                executor: Arc::clone(&self.executor),
                config: self.config.clone(),
                shutdown: Arc::clone(&self.shutdown),
                state: Arc::clone(&self.state),
                stop: stop.clone(),
            };
            let span = info_span!("queue_worker", queue = %self.name, worker = index);
            handles.push(tokio::spawn(worker.run().instrument(span)));
        }
        info!(queue = %self.name, workers = workers.max(1), "queue started");
    }

    /// Waits until every worker has exited.
    pub async fn wait_for_workers(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                error!(queue = %self.name, %err, "queue worker ended abnormally");
            }
        }
        info!(queue = %self.name, "queue stopped");
    }

    /// Stops accepting IDs and waits up to `timeout` for the workers to
    /// finish their current pass. Returns `false` if they did not.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.state.stop();
        let drained = tokio::time::timeout(timeout, self.wait_for_workers()).await.is_ok();
        if !drained {
            warn!(queue = %self.name, ?timeout, "queue workers still busy after shutdown timeout");
        }
        drained
    }

    /// Adds every unfinished operation of `operation_type`, so work
    /// interrupted by a restart continues. Returns how many were added.
    ///
    /// # Errors
    ///
    /// Propagates the store failure.
    pub async fn resume_unfinished(
        &self,
        store: &dyn OperationStore,
        operation_type: OperationType,
    ) -> Result<usize, StorageError> {
        let operations = store.get_not_finished_operations_by_type(operation_type).await?;
        for operation in &operations {
            self.add(&operation.id);
        }
        info!(
            queue = %self.name,
            operation_type = %operation_type,
            count = operations.len(),
            "unfinished operations resumed"
        );
        Ok(operations.len())
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("waiting", &self.len())
            .finish_non_exhaustive()
    }
}

fn schedule(state: &Arc<QueueState>, id: String, delay: Duration, stop: Option<watch::Receiver<bool>>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        match stop {
            Some(mut stop) => {
                tokio::select! {
                    () = tokio::time::sleep(delay) => state.add(&id),
                    _ = stop.wait_for(|stopped| *stopped) => {}
                }
            }
            None => {
                tokio::time::sleep(delay).await;
                state.add(&id);
            }
        }
    });
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

struct Worker {
    queue: String,
    executor: Arc<dyn Executor>,
    config: QueueConfig,
    shutdown: Arc<ShutdownController>,
    state: Arc<QueueState>,
    stop: watch::Receiver<bool>,
}

impl Worker {
    async fn run(self) {
        let mut stop = self.stop.clone();
        while let Some(id) = self.state.next(&mut stop).await {
            self.process(&id).await;
        }
        debug!(queue = %self.queue, "worker exiting");
    }

    async fn process(&self, id: &str) {
        let _pass = self.shutdown.pass_guard();
        let executor = Arc::clone(&self.executor);
        let task_id = id.to_string();
        let span = info_span!("operation", queue = %self.queue, operation_id = %id);
        let outcome = tokio::spawn(async move { executor.execute_by_id(&task_id).await }.instrument(span)).await;
        self.state.done(id);

        match outcome {
            Ok(Ok((operation, backoff))) => {
                if operation.is_terminal() {
                    info!(
                        queue = %self.queue,
                        operation_id = %id,
                        state = %operation.state,
                        "operation processing finished"
                    );
                } else if backoff.is_zero() {
                    self.state.add(id);
                } else {
                    debug!(queue = %self.queue, operation_id = %id, ?backoff, "operation requeued with backoff");
                    schedule(&self.state, id.to_string(), backoff, Some(self.stop.clone()));
                }
            }
            Ok(Err(err)) if err.is_terminal() => {
                error!(queue = %self.queue, operation_id = %id, %err, "operation dropped from the queue");
            }
            Ok(Err(err)) => {
                warn!(
                    queue = %self.queue,
                    operation_id = %id,
                    %err,
                    backoff = ?self.config.error_backoff,
                    "operation pass failed, retrying later"
                );
                schedule(
                    &self.state,
                    id.to_string(),
                    self.config.error_backoff,
                    Some(self.stop.clone()),
                );
            }
            Err(join) if join.is_panic() => {
                let payload = join.into_panic();
                error!(
                    queue = %self.queue,
                    operation_id = %id,
                    panic = %panic_message(payload.as_ref()),
                    "operation pass panicked, operation dropped"
                );
                metrics::counter!("broker_operation_panics_total", "queue" => self.queue.clone()).increment(1);
                if let Err(err) = self.executor.fail_after_panic(id).await {
                    error!(queue = %self.queue, operation_id = %id, %err, "unable to mark panicked operation as failed");
                }
            }
            Err(join) => {
                warn!(queue = %self.queue, operation_id = %id, err = %join, "operation pass cancelled");
            }
        }
    }
}
