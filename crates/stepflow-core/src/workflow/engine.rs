//! Execution coordinator: the workflow engine proper.
//!
//! `WorkflowEngine` owns the definition registry and every execution record.
//! Callers register definitions, start executions (which only enqueue), and
//! query or cancel them. Once `start` has been called, a background admission
//! loop pulls execution ids off the FIFO queue whenever a concurrency slot is
//! free and drives each one to a terminal status.
//!
//! # Execution flow
//!
//! 1. `start_execution` creates a Pending `Execution` and enqueues its id.
//! 2. The admission loop admits the id once fewer than
//!    `max_concurrent_executions` are running.
//! 3. The driving loop resolves step order, then repeatedly launches ready
//!    steps (up to `max_parallel_steps`) and skips steps whose dependencies
//!    failed or were skipped.
//! 4. Cancellation (explicit, shutdown, or `max_execution_time_ms`) stops
//!    further launches; in-flight steps finish and are recorded.
//! 5. The final status is Cancelled, Failed (any step failed) or Completed;
//!    the snapshot is saved to the store and a terminal event is emitted.
//!
//! Each execution record sits behind its own mutex; the queue has a separate
//! lock, so admission never waits on an execution.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use stepflow_types::config::EngineConfig;
use stepflow_types::event::EngineEvent;
use stepflow_types::execution::{
    Execution, ExecutionStatus, StepLogLine, StepStatus, TriggerInfo, TriggerType,
};
use stepflow_types::value::{ParamValue, Parameters};
use stepflow_types::workflow::{StepDefinition, WorkflowDefinition};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::execution::ExecutionStore;
use crate::repository::memory::InMemoryStore;

use super::dag::resolve_order;
use super::definition::{validate_definition, validate_executors};
use super::error::{EngineError, ValidationError};
use super::queue::{ExecutionQueue, QueueSnapshot};
use super::runner::{StepContext, StepRun, TaskRunner};
use super::step::{BoxStepExecutor, ExecutorRegistry, StepExecutor};

/// Reason recorded when `cancel_execution` is called without one.
pub const CANCEL_REASON_REQUESTED: &str = "cancelled by request";

/// Reason recorded for executions cancelled by `shutdown`.
pub const CANCEL_REASON_SHUTDOWN: &str = "engine shutdown";

/// Skip reason for steps left Pending by a run that was not cancelled, e.g.
/// after a step task died without reporting.
const UNSETTLED_DEPENDENCY_REASON: &str = "dependency never completed";

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// One execution: its definition snapshot, its record, and its signals.
struct ExecutionSlot {
    id: Uuid,
    workflow_id: String,
    definition: Arc<WorkflowDefinition>,
    record: Mutex<Execution>,
    cancel: CancellationToken,
    /// Flips to `true` once the execution is terminal and nothing touches
    /// the record any more.
    finished: watch::Sender<bool>,
}

impl ExecutionSlot {
    fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }
}

struct EngineInner<S> {
    config: EngineConfig,
    store: S,
    events: EventBus,
    executors: ExecutorRegistry,
    definitions: DashMap<String, Arc<WorkflowDefinition>>,
    executions: DashMap<Uuid, Arc<ExecutionSlot>>,
    queue: ExecutionQueue,
    /// Serializes definition changes against execution creation so an
    /// unregister never races a new execution of the same workflow.
    registry_lock: Mutex<()>,
    started: AtomicBool,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Handle to a workflow engine. Cloning shares the same engine.
///
/// Generic over `S: ExecutionStore` for storage flexibility.
pub struct WorkflowEngine<S: ExecutionStore = InMemoryStore> {
    inner: Arc<EngineInner<S>>,
}

impl<S: ExecutionStore> Clone for WorkflowEngine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl WorkflowEngine<InMemoryStore> {
    /// Engine backed by an in-memory store.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_store(config, InMemoryStore::new())
    }
}

impl<S: ExecutionStore + 'static> WorkflowEngine<S> {
    pub fn with_store(config: EngineConfig, store: S) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self::with_event_bus(config, store, events)
    }

    /// Engine publishing into an existing bus, e.g. one shared with backoff
    /// controllers.
    pub fn with_event_bus(config: EngineConfig, store: S, events: EventBus) -> Self {
        let config = config.normalized();
        let queue = ExecutionQueue::new(config.max_concurrent_executions);
        Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                events,
                executors: ExecutorRegistry::new(),
                definitions: DashMap::new(),
                executions: DashMap::new(),
                queue,
                registry_lock: Mutex::new(()),
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Executors
    // -----------------------------------------------------------------------

    /// Make `executor` available to steps naming `name`.
    pub fn register_executor<T: StepExecutor + 'static>(&self, name: impl Into<String>, executor: T) {
        self.register_boxed_executor(name, BoxStepExecutor::new(executor));
    }

    pub fn register_boxed_executor(&self, name: impl Into<String>, executor: BoxStepExecutor) {
        let name = name.into();
        if self.inner.executors.register(name.clone(), executor).is_some() {
            tracing::debug!(executor = name.as_str(), "step executor replaced");
        }
    }

    pub fn executor_names(&self) -> Vec<String> {
        self.inner.executors.names()
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Validate and register a new definition. Fails if the id is taken.
    pub async fn register_workflow(&self, def: WorkflowDefinition) -> Result<(), EngineError> {
        self.install(def, false).await
    }

    /// Validate and register a definition, replacing any with the same id.
    /// Executions already created keep the definition they started with.
    pub async fn replace_workflow(&self, def: WorkflowDefinition) -> Result<(), EngineError> {
        self.install(def, true).await
    }

    async fn install(&self, def: WorkflowDefinition, replace: bool) -> Result<(), EngineError> {
        if let Err(e) = validate_definition(&def)
            .and_then(|()| validate_executors(&def, &self.inner.executors))
        {
            tracing::warn!(workflow_id = def.id.as_str(), error = %e, "workflow rejected");
            return Err(e.into());
        }

        let _guard = self.inner.registry_lock.lock().await;
        let exists = self.inner.definitions.contains_key(&def.id);
        if exists && !replace {
            return Err(ValidationError::DuplicateWorkflowId(def.id).into());
        }
        self.inner.store.save_definition(&def).await?;

        tracing::info!(
            workflow_id = def.id.as_str(),
            version = def.version.as_str(),
            steps = def.steps.len(),
            replaced = exists,
            "workflow registered"
        );
        self.inner.definitions.insert(def.id.clone(), Arc::new(def));
        Ok(())
    }

    /// Remove a definition. Rejected while any Pending or Running execution
    /// references it.
    pub async fn unregister_workflow(&self, workflow_id: &str) -> Result<(), EngineError> {
        let _guard = self.inner.registry_lock.lock().await;
        if !self.inner.definitions.contains_key(workflow_id) {
            return Err(EngineError::WorkflowNotFound(workflow_id.to_string()));
        }
        let active = self
            .inner
            .executions
            .iter()
            .filter(|slot| slot.workflow_id == workflow_id && !slot.is_finished())
            .count();
        if active > 0 {
            return Err(EngineError::WorkflowInUse {
                workflow_id: workflow_id.to_string(),
                active,
            });
        }

        self.inner.store.delete_definition(workflow_id).await?;
        self.inner.definitions.remove(workflow_id);
        tracing::info!(workflow_id, "workflow unregistered");
        Ok(())
    }

    pub fn get_workflow(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.inner
            .definitions
            .get(workflow_id)
            .map(|d| Arc::clone(d.value()))
    }

    /// Registered definitions, sorted by id.
    pub fn list_workflows(&self) -> Vec<Arc<WorkflowDefinition>> {
        let mut defs: Vec<_> = self
            .inner
            .definitions
            .iter()
            .map(|d| Arc::clone(d.value()))
            .collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        defs
    }

    /// Load definitions from the store into the registry. Definitions that
    /// no longer validate (e.g. their executor is gone) are skipped.
    /// Returns how many were restored.
    pub async fn restore_definitions(&self) -> Result<usize, EngineError> {
        let stored = self.inner.store.load_definitions().await?;
        let _guard = self.inner.registry_lock.lock().await;
        let mut restored = 0;
        for def in stored {
            match validate_definition(&def).and_then(|()| validate_executors(&def, &self.inner.executors)) {
                Ok(()) => {
                    self.inner.definitions.insert(def.id.clone(), Arc::new(def));
                    restored += 1;
                }
                Err(e) => {
                    tracing::warn!(workflow_id = def.id.as_str(), error = %e, "skipping stored workflow");
                }
            }
        }
        tracing::info!(restored, "workflow definitions restored");
        Ok(restored)
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Create a Pending execution and hand it to the scheduler. Steps run
    /// later, once the execution is admitted.
    pub async fn start_execution(
        &self,
        workflow_id: &str,
        inputs: Parameters,
        trigger_type: TriggerType,
        triggered_by: impl Into<String>,
    ) -> Result<Uuid, EngineError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(EngineError::ShutDown);
        }
        for (key, value) in &inputs {
            value
                .validate()
                .map_err(|e| ValidationError::InvalidParameter {
                    step: "inputs".to_string(),
                    reason: format!("'{key}': {e}"),
                })?;
        }

        let guard = self.inner.registry_lock.lock().await;
        let def = self
            .get_workflow(workflow_id)
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;

        let execution = Execution::new(
            def.id.clone(),
            def.version.clone(),
            def.steps.iter().map(|s| s.id.as_str()),
            inputs,
            TriggerInfo {
                trigger_type,
                triggered_by: triggered_by.into(),
                triggered_at: Utc::now(),
            },
        );
        let id = execution.id;
        let (finished, _) = watch::channel(false);
        self.inner.executions.insert(
            id,
            Arc::new(ExecutionSlot {
                id,
                workflow_id: def.id.clone(),
                definition: Arc::clone(&def),
                record: Mutex::new(execution),
                cancel: CancellationToken::new(),
                finished,
            }),
        );
        drop(guard);

        self.inner.events.publish(EngineEvent::ExecutionQueued {
            execution_id: id,
            workflow_id: def.id.clone(),
        });
        self.inner.queue.enqueue(id).await;
        tracing::debug!(execution_id = %id, workflow_id = def.id.as_str(), "execution queued");
        Ok(id)
    }

    /// Read-only snapshot of an execution.
    pub async fn get_execution(&self, id: Uuid) -> Option<Execution> {
        let slot = self.slot(id).ok()?;
        let record = slot.record.lock().await;
        Some(record.clone())
    }

    /// Snapshots of all retained executions, oldest first.
    pub async fn list_executions(&self) -> Vec<Execution> {
        let mut slots: Vec<Arc<ExecutionSlot>> = self
            .inner
            .executions
            .iter()
            .map(|s| Arc::clone(s.value()))
            .collect();
        slots.sort_by_key(|s| s.id);

        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(slot.record.lock().await.clone());
        }
        out
    }

    /// Cancel an execution. Pending executions are removed from the queue
    /// and finish immediately; running ones stop launching steps. Cancelling
    /// a finished execution is a no-op.
    pub async fn cancel_execution(&self, id: Uuid) -> Result<(), EngineError> {
        self.cancel_execution_with_reason(id, CANCEL_REASON_REQUESTED)
            .await
    }

    pub async fn cancel_execution_with_reason(
        &self,
        id: Uuid,
        reason: impl Into<String>,
    ) -> Result<(), EngineError> {
        let slot = self.slot(id)?;
        let reason = reason.into();

        match self.inner.request_cancel(&slot, reason.clone()).await {
            Some(ExecutionStatus::Pending) => {
                self.inner.queue.remove(id).await;
                self.inner.finalize(&slot, &reason).await;
                slot.finished.send_replace(true);
            }
            Some(_) => {
                tracing::info!(execution_id = %id, reason = reason.as_str(), "cancellation requested");
            }
            None => {
                tracing::debug!(execution_id = %id, "execution already finished; nothing to cancel");
            }
        }
        Ok(())
    }

    /// Wait until the execution is terminal and its loop has finished.
    pub async fn wait_for_completion(&self, id: Uuid) -> Result<Execution, EngineError> {
        let slot = self.slot(id)?;
        let mut finished = slot.finished.subscribe();
        finished
            .wait_for(|done| *done)
            .await
            .map(|_| ())
            .map_err(|_| EngineError::ExecutionNotFound(id))?;
        let record = slot.record.lock().await;
        Ok(record.clone())
    }

    /// Drop a finished execution from memory, returning its final snapshot.
    pub async fn purge_execution(&self, id: Uuid) -> Result<Execution, EngineError> {
        let slot = self.slot(id)?;
        if !slot.is_finished() {
            return Err(EngineError::ExecutionNotFinished(id));
        }
        self.inner.executions.remove(&id);
        let record = slot.record.lock().await;
        tracing::debug!(execution_id = %id, "execution purged");
        Ok(record.clone())
    }

    pub async fn queue_snapshot(&self) -> QueueSnapshot {
        self.inner.queue.snapshot().await
    }

    fn slot(&self, id: Uuid) -> Result<Arc<ExecutionSlot>, EngineError> {
        self.inner
            .executions
            .get(&id)
            .map(|s| Arc::clone(s.value()))
            .ok_or(EngineError::ExecutionNotFound(id))
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Spawn the admission loop. Must be called from within a tokio runtime.
    pub async fn start(&self) -> Result<(), EngineError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(EngineError::ShutDown);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted);
        }
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(admission_loop(inner));
        Ok(())
    }

    /// Stop admitting, cancel every unfinished execution, and wait for all
    /// driving loops to settle.
    pub async fn shutdown(&self) {
        tracing::info!("engine shutting down");
        self.inner.shutdown.cancel();

        let unfinished: Vec<Uuid> = self
            .inner
            .executions
            .iter()
            .filter(|s| !s.is_finished())
            .map(|s| s.id)
            .collect();
        for id in unfinished {
            match self
                .cancel_execution_with_reason(id, CANCEL_REASON_SHUTDOWN)
                .await
            {
                Ok(()) => {}
                // Purged concurrently.
                Err(EngineError::ExecutionNotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(execution_id = %id, error = %e, "failed to cancel execution on shutdown");
                }
            }
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        tracing::info!("engine stopped");
    }
}

// ---------------------------------------------------------------------------
// Admission loop
// ---------------------------------------------------------------------------

async fn admission_loop<S: ExecutionStore + 'static>(inner: Arc<EngineInner<S>>) {
    let poll = Duration::from_millis(inner.config.poll_interval_ms);
    tracing::info!(
        max_concurrent = inner.config.max_concurrent_executions,
        "admission loop started"
    );

    loop {
        while let Some(id) = inner.queue.try_admit().await {
            tracing::debug!(execution_id = %id, "execution admitted");
            let task_inner = Arc::clone(&inner);
            inner.tracker.spawn(task_inner.run_admitted(id));
        }

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.queue.changed() => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }

    tracing::info!("admission loop stopped");
}

// ---------------------------------------------------------------------------
// Driving loop
// ---------------------------------------------------------------------------

impl<S: ExecutionStore + 'static> EngineInner<S> {
    /// Drive an admitted execution, then free its slot.
    async fn run_admitted(self: Arc<Self>, id: Uuid) {
        let slot = self.executions.get(&id).map(|s| Arc::clone(s.value()));
        let mut drove = None;
        if let Some(slot) = slot {
            if self.drive(&slot).await {
                drove = Some(slot);
            }
        }
        self.queue.release(id).await;
        if let Some(slot) = drove {
            slot.finished.send_replace(true);
        }
    }

    /// Returns `false` if the execution was no longer Pending when admitted.
    async fn drive(&self, slot: &ExecutionSlot) -> bool {
        {
            let mut record = slot.record.lock().await;
            if record.status != ExecutionStatus::Pending {
                tracing::debug!(
                    execution_id = %slot.id,
                    status = %record.status,
                    "admitted execution is no longer pending"
                );
                return false;
            }
            record.status = ExecutionStatus::Running;
            record.started_at = Some(Utc::now());
        }

        let def = Arc::clone(&slot.definition);
        tracing::info!(
            execution_id = %slot.id,
            workflow_id = def.id.as_str(),
            steps = def.steps.len(),
            "starting workflow execution"
        );
        self.events.publish(EngineEvent::ExecutionStarted {
            execution_id: slot.id,
            workflow_id: def.id.clone(),
        });

        let not_started = match resolve_order(&def.steps) {
            Ok(order) => {
                self.run_steps(slot, &def, &order).await;
                UNSETTLED_DEPENDENCY_REASON.to_string()
            }
            Err(e) => {
                let msg = format!("could not resolve step order: {e}");
                slot.record.lock().await.error = Some(msg.clone());
                msg
            }
        };

        self.finalize(slot, &not_started).await;
        true
    }

    async fn run_steps(&self, slot: &ExecutionSlot, def: &WorkflowDefinition, order: &[String]) {
        let mut pending: Vec<&StepDefinition> = order.iter().filter_map(|id| def.step(id)).collect();
        let mut in_flight: JoinSet<(String, StepRun)> = JoinSet::new();
        let deadline = def
            .max_execution_time_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let mut deadline_hit = false;

        loop {
            if let Some(at) = deadline {
                if !deadline_hit && Instant::now() >= at {
                    deadline_hit = true;
                    self.cancel_for_time_limit(slot, def).await;
                }
            }
            if !slot.cancel.is_cancelled() {
                self.launch_ready(slot, def, &mut pending, &mut in_flight)
                    .await;
            }
            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                joined = in_flight.join_next() => match joined {
                    Some(Ok((step_id, run))) => self.record_step(slot, &step_id, run).await,
                    Some(Err(e)) => {
                        tracing::error!(execution_id = %slot.id, error = %e, "step task did not complete");
                    }
                    None => {}
                },
                _ = slot.cancel.cancelled(), if !slot.cancel.is_cancelled() => {
                    tracing::info!(
                        execution_id = %slot.id,
                        in_flight = in_flight.len(),
                        "cancellation observed; no further steps will launch"
                    );
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() && !deadline_hit => {
                    deadline_hit = true;
                    self.cancel_for_time_limit(slot, def).await;
                }
            }
        }
    }

    async fn cancel_for_time_limit(&self, slot: &ExecutionSlot, def: &WorkflowDefinition) {
        let limit = def.max_execution_time_ms.unwrap_or_default();
        let reason = format!("max execution time of {limit}ms exceeded");
        tracing::warn!(execution_id = %slot.id, limit_ms = limit, "execution time limit exceeded");
        self.request_cancel(slot, reason).await;
    }

    /// One pass over the not-yet-started steps in resolved order: skip those
    /// with a failed or skipped dependency, launch those whose dependencies
    /// all completed while capacity remains. Launches nothing once the
    /// execution is cancelled.
    async fn launch_ready<'d>(
        &self,
        slot: &ExecutionSlot,
        def: &WorkflowDefinition,
        pending: &mut Vec<&'d StepDefinition>,
        in_flight: &mut JoinSet<(String, StepRun)>,
    ) {
        let mut guard = slot.record.lock().await;
        let record = &mut *guard;
        // `request_cancel` flips the status before it fires the token.
        if record.status == ExecutionStatus::Cancelled || slot.cancel.is_cancelled() {
            return;
        }
        let mut i = 0;

        while i < pending.len() {
            let step = pending[i];

            let mut blocked = None;
            let mut waiting = false;
            for dep in &step.depends_on {
                match record.steps.status(dep) {
                    Some(status) if status.blocks_dependents() => {
                        blocked = Some((dep.as_str(), status));
                        break;
                    }
                    Some(StepStatus::Completed) => {}
                    _ => waiting = true,
                }
            }

            if let Some((dep, status)) = blocked {
                pending.remove(i);
                let reason = format!("dependency '{dep}' {status}");
                if let Some(entry) = record.steps.get_mut(&step.id) {
                    entry.status = StepStatus::Skipped;
                    entry.completed_at = Some(Utc::now());
                    entry.log(format!("skipped: {reason}"));
                    record.metrics.record(entry);
                }
                tracing::debug!(
                    execution_id = %slot.id,
                    step_id = step.id.as_str(),
                    reason = reason.as_str(),
                    "step skipped"
                );
                self.events.publish(EngineEvent::StepSkipped {
                    execution_id: slot.id,
                    step_id: step.id.clone(),
                    reason,
                });
                continue;
            }
            if waiting {
                i += 1;
                continue;
            }
            if in_flight.len() >= self.config.max_parallel_steps {
                break;
            }
            pending.remove(i);

            let dependency_results: BTreeMap<String, ParamValue> = step
                .depends_on
                .iter()
                .filter_map(|d| {
                    let result = record.steps.get(d)?.result.clone()?;
                    Some((d.clone(), result))
                })
                .collect();
            let inputs = record.inputs.clone();

            let Some(entry) = record.steps.get_mut(&step.id) else {
                continue;
            };
            let Some(executor) = self.executors.get(&step.executor) else {
                let error = format!("executor '{}' is not registered", step.executor);
                entry.status = StepStatus::Failed;
                entry.completed_at = Some(Utc::now());
                entry.error = Some(error.clone());
                entry.log(error.clone());
                record.metrics.record(entry);
                tracing::warn!(execution_id = %slot.id, step_id = step.id.as_str(), "{error}");
                self.events.publish(EngineEvent::StepFailed {
                    execution_id: slot.id,
                    step_id: step.id.clone(),
                    duration_ms: 0,
                    attempts: 0,
                    error,
                });
                continue;
            };

            entry.status = StepStatus::Running;
            entry.started_at = Some(Utc::now());
            tracing::debug!(
                execution_id = %slot.id,
                step_id = step.id.as_str(),
                executor = step.executor.as_str(),
                "launching step"
            );

            let ctx = StepContext {
                execution_id: slot.id,
                workflow_id: def.id.clone(),
                inputs,
                dependency_results,
                cancel: slot.cancel.clone(),
                events: self.events.clone(),
            };
            let policy = def
                .effective_retry(step, &self.config.default_retry)
                .clone();
            let timeout = Duration::from_millis(
                step.timeout_ms
                    .unwrap_or(self.config.default_step_timeout_ms),
            );
            let step_def = step.clone();
            in_flight.spawn(async move {
                let run = TaskRunner::run_step(&step_def, &executor, &policy, timeout, &ctx).await;
                (step_def.id, run)
            });
        }
    }

    /// Fold a finished step run into the record and emit its event.
    async fn record_step(&self, slot: &ExecutionSlot, step_id: &str, run: StepRun) {
        let mut guard = slot.record.lock().await;
        let record = &mut *guard;
        let Some(entry) = record.steps.get_mut(step_id) else {
            return;
        };
        entry.status = run.status;
        entry.attempts = run.attempts;
        entry.result = run.result;
        entry.error = run.error.clone();
        entry.completed_at = Some(run.completed_at);
        entry.duration_ms = Some(run.duration_ms);
        entry.logs.extend(run.logs);
        record.metrics.record(entry);

        match run.status {
            StepStatus::Completed => {
                tracing::debug!(
                    execution_id = %slot.id,
                    step_id,
                    attempts = run.attempts,
                    duration_ms = run.duration_ms,
                    "step completed"
                );
                self.events.publish(EngineEvent::StepCompleted {
                    execution_id: slot.id,
                    step_id: step_id.to_string(),
                    duration_ms: run.duration_ms,
                    attempts: run.attempts,
                });
            }
            _ => {
                let error = run.error.unwrap_or_default();
                tracing::warn!(
                    execution_id = %slot.id,
                    step_id,
                    attempts = run.attempts,
                    error = error.as_str(),
                    "step failed"
                );
                self.events.publish(EngineEvent::StepFailed {
                    execution_id: slot.id,
                    step_id: step_id.to_string(),
                    duration_ms: run.duration_ms,
                    attempts: run.attempts,
                    error,
                });
            }
        }
    }

    /// Mark the execution Cancelled and fire its token. Returns the status it
    /// had before, or `None` if it was already terminal.
    async fn request_cancel(&self, slot: &ExecutionSlot, reason: String) -> Option<ExecutionStatus> {
        let mut record = slot.record.lock().await;
        if record.status.is_terminal() {
            return None;
        }
        let previous = record.status;
        record.status = ExecutionStatus::Cancelled;
        record.cancel_reason = Some(reason);
        drop(record);
        slot.cancel.cancel();
        Some(previous)
    }

    /// Settle leftover steps, compute the final status, persist, and emit
    /// the terminal event.
    async fn finalize(&self, slot: &ExecutionSlot, default_reason: &str) {
        let snapshot = {
            let mut guard = slot.record.lock().await;
            let record = &mut *guard;
            let reason = record
                .cancel_reason
                .clone()
                .unwrap_or_else(|| default_reason.to_string());
            let now = Utc::now();

            for entry in record.steps.iter_mut() {
                match entry.status {
                    StepStatus::Pending => {
                        entry.status = StepStatus::Skipped;
                        entry.completed_at = Some(now);
                        entry.logs.push(StepLogLine::now(format!("not started: {reason}")));
                        self.events.publish(EngineEvent::StepSkipped {
                            execution_id: slot.id,
                            step_id: entry.step_id.clone(),
                            reason: format!("not started: {reason}"),
                        });
                    }
                    StepStatus::Running => {
                        entry.status = StepStatus::Failed;
                        entry.completed_at = Some(now);
                        entry.error = Some("step task ended without a result".to_string());
                    }
                    _ => continue,
                }
                record.metrics.record(entry);
            }

            if record.status != ExecutionStatus::Cancelled {
                let failed: Vec<&str> = record
                    .steps
                    .iter()
                    .filter(|s| s.status == StepStatus::Failed)
                    .map(|s| s.step_id.as_str())
                    .collect();
                if failed.is_empty() && record.error.is_none() {
                    record.status = ExecutionStatus::Completed;
                } else {
                    if record.error.is_none() {
                        record.error =
                            Some(format!("{} step(s) failed: {}", failed.len(), failed.join(", ")));
                    }
                    record.status = ExecutionStatus::Failed;
                }
            }
            record.completed_at = Some(now);
            record.clone()
        };

        let duration_ms = snapshot.duration_ms().unwrap_or(0);
        let event = match snapshot.status {
            ExecutionStatus::Completed => EngineEvent::ExecutionCompleted {
                execution_id: slot.id,
                workflow_id: snapshot.workflow_id.clone(),
                duration_ms,
                completed_steps: snapshot.metrics.completed_steps,
            },
            ExecutionStatus::Failed => EngineEvent::ExecutionFailed {
                execution_id: slot.id,
                workflow_id: snapshot.workflow_id.clone(),
                duration_ms,
                error: snapshot.error.clone().unwrap_or_default(),
            },
            _ => EngineEvent::ExecutionCancelled {
                execution_id: slot.id,
                workflow_id: snapshot.workflow_id.clone(),
                duration_ms,
                reason: snapshot.cancel_reason.clone().unwrap_or_default(),
            },
        };
        tracing::info!(
            execution_id = %slot.id,
            workflow_id = snapshot.workflow_id.as_str(),
            status = %snapshot.status,
            duration_ms,
            completed = snapshot.metrics.completed_steps,
            failed = snapshot.metrics.failed_steps,
            skipped = snapshot.metrics.skipped_steps,
            "workflow execution finished"
        );

        if let Err(e) = self.store.save_execution(&snapshot).await {
            tracing::warn!(execution_id = %slot.id, error = %e, "failed to persist execution snapshot");
        }
        self.events.publish(event);
    }
}
