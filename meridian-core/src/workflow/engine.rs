//! Step execution engine
//!
//! Drives one execution from QUEUED to a settled state. Ready steps (pending,
//! every dependency done) are dispatched as tasks bounded by the workflow's
//! concurrency limit and the region-wide worker pool; each task reports back
//! over an mpsc channel. A failure stops scheduling, drains in-flight steps and
//! compensates completed steps in reverse dependency order.

use super::actions::{ActionRegistry, ActionRequest};
use super::handle::{ExecutionHandle, Progress};
use super::validator::WorkflowValidator;
use crate::error::{ActionError, ActionResult};
use crate::models::workflow::{
    AuditKind, ErrorRecord, ErrorStage, RetryPolicy, RollbackOutcome, StepStatus,
    WorkflowDefinition, WorkflowEvent, WorkflowExecution, WorkflowState, WorkflowStep,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;

/// Completion report from a step task
#[derive(Debug)]
struct StepEvent {
    step_id: String,
    attempts: u32,
    result: ActionResult<Value>,
}

/// Executes workflow steps for one region
pub struct WorkflowExecutor {
    actions: Arc<ActionRegistry>,
    workers: Arc<Semaphore>,
    default_concurrency: usize,
    default_timeout: Duration,
}

impl WorkflowExecutor {
    pub fn new(
        actions: Arc<ActionRegistry>,
        workers: Arc<Semaphore>,
        default_concurrency: usize,
        default_timeout: Duration,
    ) -> Self {
        Self {
            actions,
            workers,
            default_concurrency: default_concurrency.max(1),
            default_timeout,
        }
    }

    pub fn actions(&self) -> &Arc<ActionRegistry> {
        &self.actions
    }

    /// Run the execution until it settles or this region loses ownership.
    /// Returns the state it stopped in.
    pub async fn run(&self, handle: Arc<ExecutionHandle>) -> WorkflowState {
        if handle.state() == WorkflowState::Created {
            try_fire(&handle, WorkflowEvent::Enqueue);
        }
        if handle.state() == WorkflowState::Queued {
            try_fire(&handle, WorkflowEvent::Start);
        }

        // A previous owner may have died with steps in flight; their effects are
        // unknown so they run again. Done steps are never re-executed.
        handle.update(|exec| {
            for record in exec.steps.values_mut() {
                if record.status == StepStatus::Running {
                    record.status = StepStatus::Pending;
                    record.started_at = None;
                }
            }
        });

        let definition = handle.snapshot().definition;
        let order = WorkflowValidator::topological_order(&definition)
            .unwrap_or_else(|| definition.steps.iter().map(|s| s.id.clone()).collect());

        let mut run = Run {
            executor: self,
            handle: Arc::clone(&handle),
            definition,
            order,
            in_flight: HashMap::new(),
            abandoned: handle.abandoned(),
        };
        let state = run.drive().await;
        tracing::info!(
            workflow_id = %handle.id(),
            region = %handle.region(),
            state = %state,
            "Workflow executor stopped"
        );
        state
    }
}

fn try_fire(handle: &ExecutionHandle, event: WorkflowEvent) -> bool {
    match handle.fire(event) {
        Ok(_) => true,
        Err(rejection) => {
            tracing::debug!(workflow_id = %handle.id(), %rejection, "Lifecycle event ignored");
            false
        }
    }
}

/// Mutable state of one executor run
struct Run<'a> {
    executor: &'a WorkflowExecutor,
    handle: Arc<ExecutionHandle>,
    definition: WorkflowDefinition,
    order: Vec<String>,
    in_flight: HashMap<String, JoinHandle<()>>,
    abandoned: watch::Receiver<bool>,
}

impl Run<'_> {
    fn limit(&self) -> usize {
        self.definition
            .max_concurrency
            .unwrap_or(self.executor.default_concurrency)
            .max(1)
    }

    fn is_abandoned(&self) -> bool {
        *self.abandoned.borrow()
    }

    fn abort_all(&mut self) {
        for (_, task) in self.in_flight.drain() {
            task.abort();
        }
    }

    async fn drive(&mut self) -> WorkflowState {
        let (tx, mut rx) = mpsc::channel::<StepEvent>(self.definition.steps.len().max(1));
        let mut progress = self.handle.subscribe();

        loop {
            if self.is_abandoned() {
                self.abort_all();
                return self.handle.state();
            }

            let exec = self.handle.snapshot();
            match exec.state {
                WorkflowState::Completed | WorkflowState::RolledBack => return exec.state,
                WorkflowState::Cancelled => {
                    if !exec.is_settled() {
                        self.settle_cancelled(&mut rx).await;
                    }
                    return self.handle.state();
                }
                WorkflowState::Failed => {
                    if !exec.is_settled() {
                        self.drain(&mut rx, &mut progress).await;
                        if self.handle.state() == WorkflowState::Cancelled {
                            self.settle_cancelled(&mut rx).await;
                        } else {
                            self.settle_failed().await;
                        }
                    }
                    return self.handle.state();
                }
                WorkflowState::Running => {
                    if self.in_flight.is_empty() && exec.all_steps_done() {
                        if try_fire(&self.handle, WorkflowEvent::Complete) {
                            return WorkflowState::Completed;
                        }
                    }
                    let dispatched = self.dispatch_ready(&exec, &tx);
                    if dispatched == 0 && self.in_flight.is_empty() && !exec.all_steps_done() {
                        self.fail(None, "no runnable steps remain".to_string());
                        continue;
                    }
                }
                WorkflowState::Created | WorkflowState::Queued | WorkflowState::Paused => {}
            }

            tokio::select! {
                Some(event) = rx.recv() => self.on_step_event(event),
                changed = progress.changed() => {
                    if changed.is_err() {
                        return self.handle.state();
                    }
                }
                _ = self.abandoned.changed() => {}
            }
        }
    }

    /// Start ready steps up to the concurrency limit; returns how many started
    fn dispatch_ready(&mut self, exec: &WorkflowExecution, tx: &mpsc::Sender<StepEvent>) -> usize {
        let capacity = self.limit().saturating_sub(self.in_flight.len());
        let ready: Vec<WorkflowStep> = self
            .definition
            .steps
            .iter()
            .filter(|s| !self.in_flight.contains_key(&s.id))
            .filter(|s| exec.step_status(&s.id) == Some(StepStatus::Pending))
            .filter(|s| {
                s.depends_on
                    .iter()
                    .all(|d| exec.step_status(d) == Some(StepStatus::Done))
            })
            .take(capacity)
            .cloned()
            .collect();

        for step in &ready {
            self.handle.update(|exec| {
                if let Some(record) = exec.steps.get_mut(&step.id) {
                    record.status = StepStatus::Running;
                    record.started_at = Some(Utc::now());
                }
            });
            self.handle
                .record(AuditKind::StepStarted, json!({ "step_id": step.id, "action": step.action }));
            tracing::debug!(workflow_id = %self.handle.id(), step_id = %step.id, "Step dispatched");

            let request = ActionRequest {
                kind: step.action,
                params: resolve_params(&step.params, &exec.params),
                workflow_id: self.handle.id(),
                step_id: step.id.clone(),
                attempt: 1,
                compensation: false,
                region: self.handle.region().to_string(),
            };
            let policy = step.retry_policy.clone().unwrap_or_default();
            let timeout = self.step_timeout(step);
            let actions = Arc::clone(&self.executor.actions);
            let workers = Arc::clone(&self.executor.workers);
            let handle = Arc::clone(&self.handle);
            let tx = tx.clone();
            let step_id = step.id.clone();

            let task = tokio::spawn(async move {
                let (result, attempts) =
                    execute_with_retry(&actions, &workers, &handle, request, &policy, timeout).await;
                let _ = tx
                    .send(StepEvent {
                        step_id,
                        attempts,
                        result,
                    })
                    .await;
            });
            self.in_flight.insert(step.id.clone(), task);
        }
        ready.len()
    }

    fn step_timeout(&self, step: &WorkflowStep) -> Duration {
        step.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.executor.default_timeout)
    }

    fn on_step_event(&mut self, event: StepEvent) {
        self.in_flight.remove(&event.step_id);
        let step_id = event.step_id;

        match event.result {
            Ok(output) => {
                self.handle.update(|exec| {
                    if let Some(record) = exec.steps.get_mut(&step_id) {
                        record.status = StepStatus::Done;
                        record.attempts = event.attempts;
                        record.ended_at = Some(Utc::now());
                        record.output = Some(output);
                    }
                });
                self.handle.record(
                    AuditKind::StepSucceeded,
                    json!({ "step_id": step_id, "attempts": event.attempts }),
                );
            }
            Err(error) => {
                let cause = error.to_string();
                self.handle.update(|exec| {
                    if let Some(record) = exec.steps.get_mut(&step_id) {
                        record.status = StepStatus::Failed;
                        record.attempts = event.attempts;
                        record.ended_at = Some(Utc::now());
                        record.error = Some(cause.clone());
                    }
                });
                self.handle.record(
                    AuditKind::StepFailed,
                    json!({ "step_id": step_id, "attempts": event.attempts, "error": cause }),
                );
                tracing::warn!(
                    workflow_id = %self.handle.id(),
                    step_id = %step_id,
                    attempts = event.attempts,
                    error = %cause,
                    "Step failed"
                );
                self.fail(Some(step_id), cause);
            }
        }
    }

    /// Move to FAILED unless the workflow already left the running states
    fn fail(&self, step_id: Option<String>, cause: String) {
        let error = ErrorRecord {
            stage: ErrorStage::Step,
            step_id,
            cause,
            rollback: None,
        };
        if let Err(rejection) = self.handle.fire_with(WorkflowEvent::Fail, |exec| exec.error = Some(error)) {
            tracing::debug!(workflow_id = %self.handle.id(), %rejection, "Failure not recorded as a transition");
        }
    }

    /// Wait for every in-flight step to report. Stops early on cancel.
    async fn drain(&mut self, rx: &mut mpsc::Receiver<StepEvent>, progress: &mut watch::Receiver<Progress>) {
        while !self.in_flight.is_empty() {
            tokio::select! {
                Some(event) = rx.recv() => self.on_step_event(event),
                changed = progress.changed() => {
                    if changed.is_err() || self.handle.state() == WorkflowState::Cancelled {
                        return;
                    }
                }
                _ = self.abandoned.changed() => {
                    if self.is_abandoned() {
                        self.abort_all();
                        return;
                    }
                }
            }
        }
    }

    async fn settle_failed(&mut self) {
        let Some(outcome) = self.compensate().await else {
            return;
        };
        let partial = matches!(outcome, RollbackOutcome::Partial { .. });
        let result = self.handle.update_then_fire(
            |exec| {
                let error = exec.error.get_or_insert_with(|| ErrorRecord {
                    stage: ErrorStage::Step,
                    step_id: None,
                    cause: "unknown failure".to_string(),
                    rollback: None,
                });
                error.rollback = Some(outcome);
                exec.partial_rollback = partial;
            },
            WorkflowEvent::RollbackFinished,
        );
        match result {
            Ok(_) => {}
            // Cancelled while compensating: the recorded outcome settles it
            Err(_) if self.handle.state() == WorkflowState::Cancelled => {
                tracing::info!(workflow_id = %self.handle.id(), "Workflow cancelled during rollback");
            }
            Err(_) => {
                tracing::warn!(workflow_id = %self.handle.id(), "Rollback incomplete, workflow stays failed")
            }
        }
    }

    async fn settle_cancelled(&mut self, rx: &mut mpsc::Receiver<StepEvent>) {
        // Results that already arrived count; everything else is interrupted
        while let Ok(event) = rx.try_recv() {
            self.on_step_event(event);
        }
        let interrupted: Vec<String> = self.in_flight.keys().cloned().collect();
        self.abort_all();
        if !interrupted.is_empty() {
            self.handle.update(|exec| {
                for id in &interrupted {
                    if let Some(record) = exec.steps.get_mut(id) {
                        record.status = StepStatus::Interrupted;
                        record.ended_at = Some(Utc::now());
                    }
                }
            });
            for id in &interrupted {
                self.handle.record(AuditKind::StepInterrupted, json!({ "step_id": id }));
            }
        }

        let Some(outcome) = self.compensate().await else {
            return;
        };
        let partial = matches!(outcome, RollbackOutcome::Partial { .. });
        self.handle.update(|exec| {
            match exec.error.as_mut() {
                // A step failure that preceded the cancel keeps its cause
                Some(error) => error.rollback = Some(outcome),
                None => {
                    exec.error = Some(ErrorRecord {
                        stage: ErrorStage::Cancellation,
                        step_id: None,
                        cause: "cancelled".to_string(),
                        rollback: Some(outcome),
                    })
                }
            }
            exec.partial_rollback = partial;
        });
    }

    /// Run compensations for done and interrupted steps in reverse dependency
    /// order. Returns `None` if ownership was lost part way.
    async fn compensate(&mut self) -> Option<RollbackOutcome> {
        let exec = self.handle.snapshot();
        let targets: Vec<WorkflowStep> = self
            .order
            .iter()
            .rev()
            .filter_map(|id| self.definition.step(id))
            .filter(|s| s.compensation.is_some())
            .filter(|s| {
                matches!(
                    exec.step_status(&s.id),
                    Some(StepStatus::Done) | Some(StepStatus::Interrupted)
                )
            })
            .cloned()
            .collect();

        if targets.is_empty() {
            return Some(RollbackOutcome::NotRequired);
        }

        let mut failed_steps = Vec::new();
        for step in targets {
            if self.is_abandoned() {
                return None;
            }
            let Some(compensation) = &step.compensation else {
                continue;
            };
            let request = ActionRequest {
                kind: compensation.action,
                params: resolve_params(&compensation.params, &exec.params),
                workflow_id: self.handle.id(),
                step_id: step.id.clone(),
                attempt: 1,
                compensation: true,
                region: self.handle.region().to_string(),
            };
            let policy = step.retry_policy.clone().unwrap_or_default();
            let (result, attempts) = execute_with_retry(
                &self.executor.actions,
                &self.executor.workers,
                &self.handle,
                request,
                &policy,
                self.step_timeout(&step),
            )
            .await;

            match result {
                Ok(_) => {
                    self.handle.update(|exec| {
                        if let Some(record) = exec.steps.get_mut(&step.id) {
                            record.status = StepStatus::Compensated;
                        }
                    });
                    self.handle.record(
                        AuditKind::Compensated,
                        json!({ "step_id": step.id, "attempts": attempts }),
                    );
                }
                Err(error) => {
                    let cause = error.to_string();
                    tracing::warn!(
                        workflow_id = %self.handle.id(),
                        step_id = %step.id,
                        error = %cause,
                        "Compensation failed"
                    );
                    self.handle.update(|exec| {
                        if let Some(record) = exec.steps.get_mut(&step.id) {
                            record.status = StepStatus::RollbackFailed;
                            record.compensation_error = Some(cause.clone());
                        }
                    });
                    self.handle.record(
                        AuditKind::CompensationFailed,
                        json!({ "step_id": step.id, "error": cause }),
                    );
                    failed_steps.push(step.id.clone());
                }
            }
        }

        Some(if failed_steps.is_empty() {
            RollbackOutcome::Complete
        } else {
            RollbackOutcome::Partial { failed_steps }
        })
    }
}

/// Run an action under the retry policy. Only transient errors are retried.
async fn execute_with_retry(
    actions: &ActionRegistry,
    workers: &Arc<Semaphore>,
    handle: &ExecutionHandle,
    mut request: ActionRequest,
    policy: &RetryPolicy,
    timeout: Duration,
) -> (ActionResult<Value>, u32) {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        request.attempt = attempt;
        let result = match Arc::clone(workers).acquire_owned().await {
            Ok(_permit) => actions.execute(&request, timeout).await,
            Err(_) => Err(ActionError::Permanent("worker pool closed".to_string())),
        };

        match result {
            Err(error) if error.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt - 1);
                tracing::info!(
                    workflow_id = %request.workflow_id,
                    step_id = %request.step_id,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying step"
                );
                handle.record(
                    AuditKind::StepRetried,
                    json!({
                        "step_id": request.step_id,
                        "attempt": attempt,
                        "compensation": request.compensation,
                        "error": error.to_string(),
                    }),
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return (other, attempt),
        }
    }
}

/// Substitute `"{{path.to.value}}"` strings with values from the workflow params
pub fn resolve_params(template: &Value, params: &Value) -> Value {
    match template {
        Value::String(s) => {
            let trimmed = s.trim();
            match trimmed
                .strip_prefix("{{")
                .and_then(|rest| rest.strip_suffix("}}"))
            {
                Some(path) => lookup(params, path.trim()).cloned().unwrap_or_else(|| template.clone()),
                None => template.clone(),
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_params(v, params)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_params(v, params)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
