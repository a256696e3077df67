//! Shared handle to one in-flight execution
//!
//! The handle is the only path through which an execution is mutated. Every
//! change is replicated to `workflow:{id}` in the region's replica and
//! published on a watch channel so status queries and waiters see it at once.

use super::lifecycle::LifecycleMachine;
use super::persistence::AuditLog;
use crate::distributed::{keys, DistributedState, Dot};
use crate::error::TransitionRejection;
use crate::models::workflow::{AuditEntry, AuditKind, WorkflowEvent, WorkflowExecution, WorkflowState};
use crate::state_machine::TransitionOutcome;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use uuid::Uuid;

/// Published on every change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub state: WorkflowState,
    pub settled: bool,
}

pub struct ExecutionHandle {
    id: Uuid,
    region: String,
    machine: Arc<LifecycleMachine>,
    execution: Mutex<WorkflowExecution>,
    progress: watch::Sender<Progress>,
    abandoned: watch::Sender<bool>,
    detached: AtomicBool,
    replica: Arc<DistributedState>,
    audit: Arc<AuditLog>,
}

impl ExecutionHandle {
    pub fn new(
        execution: WorkflowExecution,
        machine: Arc<LifecycleMachine>,
        replica: Arc<DistributedState>,
        audit: Arc<AuditLog>,
    ) -> Self {
        let progress = Progress {
            state: execution.state,
            settled: execution.is_settled(),
        };
        let (progress, _) = watch::channel(progress);
        let (abandoned, _) = watch::channel(false);
        Self {
            id: execution.id,
            region: execution.region.clone(),
            machine,
            execution: Mutex::new(execution),
            progress,
            abandoned,
            detached: AtomicBool::new(false),
            replica,
            audit,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn lock(&self) -> MutexGuard<'_, WorkflowExecution> {
        self.execution.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> WorkflowExecution {
        self.lock().clone()
    }

    pub fn state(&self) -> WorkflowState {
        self.progress.borrow().state
    }

    pub fn is_settled(&self) -> bool {
        self.progress.borrow().settled
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    /// Flips to true when this region lost ownership
    pub fn abandoned(&self) -> watch::Receiver<bool> {
        self.abandoned.subscribe()
    }

    /// Stop replicating and tell the executor to walk away.
    /// Called when the lease is lost or the engine shuts down.
    pub fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
        self.abandoned.send_replace(true);
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Called with the execution lock held so replicas never see an older snapshot win
    fn publish(&self, execution: &WorkflowExecution) -> Option<Dot> {
        self.progress.send_replace(Progress {
            state: execution.state,
            settled: execution.is_settled(),
        });
        if self.is_detached() {
            return None;
        }
        match self.replica.write_json(&keys::workflow(&self.id), execution) {
            Ok(dot) => Some(dot),
            Err(e) => {
                tracing::error!(workflow_id = %self.id, error = %e, "Failed to replicate execution");
                None
            }
        }
    }

    /// Replicate the current snapshot without changing it
    pub fn persist(&self) -> Option<Dot> {
        let execution = self.lock();
        self.publish(&execution)
    }

    /// Mutate the execution (never its lifecycle state) and replicate
    pub fn update<R>(&self, f: impl FnOnce(&mut WorkflowExecution) -> R) -> R {
        let mut execution = self.lock();
        let result = f(&mut execution);
        execution.updated_at = chrono::Utc::now();
        self.publish(&execution);
        result
    }

    pub fn fire(&self, event: WorkflowEvent) -> Result<TransitionOutcome<WorkflowState>, TransitionRejection> {
        self.fire_with(event, |_| {})
    }

    /// Fire a lifecycle event and, if accepted, apply `after` under the same lock
    pub fn fire_with(
        &self,
        event: WorkflowEvent,
        after: impl FnOnce(&mut WorkflowExecution),
    ) -> Result<TransitionOutcome<WorkflowState>, TransitionRejection> {
        let mut execution = self.lock();
        let outcome = execution.apply_event(&self.machine, event)?;
        after(&mut execution);
        self.after_transition(event, &outcome);
        self.publish(&execution);
        Ok(outcome)
    }

    /// Apply `before`, then fire `event`, publishing once.
    /// Changes made by `before` stick even when the event is rejected.
    pub fn update_then_fire(
        &self,
        before: impl FnOnce(&mut WorkflowExecution),
        event: WorkflowEvent,
    ) -> Result<TransitionOutcome<WorkflowState>, TransitionRejection> {
        let mut execution = self.lock();
        before(&mut execution);
        execution.updated_at = chrono::Utc::now();
        let result = execution.apply_event(&self.machine, event);
        if let Ok(outcome) = &result {
            self.after_transition(event, outcome);
        }
        self.publish(&execution);
        result
    }

    fn after_transition(&self, event: WorkflowEvent, outcome: &TransitionOutcome<WorkflowState>) {
        tracing::debug!(
            workflow_id = %self.id,
            region = %self.region,
            from = %outcome.from,
            to = %outcome.to,
            "Workflow transition"
        );
        self.record(
            AuditKind::Transition,
            json!({ "from": outcome.from, "to": outcome.to, "event": event }),
        );
        if let Some(error) = &outcome.action_error {
            self.record(
                AuditKind::ActionFailed,
                json!({ "from": outcome.from, "to": outcome.to, "error": error }),
            );
        }
    }

    /// Append an audit entry for this workflow
    pub fn record(&self, kind: AuditKind, detail: serde_json::Value) {
        self.audit
            .record(AuditEntry::new(Some(self.id), self.region.clone(), kind, detail));
    }
}

/// Read a replicated execution snapshot
pub fn load_snapshot(replica: &DistributedState, id: &Uuid) -> Option<(WorkflowExecution, Dot)> {
    match replica.read_as::<WorkflowExecution>(&keys::workflow(id)) {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!(workflow_id = %id, error = %e, "Unreadable execution snapshot");
            None
        }
    }
}
