//! Workflow orchestration and lifecycle management
//!
//! The [`OrchestrationEngine`] is a region's single entry point for workflow
//! submission. It takes the execution lease, records the execution as CREATED
//! then QUEUED, and hands it to a scheduling loop that spawns one executor per
//! workflow. Settled executions are archived and their lease released.

use super::engine::WorkflowExecutor;
use super::handle::{load_snapshot, ExecutionHandle};
use super::lifecycle::{workflow_lifecycle, LifecycleMachine};
use super::persistence::AuditLog;
use super::validator::WorkflowValidator;
use crate::context::RegionContext;
use crate::distributed::{DistributedState, LeaseManager};
use crate::error::{LeaseError, OrchestrationError, OrchestrationResult, TransitionRejection};
use crate::models::region::RegionMetrics;
use crate::models::workflow::{
    AuditEntry, AuditKind, WorkflowDefinition, WorkflowEvent, WorkflowExecution, WorkflowState,
};
use dashmap::{DashMap, DashSet};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Region-local workflow orchestrator
pub struct OrchestrationEngine {
    region: String,
    capacity: u32,
    machine: Arc<LifecycleMachine>,
    executor: Arc<WorkflowExecutor>,
    /// Registered workflow definitions by name
    definitions: DashMap<String, WorkflowDefinition>,
    /// Executions owned by this region and not yet settled
    active: DashMap<Uuid, Arc<ExecutionHandle>>,
    /// Ids with a submission or adoption in progress or active here
    claimed: DashSet<Uuid>,
    renewals: DashMap<Uuid, JoinHandle<()>>,
    leases: Arc<LeaseManager>,
    replica: Arc<DistributedState>,
    audit: Arc<AuditLog>,
    queue: mpsc::UnboundedSender<Uuid>,
    shutdown: watch::Sender<bool>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl OrchestrationEngine {
    /// Create the engine and start its scheduling loop
    pub fn new(ctx: &RegionContext) -> OrchestrationResult<Arc<Self>> {
        let machine = Arc::new(workflow_lifecycle()?);
        let executor = Arc::new(WorkflowExecutor::new(
            Arc::clone(&ctx.actions),
            Arc::clone(&ctx.workers),
            ctx.config.workflow_concurrency,
            ctx.config.step_timeout(),
        ));
        let (queue, queued) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let engine = Arc::new(Self {
            region: ctx.region.clone(),
            capacity: ctx.config.capacity,
            machine,
            executor,
            definitions: DashMap::new(),
            active: DashMap::new(),
            claimed: DashSet::new(),
            renewals: DashMap::new(),
            leases: Arc::clone(&ctx.leases),
            replica: Arc::clone(&ctx.replica),
            audit: Arc::clone(&ctx.audit),
            queue,
            shutdown,
            scheduler: Mutex::new(None),
        });

        let scheduler = tokio::spawn(schedule(Arc::downgrade(&engine), queued, engine.shutdown.subscribe()));
        if let Ok(mut slot) = engine.scheduler.lock() {
            *slot = Some(scheduler);
        }
        Ok(engine)
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn replica(&self) -> &Arc<DistributedState> {
        &self.replica
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Register a workflow definition. Re-registering a name replaces it.
    pub fn register_definition(&self, definition: WorkflowDefinition) -> OrchestrationResult<()> {
        self.check_definition(&definition)?;
        tracing::info!(workflow = %definition.name, region = %self.region, "Registered workflow definition");
        self.definitions.insert(definition.name.clone(), definition);
        Ok(())
    }

    fn check_definition(&self, definition: &WorkflowDefinition) -> OrchestrationResult<()> {
        let validation = WorkflowValidator::validate_workflow(definition);
        let mut errors = validation.error_messages();

        // Every step and compensation kind needs a handler before the workflow is accepted
        let missing = self.executor.actions().missing_kinds(definition);
        errors.extend(
            missing
                .into_iter()
                .map(|kind| format!("actions: no handler registered for '{}'", kind)),
        );

        if errors.is_empty() {
            Ok(())
        } else {
            Err(OrchestrationError::InvalidDefinition(errors))
        }
    }

    pub fn definition(&self, name: &str) -> Option<WorkflowDefinition> {
        self.definitions.get(name).map(|entry| entry.clone())
    }

    /// Names of registered definitions, sorted
    pub fn list_definitions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.definitions.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Submit a registered workflow. Returns once the execution is durably queued.
    pub async fn submit(&self, name: &str, params: Value) -> OrchestrationResult<Uuid> {
        self.submit_with_id(Uuid::new_v4(), name, params).await
    }

    /// Submit under a caller-chosen id. At most one region executes a given id.
    pub async fn submit_with_id(&self, id: Uuid, name: &str, params: Value) -> OrchestrationResult<Uuid> {
        let definition = self
            .definition(name)
            .ok_or_else(|| OrchestrationError::UnknownDefinition(name.to_string()))?;
        self.submit_definition(definition, params, id, "api").await
    }

    /// Submit an ad-hoc definition
    pub async fn submit_definition(
        &self,
        definition: WorkflowDefinition,
        params: Value,
        id: Uuid,
        initiator: &str,
    ) -> OrchestrationResult<Uuid> {
        self.ensure_running()?;
        self.check_definition(&definition)?;
        self.take_lease(id).await?;

        let execution = WorkflowExecution::new(id, definition, params, self.region.clone(), initiator);
        let handle = Arc::new(ExecutionHandle::new(
            execution,
            Arc::clone(&self.machine),
            Arc::clone(&self.replica),
            Arc::clone(&self.audit),
        ));
        // CREATED is durable before anything else happens
        handle.persist();
        if let Err(rejection) = handle.fire(WorkflowEvent::Enqueue) {
            self.leases.release(id).await;
            self.claimed.remove(&id);
            return Err(rejection.into());
        }

        tracing::info!(
            workflow_id = %id,
            workflow = %handle.snapshot().definition.name,
            region = %self.region,
            initiator = initiator,
            "Workflow submitted"
        );
        self.activate(handle).await?;
        Ok(id)
    }

    /// Take over an execution from another region, resuming from its snapshot
    pub async fn adopt(&self, mut execution: WorkflowExecution) -> OrchestrationResult<Uuid> {
        self.ensure_running()?;
        let id = execution.id;
        self.take_lease(id).await?;

        let previous = std::mem::replace(&mut execution.region, self.region.clone());
        let handle = Arc::new(ExecutionHandle::new(
            execution,
            Arc::clone(&self.machine),
            Arc::clone(&self.replica),
            Arc::clone(&self.audit),
        ));
        handle.persist();
        tracing::info!(
            workflow_id = %id,
            from = %previous,
            region = %self.region,
            state = %handle.state(),
            "Adopted workflow"
        );
        self.activate(handle).await?;
        Ok(id)
    }

    fn ensure_running(&self) -> OrchestrationResult<()> {
        if self.is_shut_down() {
            return Err(OrchestrationError::ShutDown(self.region.clone()));
        }
        Ok(())
    }

    /// Claim `id` in this region, then take its lease. The claim is held
    /// until the execution is forgotten.
    async fn take_lease(&self, id: Uuid) -> OrchestrationResult<()> {
        if !self.claimed.insert(id) {
            return Err(OrchestrationError::AlreadyExecuting {
                workflow_id: id,
                holder: self.region.clone(),
            });
        }
        let acquired = self.leases.acquire(id).await;
        if acquired.is_err() {
            self.claimed.remove(&id);
        }
        match acquired {
            Ok(_) => Ok(()),
            Err(LeaseError::Held { holder, .. }) => {
                self.audit.record(AuditEntry::new(
                    Some(id),
                    self.region.clone(),
                    AuditKind::LeaseContention,
                    json!({ "holder": holder }),
                ));
                tracing::info!(workflow_id = %id, holder = %holder, region = %self.region, "Lease contention");
                Err(OrchestrationError::AlreadyExecuting { workflow_id: id, holder })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn activate(&self, handle: Arc<ExecutionHandle>) -> OrchestrationResult<()> {
        let id = handle.id();
        self.active.insert(id, Arc::clone(&handle));
        self.renewals.insert(
            id,
            tokio::spawn(renew_lease(
                Arc::clone(&self.leases),
                Arc::clone(&handle),
                self.shutdown.subscribe(),
            )),
        );

        if self.queue.send(id).is_err() {
            self.forget(&id);
            handle.detach();
            self.leases.release(id).await;
            return Err(OrchestrationError::ShutDown(self.region.clone()));
        }
        Ok(())
    }

    fn forget(&self, id: &Uuid) {
        self.active.remove(id);
        self.claimed.remove(id);
        if let Some((_, renewal)) = self.renewals.remove(id) {
            renewal.abort();
        }
    }

    /// Called when an executor stops
    async fn finish(&self, handle: &ExecutionHandle) {
        let id = handle.id();
        if handle.is_detached() {
            self.forget(&id);
            return;
        }
        if !handle.is_settled() {
            return;
        }

        let execution = handle.snapshot();
        if let Err(e) = self.audit.archive_execution(&execution) {
            tracing::error!(workflow_id = %id, error = %e, "Failed to archive execution");
        }
        self.forget(&id);
        self.leases.release(id).await;
    }

    fn control(&self, id: Uuid, event: WorkflowEvent, target: WorkflowState) -> OrchestrationResult<WorkflowState> {
        let Some(handle) = self.active.get(&id).map(|h| Arc::clone(h.value())) else {
            let execution = self.get_status(id)?;
            if execution.state == target {
                return Ok(target);
            }
            return Err(TransitionRejection::TerminalState {
                state: execution.state.to_string(),
            }
            .into());
        };

        if handle.state() == target {
            return Ok(target);
        }
        let outcome = handle.fire(event)?;
        tracing::info!(workflow_id = %id, region = %self.region, state = %outcome.to, "Workflow control");
        Ok(outcome.to)
    }

    pub fn pause(&self, id: Uuid) -> OrchestrationResult<WorkflowState> {
        self.control(id, WorkflowEvent::Pause, WorkflowState::Paused)
    }

    pub fn resume(&self, id: Uuid) -> OrchestrationResult<WorkflowState> {
        self.control(id, WorkflowEvent::Resume, WorkflowState::Running)
    }

    /// Cancel a workflow. CANCELLED is visible at once; rollback follows.
    pub fn cancel(&self, id: Uuid) -> OrchestrationResult<WorkflowState> {
        self.control(id, WorkflowEvent::Cancel, WorkflowState::Cancelled)
    }

    /// Current snapshot: live handle, then archive, then replicated state
    pub fn get_status(&self, id: Uuid) -> OrchestrationResult<WorkflowExecution> {
        if let Some(handle) = self.active.get(&id) {
            return Ok(handle.snapshot());
        }
        if let Some(execution) = self.audit.get_archived(id) {
            return Ok(execution);
        }
        load_snapshot(&self.replica, &id)
            .map(|(execution, _)| execution)
            .ok_or(OrchestrationError::NotFound(id))
    }

    /// Executions owned by this region, oldest first
    pub fn list_active_workflows(&self) -> Vec<WorkflowExecution> {
        let mut executions: Vec<WorkflowExecution> =
            self.active.iter().map(|entry| entry.value().snapshot()).collect();
        executions.sort_by_key(|e| e.created_at);
        executions
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: &Uuid) -> bool {
        self.active.contains_key(id)
    }

    pub fn get_audit_trail(&self, id: Uuid) -> Vec<AuditEntry> {
        self.audit.entries_for(id)
    }

    /// Wait until the workflow settles, returning its final snapshot
    pub async fn wait_for_settled(&self, id: Uuid, timeout: Duration) -> OrchestrationResult<WorkflowExecution> {
        let wait = async {
            loop {
                let handle = self.active.get(&id).map(|h| Arc::clone(h.value()));
                match handle {
                    Some(handle) => {
                        let mut progress = handle.subscribe();
                        let _ = progress.wait_for(|p| p.settled).await.map(|_| ());
                        // Give the scheduler a chance to archive before we read back
                        tokio::task::yield_now().await;
                        return self.get_status(id);
                    }
                    None => {
                        let execution = self.get_status(id)?;
                        if execution.is_settled() {
                            return Ok(execution);
                        }
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| OrchestrationError::WaitTimeout(id))?
    }

    /// Load and outcome metrics for health reporting
    pub fn metrics(&self) -> RegionMetrics {
        let summary = self.audit.query_metrics(None);
        RegionMetrics::new(
            self.region.clone(),
            self.active.len() as u32,
            summary.failure_rate() / 100.0,
        )
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Stop scheduling and walk away from every active execution.
    /// Leases are not released; peers take over once they expire.
    pub fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        for entry in self.active.iter() {
            entry.value().detach();
        }
        for entry in self.renewals.iter() {
            entry.value().abort();
        }
        self.renewals.clear();
        self.active.clear();
        self.claimed.clear();
        self.leases.abandon_all();
        if let Ok(mut slot) = self.scheduler.lock() {
            if let Some(scheduler) = slot.take() {
                scheduler.abort();
            }
        }
        tracing::info!(region = %self.region, "Orchestration engine shut down");
    }
}

impl std::fmt::Debug for OrchestrationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationEngine")
            .field("region", &self.region)
            .field("definitions", &self.definitions.len())
            .field("active", &self.active.len())
            .finish()
    }
}

/// Scheduling loop: pull queued workflow ids and spawn their executors
async fn schedule(
    engine: Weak<OrchestrationEngine>,
    mut queued: mpsc::UnboundedReceiver<Uuid>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let id = tokio::select! {
            next = queued.recv() => match next {
                Some(id) => id,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        let Some(strong) = engine.upgrade() else {
            break;
        };
        let Some(handle) = strong.active.get(&id).map(|h| Arc::clone(h.value())) else {
            continue;
        };
        let executor = Arc::clone(&strong.executor);
        let engine = engine.clone();
        drop(strong);

        tokio::spawn(async move {
            executor.run(Arc::clone(&handle)).await;
            if let Some(engine) = engine.upgrade() {
                engine.finish(&handle).await;
            }
        });
    }
    tracing::debug!("Scheduling loop stopped");
}

/// Keep the lease alive until the execution settles. Losing it detaches the handle.
async fn renew_lease(leases: Arc<LeaseManager>, handle: Arc<ExecutionHandle>, mut shutdown: watch::Receiver<bool>) {
    let period = (leases.ttl() / 3).max(Duration::from_millis(10));
    let mut abandoned = handle.abandoned();
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
            _ = abandoned.changed() => return,
        }
        if handle.is_settled() || handle.is_detached() {
            return;
        }
        if let Err(e) = leases.renew(handle.id()).await {
            tracing::warn!(workflow_id = %handle.id(), error = %e, "Lost execution lease");
            handle.detach();
            return;
        }
    }
}
