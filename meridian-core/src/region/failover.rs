//! Region failure detection and workload relocation
//!
//! Every tick the manager refreshes region health, then looks for unsettled
//! workflows owned by UNREACHABLE regions in its own replica. A workflow whose
//! lease has expired is handed to the best healthy region, which resumes it
//! from the replicated snapshot; DONE steps are never run again. Workflows
//! still under a live lease wait for a later tick.

use super::balancer::GlobalLoadBalancer;
use super::registry::{HealthChange, RegionRegistry};
use super::RegionDirectory;
use crate::context::RegionContext;
use crate::distributed::{keys, DistributedState, LeaseManager};
use crate::error::{MachineDefinitionError, OrchestrationError, PlacementError};
use crate::models::region::{FailoverPlan, HealthStatus, SnapshotRef};
use crate::models::workflow::{
    AuditEntry, AuditKind, ErrorRecord, ErrorStage, RollbackOutcome, WorkflowEvent, WorkflowExecution,
};
use crate::workflow::handle::load_snapshot;
use crate::workflow::lifecycle::{workflow_lifecycle, LifecycleMachine};
use crate::workflow::persistence::AuditLog;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// What one tick did
#[derive(Debug, Clone, Default, Serialize)]
pub struct FailoverReport {
    pub health_changes: Vec<HealthChange>,
    pub plans: Vec<FailoverPlan>,
    /// Orphans whose lease is still live or whose move failed
    pub deferred: Vec<Uuid>,
    /// Orphans marked FAILED because no healthy region could take them
    pub failed: Vec<Uuid>,
}

impl FailoverReport {
    pub fn moved(&self) -> usize {
        self.plans.iter().map(|p| p.workload_ids.len()).sum()
    }
}

pub struct FailoverManager {
    region: String,
    registry: Arc<RegionRegistry>,
    balancer: GlobalLoadBalancer,
    directory: Arc<RegionDirectory>,
    replica: Arc<DistributedState>,
    leases: Arc<LeaseManager>,
    audit: Arc<AuditLog>,
    machine: Arc<LifecycleMachine>,
}

impl FailoverManager {
    pub fn new(
        ctx: &RegionContext,
        registry: Arc<RegionRegistry>,
        directory: Arc<RegionDirectory>,
    ) -> Result<Self, MachineDefinitionError> {
        Ok(Self {
            region: ctx.region.clone(),
            registry,
            balancer: GlobalLoadBalancer::new(ctx.config.balancer.clone()),
            directory,
            replica: Arc::clone(&ctx.replica),
            leases: Arc::clone(&ctx.leases),
            audit: Arc::clone(&ctx.audit),
            machine: Arc::new(workflow_lifecycle()?),
        })
    }

    pub fn registry(&self) -> &Arc<RegionRegistry> {
        &self.registry
    }

    /// Unsettled workflows the replica attributes to `source`, oldest first
    fn orphans(&self, source: &str) -> Vec<(WorkflowExecution, SnapshotRef)> {
        let mut orphans: Vec<(WorkflowExecution, SnapshotRef)> = self
            .replica
            .keys_with_prefix(keys::WORKFLOW_PREFIX)
            .into_iter()
            .filter_map(|key| {
                let id = key.strip_prefix(keys::WORKFLOW_PREFIX)?.parse::<Uuid>().ok()?;
                let (execution, version) = load_snapshot(&self.replica, &id)?;
                (execution.region == source && !execution.is_settled()).then(|| {
                    (
                        execution,
                        SnapshotRef {
                            workflow_id: id,
                            key,
                            version,
                        },
                    )
                })
            })
            .collect();
        orphans.sort_by_key(|(execution, _)| execution.created_at);
        orphans
    }

    /// Refresh health and relocate what can be relocated
    pub async fn tick(&self, now: DateTime<Utc>) -> FailoverReport {
        let mut report = FailoverReport::default();
        report.health_changes.extend(self.registry.sync_from(&self.replica));
        report.health_changes.extend(self.registry.check(now));

        for source in self.registry.regions_in(HealthStatus::Unreachable) {
            // The snapshot must come from a surviving replica
            if source == self.region {
                continue;
            }
            let orphans = self.orphans(&source);
            if orphans.is_empty() {
                continue;
            }

            let mut moved: BTreeMap<String, (Vec<Uuid>, Vec<SnapshotRef>)> = BTreeMap::new();
            for (execution, snapshot) in orphans {
                let id = execution.id;
                if !self.leases.is_expired(id, now).await {
                    tracing::debug!(workflow_id = %id, region = %source, "Lease still live, deferring failover");
                    report.deferred.push(id);
                    continue;
                }

                let placement = self
                    .balancer
                    .place(&self.registry, &self.region, |r| {
                        r != source && self.directory.is_live(r)
                    });
                let destination = match placement {
                    Ok(best) => best.region,
                    Err(PlacementError::NoHealthyRegion) => {
                        if self.mark_failed(execution, &source).await {
                            report.failed.push(id);
                        } else {
                            report.deferred.push(id);
                        }
                        continue;
                    }
                };
                let Some(engine) = self.directory.get(&destination) else {
                    report.deferred.push(id);
                    continue;
                };

                match engine.adopt(execution).await {
                    Ok(_) => {
                        let entry = moved.entry(destination).or_default();
                        entry.0.push(id);
                        entry.1.push(snapshot);
                    }
                    Err(OrchestrationError::AlreadyExecuting { holder, .. }) => {
                        tracing::debug!(workflow_id = %id, holder = %holder, "Workflow already taken over");
                    }
                    Err(e) => {
                        tracing::warn!(workflow_id = %id, region = %destination, error = %e, "Failover move failed");
                        self.audit.record(AuditEntry::new(
                            Some(id),
                            self.region.clone(),
                            AuditKind::FailoverFailed,
                            json!({ "source": source, "destination": destination, "error": e.to_string() }),
                        ));
                        report.deferred.push(id);
                    }
                }
            }

            for (destination, (workload_ids, snapshots)) in moved {
                let plan = FailoverPlan {
                    id: Uuid::new_v4(),
                    source: source.clone(),
                    destination,
                    workload_ids,
                    snapshots,
                    created_at: Utc::now(),
                };
                tracing::warn!(
                    plan_id = %plan.id,
                    source = %plan.source,
                    destination = %plan.destination,
                    workloads = plan.workload_ids.len(),
                    "Failover executed"
                );
                for snapshot in &plan.snapshots {
                    self.audit.record(AuditEntry::new(
                        Some(snapshot.workflow_id),
                        self.region.clone(),
                        AuditKind::Failover,
                        json!({
                            "plan_id": plan.id,
                            "source": plan.source,
                            "destination": plan.destination,
                            "snapshot_version": snapshot.version.to_string(),
                        }),
                    ));
                }
                report.plans.push(plan);
            }
        }
        report
    }

    /// No region can take the workflow: record it as FAILED without rollback
    async fn mark_failed(&self, mut execution: WorkflowExecution, source: &str) -> bool {
        let id = execution.id;
        if self.leases.acquire(id).await.is_err() {
            return false;
        }

        let cause = format!("{:?}", PlacementError::NoHealthyRegion);
        if let Err(rejection) = execution.apply_event(&self.machine, WorkflowEvent::Fail) {
            tracing::debug!(workflow_id = %id, %rejection, "Workflow already past running states");
        }
        match execution.error.as_mut() {
            Some(error) => error.rollback = Some(RollbackOutcome::NotAttempted),
            None => {
                execution.error = Some(ErrorRecord {
                    stage: ErrorStage::Failover,
                    step_id: None,
                    cause: cause.clone(),
                    rollback: Some(RollbackOutcome::NotAttempted),
                })
            }
        }
        execution.updated_at = Utc::now();

        if let Err(e) = self.replica.write_json(&keys::workflow(&id), &execution) {
            tracing::error!(workflow_id = %id, error = %e, "Failed to replicate failed workflow");
        }
        if let Err(e) = self.audit.archive_execution(&execution) {
            tracing::error!(workflow_id = %id, error = %e, "Failed to archive failed workflow");
        }
        self.audit.record(AuditEntry::new(
            Some(id),
            self.region.clone(),
            AuditKind::FailoverFailed,
            json!({ "source": source, "cause": cause }),
        ));
        tracing::warn!(workflow_id = %id, source = %source, "No healthy region for failover, workflow failed");
        self.leases.release(id).await;
        true
    }

    /// Run `tick` on the heartbeat interval until shutdown
    pub fn spawn(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.tick(Utc::now()).await;
                        if !report.plans.is_empty() || !report.failed.is_empty() {
                            tracing::info!(
                                region = %self.region,
                                moved = report.moved(),
                                failed = report.failed.len(),
                                deferred = report.deferred.len(),
                                "Failover tick"
                            );
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

impl std::fmt::Debug for FailoverManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverManager")
            .field("region", &self.region)
            .field("registry", &self.registry)
            .finish()
    }
}
