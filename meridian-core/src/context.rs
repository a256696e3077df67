//! Per-region dependency bundle
//!
//! Everything a region's services share is carried here instead of in globals.

use crate::distributed::{ConflictSink, DistributedState, LeaseArbiter, LeaseManager};
use crate::models::configuration::Configuration;
use crate::workflow::actions::ActionRegistry;
use crate::workflow::persistence::AuditLog;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct RegionContext {
    pub region: String,
    pub config: Arc<Configuration>,
    pub replica: Arc<DistributedState>,
    pub leases: Arc<LeaseManager>,
    pub actions: Arc<ActionRegistry>,
    pub audit: Arc<AuditLog>,
    /// Bounds concurrently executing actions across all workflows
    pub workers: Arc<Semaphore>,
}

impl RegionContext {
    pub fn builder(config: Configuration) -> RegionContextBuilder {
        RegionContextBuilder {
            config,
            arbiter: None,
            replica: None,
            actions: None,
            audit: None,
        }
    }
}

impl std::fmt::Debug for RegionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionContext")
            .field("region", &self.region)
            .field("replica_entries", &self.replica.len())
            .field("available_workers", &self.workers.available_permits())
            .finish()
    }
}

pub struct RegionContextBuilder {
    config: Configuration,
    arbiter: Option<Arc<dyn LeaseArbiter>>,
    replica: Option<Arc<DistributedState>>,
    actions: Option<Arc<ActionRegistry>>,
    audit: Option<Arc<AuditLog>>,
}

impl RegionContextBuilder {
    /// Lease arbiter shared by every region of the cluster
    pub fn arbiter(mut self, arbiter: Arc<dyn LeaseArbiter>) -> Self {
        self.arbiter = Some(arbiter);
        self
    }

    pub fn replica(mut self, replica: Arc<DistributedState>) -> Self {
        self.replica = Some(replica);
        self
    }

    pub fn actions(mut self, actions: Arc<ActionRegistry>) -> Self {
        self.actions = Some(actions);
        self
    }

    pub fn audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn build(self) -> Result<RegionContext> {
        let config = self.config;
        let region = config.region_id.clone();

        let replica = self
            .replica
            .unwrap_or_else(|| Arc::new(DistributedState::new(region.clone())));

        // Without a shared arbiter the region arbitrates for itself (single-region mode)
        let arbiter: Arc<dyn LeaseArbiter> = match self.arbiter {
            Some(arbiter) => arbiter,
            None => Arc::new(DistributedState::new(format!("{}-leases", region))),
        };
        let leases = Arc::new(LeaseManager::new(
            region.clone(),
            arbiter,
            Arc::clone(&replica),
            config.lease_ttl(),
        ));

        let retention = (config.audit_retained_entries, config.audit_retained_executions);
        let audit = match (self.audit, &config.audit_store_path) {
            (Some(audit), _) => audit,
            (None, Some(path)) => Arc::new(
                AuditLog::new(path)
                    .with_context(|| format!("Failed to open audit store {}", path.display()))?
                    .with_retention(retention.0, retention.1),
            ),
            (None, None) => {
                Arc::new(AuditLog::in_memory().with_retention(retention.0, retention.1))
            }
        };
        if !replica.set_conflict_sink(Arc::clone(&audit) as Arc<dyn ConflictSink>) {
            tracing::debug!(region = %region, "Replica already reports conflicts elsewhere");
        }

        let actions = self
            .actions
            .unwrap_or_else(|| Arc::new(ActionRegistry::with_builtin_handlers()));
        let workers = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));

        Ok(RegionContext {
            region,
            config: Arc::new(config),
            replica,
            leases,
            actions,
            audit,
            workers,
        })
    }
}
