//! Multi-region coordination: health, placement, failover and fan-out

pub mod balancer;
pub mod coordinator;
pub mod failover;
pub mod registry;

pub use balancer::{GlobalLoadBalancer, RegionScore};
pub use coordinator::{AggregateStatus, AggregatedResult, CrossRegionOptions, RegionCoordinator, SubPlanResult};
pub use failover::{FailoverManager, FailoverReport};
pub use registry::{health_machine, HealthChange, HealthSignal, RegionRegistry, RegionStatus};

use crate::workflow::orchestrator::OrchestrationEngine;
use dashmap::DashMap;
use std::sync::Arc;

/// Orchestration engines reachable from this process, by region id
#[derive(Default)]
pub struct RegionDirectory {
    engines: DashMap<String, Arc<OrchestrationEngine>>,
}

impl RegionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, engine: Arc<OrchestrationEngine>) {
        self.engines.insert(engine.region().to_string(), engine);
    }

    pub fn remove(&self, region: &str) -> Option<Arc<OrchestrationEngine>> {
        self.engines.remove(region).map(|(_, engine)| engine)
    }

    pub fn get(&self, region: &str) -> Option<Arc<OrchestrationEngine>> {
        self.engines.get(region).map(|e| Arc::clone(e.value()))
    }

    /// Registered and not shut down
    pub fn is_live(&self, region: &str) -> bool {
        self.engines.get(region).is_some_and(|e| !e.is_shut_down())
    }

    pub fn regions(&self) -> Vec<String> {
        let mut regions: Vec<String> = self.engines.iter().map(|e| e.key().clone()).collect();
        regions.sort();
        regions
    }
}

impl std::fmt::Debug for RegionDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionDirectory").field("regions", &self.regions()).finish()
    }
}
