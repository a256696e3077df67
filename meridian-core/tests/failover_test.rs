//! Integration tests for region failure detection and workload relocation

mod common;

use chrono::Utc;
use common::{GateHandler, ScriptedHandler};
use meridian_core::distributed::{AntiEntropy, DistributedState, LocalTransport, PeerTransport};
use meridian_core::models::region::{HealthStatus, RegionConfig, RegionMetrics};
use meridian_core::models::workflow::{
    ActionKind, AuditKind, ErrorStage, RollbackOutcome, StepStatus, WorkflowDefinition, WorkflowState,
    WorkflowStep,
};
use meridian_core::region::{FailoverManager, RegionDirectory, RegionRegistry};
use meridian_core::workflow::{load_snapshot, ActionRegistry};
use meridian_core::RegionContext;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// block (counted) then quarantine (hangs while running in `eu`)
fn containment() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "contain",
        vec![
            WorkflowStep::new("block", ActionKind::BlockAddress)
                .with_compensation(ActionKind::UnblockAddress, json!({})),
            WorkflowStep::new("quarantine", ActionKind::QuarantinePeer).depends_on("block"),
        ],
    )
}

struct Cluster {
    counter: Arc<ScriptedHandler>,
    gate: Arc<GateHandler>,
    transport: Arc<LocalTransport>,
    directory: Arc<RegionDirectory>,
    contexts: Vec<RegionContext>,
}

impl Cluster {
    fn new(regions: &[&str]) -> Self {
        let counter = Arc::new(ScriptedHandler::new(&[ActionKind::BlockAddress, ActionKind::UnblockAddress]));
        let gate = Arc::new(GateHandler::new(&[ActionKind::QuarantinePeer]));
        gate.stall_region("eu");
        gate.open();
        let actions = ActionRegistry::with_builtin_handlers();
        actions.register(counter.clone()).unwrap();
        actions.register(gate.clone()).unwrap();
        let actions = Arc::new(actions);

        let arbiter = Arc::new(DistributedState::new("arbiter"));
        let transport = Arc::new(LocalTransport::new());
        let directory = Arc::new(RegionDirectory::new());
        let mut contexts = Vec::new();
        for region in regions {
            let peers: Vec<&str> = regions.iter().copied().filter(|r| r != region).collect();
            let (ctx, engine) =
                common::region(common::config(region, &peers), Arc::clone(&arbiter), Arc::clone(&actions));
            engine.register_definition(containment()).unwrap();
            transport.register(Arc::clone(&ctx.replica));
            directory.register(engine);
            contexts.push(ctx);
        }
        Self {
            counter,
            gate,
            transport,
            directory,
            contexts,
        }
    }

    fn context(&self, region: &str) -> &RegionContext {
        self.contexts.iter().find(|c| c.region == region).unwrap()
    }

    /// Push `region`'s recent writes to every peer
    async fn gossip_from(&self, region: &str) {
        let ctx = self.context(region);
        let peers = ctx.config.peers.iter().map(|p| p.id.clone()).collect();
        AntiEntropy::new(
            Arc::clone(&ctx.replica),
            Arc::clone(&self.transport) as Arc<dyn PeerTransport>,
            peers,
        )
        .run_round()
        .await;
    }

    fn manager(&self, region: &str) -> (FailoverManager, Arc<RegionRegistry>) {
        let ctx = self.context(region);
        let registry = Arc::new(RegionRegistry::from_config(&ctx.config).unwrap());
        let manager = FailoverManager::new(ctx, Arc::clone(&registry), Arc::clone(&self.directory)).unwrap();
        (manager, registry)
    }

    /// Start workflows in `eu`, wait until each is stuck in its second step,
    /// replicate, then crash `eu` without releasing anything
    async fn crash_eu_with(&self, count: usize) -> Vec<Uuid> {
        let eu = self.directory.get("eu").unwrap();
        let mut ids = Vec::new();
        for _ in 0..count {
            let id = eu.submit("contain", json!({})).await.unwrap();
            self.gate.entered().await;
            ids.push(id);
        }
        for id in &ids {
            let snapshot = eu.get_status(*id).unwrap();
            assert_eq!(snapshot.step_status("block"), Some(StepStatus::Done));
            assert_eq!(snapshot.step_status("quarantine"), Some(StepStatus::Running));
        }

        self.gossip_from("eu").await;
        eu.shutdown();
        // Let the abandoned leases lapse
        tokio::time::sleep(Duration::from_millis(300)).await;
        ids
    }
}

#[tokio::test]
async fn test_missed_heartbeats_move_workflows_to_best_region() {
    let cluster = Cluster::new(&["ap", "eu", "us"]);
    let ids = cluster.crash_eu_with(2).await;
    assert_eq!(cluster.counter.executions("block"), 2);

    let (manager, registry) = cluster.manager("us");
    // Three heartbeat intervals of silence from eu
    let now = Utc::now() + chrono::Duration::milliseconds(350);
    registry.report(RegionMetrics::new("ap", 1, 0.0).reported_at(now));
    registry.report(RegionMetrics::new("us", 8, 0.0).reported_at(now));
    registry.observe_round_trip("us", "ap", Duration::from_millis(20));

    let report = manager.tick(now).await;

    assert!(report
        .health_changes
        .iter()
        .any(|c| c.region == "eu" && c.to == HealthStatus::Unreachable));
    assert_eq!(registry.health("eu"), Some(HealthStatus::Unreachable));
    assert_eq!(report.moved(), 2);
    assert_eq!(report.plans.len(), 1);
    let plan = &report.plans[0];
    assert_eq!(plan.source, "eu");
    assert_eq!(plan.destination, "ap", "the least loaded healthy region is chosen");
    assert_eq!(plan.snapshots.len(), 2);

    let ap = cluster.directory.get("ap").unwrap();
    for id in &ids {
        let execution = ap.wait_for_settled(*id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(execution.state, WorkflowState::Completed);
        assert_eq!(execution.region, "ap");
    }

    // DONE steps are never executed twice; the interrupted step ran again in ap
    assert_eq!(cluster.counter.executions("block"), 2);
    assert_eq!(
        cluster.counter.regions_for("block"),
        vec!["eu".to_string(), "eu".to_string()]
    );
    let us_audit = cluster.directory.get("us").unwrap().audit().entries_of_kind(AuditKind::Failover);
    assert_eq!(us_audit.len(), 2);
}

#[tokio::test]
async fn test_live_lease_defers_failover() {
    let cluster = Cluster::new(&["ap", "eu", "us"]);
    let eu = cluster.directory.get("eu").unwrap();
    let id = eu.submit("contain", json!({})).await.unwrap();
    cluster.gate.entered().await;
    cluster.gossip_from("eu").await;

    // eu is still renewing its lease; only its heartbeats are late
    let registry = Arc::new(RegionRegistry::new(Duration::from_millis(20), 3, 0.25).unwrap());
    for region in ["ap", "eu", "us"] {
        registry.register(RegionConfig::new(region, format!("http://{}.test:7400", region), 10));
    }
    let manager =
        FailoverManager::new(cluster.context("us"), Arc::clone(&registry), Arc::clone(&cluster.directory)).unwrap();
    let now = Utc::now() + chrono::Duration::milliseconds(100);
    registry.report(RegionMetrics::new("ap", 0, 0.0).reported_at(now));
    registry.report(RegionMetrics::new("us", 0, 0.0).reported_at(now));

    let report = manager.tick(now).await;
    assert_eq!(registry.health("eu"), Some(HealthStatus::Unreachable));
    assert_eq!(report.moved(), 0);
    assert_eq!(report.deferred, vec![id]);
    assert!(eu.is_active(&id));
    eu.shutdown();
}

#[tokio::test]
async fn test_no_healthy_region_fails_workflows() {
    let cluster = Cluster::new(&["eu", "us"]);
    let ids = cluster.crash_eu_with(1).await;

    // us itself has stopped reporting, so nothing is healthy
    let (manager, registry) = cluster.manager("us");
    let now = Utc::now() + chrono::Duration::milliseconds(350);
    let report = manager.tick(now).await;

    assert_eq!(registry.health("us"), Some(HealthStatus::Unreachable));
    assert_eq!(report.moved(), 0);
    assert_eq!(report.failed, ids);

    let replica = &cluster.context("us").replica;
    let (execution, _) = load_snapshot(replica, &ids[0]).unwrap();
    assert_eq!(execution.state, WorkflowState::Failed);
    let error = execution.error.unwrap();
    assert_eq!(error.stage, ErrorStage::Failover);
    assert_eq!(error.cause, "NoHealthyRegion");
    assert_eq!(error.rollback, Some(RollbackOutcome::NotAttempted));

    let us = cluster.directory.get("us").unwrap();
    assert_eq!(us.audit().entries_of_kind(AuditKind::FailoverFailed).len(), 1);
    assert_eq!(us.get_status(ids[0]).unwrap().state, WorkflowState::Failed);
    assert_eq!(cluster.counter.compensations("block"), 0, "no rollback without a region");
}
