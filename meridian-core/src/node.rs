//! A running region: engine plus background loops

use crate::context::RegionContext;
use crate::distributed::{keys, AntiEntropy, DistributedState, PeerTransport};
use crate::error::OrchestrationResult;
use crate::region::{FailoverManager, RegionDirectory, RegionRegistry};
use crate::response::ThreatResponseEngine;
use crate::server::{spawn_api_server, ApiState};
use crate::workflow::orchestrator::OrchestrationEngine;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Wires one region's engine, threat response, gossip, heartbeats,
/// failover monitor and status API together
pub struct RegionNode {
    ctx: RegionContext,
    engine: Arc<OrchestrationEngine>,
    response: Arc<ThreatResponseEngine>,
    registry: Arc<RegionRegistry>,
    directory: Arc<RegionDirectory>,
    failover: Arc<FailoverManager>,
    transport: Option<Arc<dyn PeerTransport>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RegionNode {
    /// Build the node and register its engine in `directory`.
    /// Without a transport the node does not gossip.
    pub fn new(
        ctx: RegionContext,
        directory: Arc<RegionDirectory>,
        transport: Option<Arc<dyn PeerTransport>>,
    ) -> OrchestrationResult<Self> {
        let engine = OrchestrationEngine::new(&ctx)?;
        directory.register(Arc::clone(&engine));

        let registry = Arc::new(RegionRegistry::from_config(&ctx.config)?);
        let failover = Arc::new(FailoverManager::new(&ctx, Arc::clone(&registry), Arc::clone(&directory))?);
        let response = Arc::new(ThreatResponseEngine::new(
            Arc::clone(&engine),
            ctx.config.pattern_cooldown(),
        ));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            ctx,
            engine,
            response,
            registry,
            directory,
            failover,
            transport,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn region(&self) -> &str {
        &self.ctx.region
    }

    pub fn context(&self) -> &RegionContext {
        &self.ctx
    }

    pub fn engine(&self) -> &Arc<OrchestrationEngine> {
        &self.engine
    }

    pub fn response(&self) -> &Arc<ThreatResponseEngine> {
        &self.response
    }

    pub fn registry(&self) -> &Arc<RegionRegistry> {
        &self.registry
    }

    pub fn failover(&self) -> &Arc<FailoverManager> {
        &self.failover
    }

    pub fn directory(&self) -> &Arc<RegionDirectory> {
        &self.directory
    }

    fn track(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
    }

    /// Publish this region's metrics as a heartbeat
    pub fn heartbeat(&self) {
        publish_heartbeat(&self.engine, &self.registry, &self.ctx.replica);
    }

    /// Start gossip, heartbeat and failover loops
    pub fn start(&self) {
        let config = &self.ctx.config;

        if let Some(transport) = &self.transport {
            let peers = config.peers.iter().map(|p| p.id.clone()).collect();
            let registry = Arc::clone(&self.registry);
            let local = self.ctx.region.clone();
            let gossip = AntiEntropy::new(Arc::clone(&self.ctx.replica), Arc::clone(transport), peers)
                .on_round(move |report| {
                    if let (Some(peer), Some(rtt)) = (&report.reconciled_with, report.round_trip) {
                        registry.observe_round_trip(&local, peer, rtt);
                    }
                });
            let gossip = Arc::new(gossip);
            self.track(gossip.spawn(config.gossip_interval(), self.shutdown.subscribe()));
        }

        let engine = Arc::clone(&self.engine);
        let response = Arc::clone(&self.response);
        let registry = Arc::clone(&self.registry);
        let replica = Arc::clone(&self.ctx.replica);
        let interval = config.heartbeat_interval();
        let mut shutdown = self.shutdown.subscribe();
        self.track(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        publish_heartbeat(&engine, &registry, &replica);
                        response.prune_cooldowns();
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));

        self.track(Arc::clone(&self.failover).spawn(interval, self.shutdown.subscribe()));
        tracing::info!(region = %self.ctx.region, "Region node started");
    }

    /// Serve the status API on `addr` until shutdown
    pub fn start_api(&self, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
        let state = ApiState {
            engine: Arc::clone(&self.engine),
            registry: Arc::clone(&self.registry),
            response: Some(Arc::clone(&self.response)),
        };
        let mut shutdown = self.shutdown.subscribe();
        let (bound, task) = spawn_api_server(state, addr, async move {
            let _ = shutdown.changed().await;
        })?;
        self.track(task);
        Ok(bound)
    }

    /// Stop background loops and the engine. Leases are left to expire.
    pub fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        self.engine.shutdown();
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        tracing::info!(region = %self.ctx.region, "Region node shut down");
    }
}

fn publish_heartbeat(engine: &OrchestrationEngine, registry: &RegionRegistry, replica: &DistributedState) {
    let mut metrics = engine.metrics();
    metrics.peer_latency_ms = registry.latencies_from(engine.region());
    if let Err(e) = replica.write_json(&keys::region_metrics(engine.region()), &metrics) {
        tracing::warn!(region = %engine.region(), error = %e, "Failed to publish heartbeat");
    }
    registry.report(metrics);
}

impl Drop for RegionNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for RegionNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionNode")
            .field("region", &self.ctx.region)
            .field("engine", &self.engine)
            .finish()
    }
}
