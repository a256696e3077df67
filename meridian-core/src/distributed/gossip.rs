//! Anti-entropy gossip between region replicas

use super::state::{DistributedState, StateEntry};
use crate::error::TransportError;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::version::Dot;

/// Messages exchanged between replicas
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GossipMessage {
    /// Recently written entries
    Push { from: String, entries: Vec<StateEntry> },
    /// Full key to version summary
    Digest { from: String, digest: BTreeMap<String, Dot> },
}

impl GossipMessage {
    pub fn sender(&self) -> &str {
        match self {
            GossipMessage::Push { from, .. } | GossipMessage::Digest { from, .. } => from,
        }
    }
}

/// Answer to a gossip message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GossipReply {
    /// Entries the sender is missing
    pub entries: Vec<StateEntry>,
    /// Keys the receiver wants pushed back
    pub wanted: Vec<String>,
}

/// Network boundary for gossip
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send(&self, peer: &str, message: GossipMessage) -> Result<GossipReply, TransportError>;
}

/// In-process transport with simulated partitions
#[derive(Default)]
pub struct LocalTransport {
    replicas: DashMap<String, Arc<DistributedState>>,
    cut_links: DashSet<(String, String)>,
    isolated: DashSet<String>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, state: Arc<DistributedState>) {
        self.replicas.insert(state.region().to_string(), state);
    }

    /// Drop traffic between `a` and `b` in both directions
    pub fn partition(&self, a: &str, b: &str) {
        self.cut_links.insert((a.to_string(), b.to_string()));
        self.cut_links.insert((b.to_string(), a.to_string()));
    }

    /// Drop all traffic to and from `region`
    pub fn isolate(&self, region: &str) {
        self.isolated.insert(region.to_string());
    }

    pub fn heal(&self) {
        self.cut_links.clear();
        self.isolated.clear();
    }

    fn link_up(&self, from: &str, to: &str) -> bool {
        !self.isolated.contains(from)
            && !self.isolated.contains(to)
            && !self.cut_links.contains(&(from.to_string(), to.to_string()))
    }
}

#[async_trait]
impl PeerTransport for LocalTransport {
    async fn send(&self, peer: &str, message: GossipMessage) -> Result<GossipReply, TransportError> {
        if !self.link_up(message.sender(), peer) {
            return Err(TransportError::Unreachable(peer.to_string()));
        }
        let replica = self
            .replicas
            .get(peer)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| TransportError::UnknownPeer(peer.to_string()))?;
        Ok(replica.handle_gossip(message))
    }
}

/// What one gossip round did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub pushed: usize,
    pub received: usize,
    pub reconciled_with: Option<String>,
    /// Digest exchange time with `reconciled_with`
    pub round_trip: Option<Duration>,
    pub unreachable: Vec<String>,
}

/// Called after every background round
pub type RoundObserver = Arc<dyn Fn(&RoundReport) + Send + Sync>;

/// Periodic push plus digest reconciliation for one replica
pub struct AntiEntropy {
    state: Arc<DistributedState>,
    transport: Arc<dyn PeerTransport>,
    peers: Vec<String>,
    cursor: AtomicUsize,
    observer: Option<RoundObserver>,
}

impl AntiEntropy {
    pub fn new(state: Arc<DistributedState>, transport: Arc<dyn PeerTransport>, peers: Vec<String>) -> Self {
        let peers = peers
            .into_iter()
            .filter(|p| p != state.region())
            .collect();
        Self {
            state,
            transport,
            peers,
            cursor: AtomicUsize::new(0),
            observer: None,
        }
    }

    /// Report every background round to `observer`
    pub fn on_round(mut self, observer: impl Fn(&RoundReport) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    /// Push recent writes to every peer, then reconcile a full digest with one
    /// peer chosen round-robin.
    pub async fn run_round(&self) -> RoundReport {
        let mut report = RoundReport::default();
        if self.peers.is_empty() {
            return report;
        }
        let from = self.state.region().to_string();

        let recent = self.state.drain_recent();
        if !recent.is_empty() {
            for peer in &self.peers {
                let message = GossipMessage::Push {
                    from: from.clone(),
                    entries: recent.clone(),
                };
                match self.transport.send(peer, message).await {
                    Ok(_) => report.pushed += recent.len(),
                    Err(e) => {
                        tracing::debug!(region = %from, peer = %peer, error = %e, "Gossip push failed");
                        report.unreachable.push(peer.clone());
                    }
                }
            }
        }

        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.peers.len();
        let peer = &self.peers[index];
        let digest = GossipMessage::Digest {
            from: from.clone(),
            digest: self.state.digest(),
        };
        let sent = Instant::now();
        match self.transport.send(peer, digest).await {
            Ok(reply) => {
                report.round_trip = Some(sent.elapsed());
                report.received = reply.entries.len();
                for entry in reply.entries {
                    self.state.apply_remote(entry);
                }
                let wanted: Vec<StateEntry> = reply
                    .wanted
                    .iter()
                    .filter_map(|key| self.state.entry(key))
                    .collect();
                if !wanted.is_empty() {
                    let count = wanted.len();
                    let push = GossipMessage::Push {
                        from: from.clone(),
                        entries: wanted,
                    };
                    if let Err(e) = self.transport.send(peer, push).await {
                        tracing::debug!(region = %from, peer = %peer, error = %e, "Gossip pull-back failed");
                    } else {
                        report.pushed += count;
                    }
                }
                report.reconciled_with = Some(peer.clone());
            }
            Err(e) => {
                tracing::debug!(region = %from, peer = %peer, error = %e, "Digest exchange failed");
                if !report.unreachable.contains(peer) {
                    report.unreachable.push(peer.clone());
                }
            }
        }

        report
    }

    /// Run rounds on `interval` until `shutdown` flips to true
    pub fn spawn(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.run_round().await;
                        if let Some(observer) = &self.observer {
                            observer(&report);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(region = %self.state.region(), "Gossip loop stopped");
        })
    }
}
