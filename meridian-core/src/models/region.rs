//! Region configuration, health metrics and failover plans

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Region identifier
pub type RegionId = String;

/// Health of a region as seen by the failover manager
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unreachable,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unreachable => "unreachable",
        };
        f.write_str(s)
    }
}

/// Events driving the per-region health machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthEvent {
    Heartbeat,
    Missed,
}

/// Static region configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegionConfig {
    pub id: RegionId,
    pub endpoint: String,
    /// Maximum concurrently active workflows
    pub capacity: u32,
}

impl RegionConfig {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>, capacity: u32) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            capacity,
        }
    }
}

/// Dynamic metrics reported on every heartbeat
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegionMetrics {
    pub region_id: RegionId,
    /// Active workflows
    pub current_load: u32,
    /// Fraction of recent workflows that failed (0.0-1.0)
    pub error_rate: f64,
    /// Round-trip times this region measured to its peers, in milliseconds
    #[serde(default)]
    pub peer_latency_ms: BTreeMap<RegionId, f64>,
    pub reported_at: DateTime<Utc>,
}

impl RegionMetrics {
    pub fn new(region_id: impl Into<String>, current_load: u32, error_rate: f64) -> Self {
        Self {
            region_id: region_id.into(),
            current_load,
            error_rate,
            peer_latency_ms: BTreeMap::new(),
            reported_at: Utc::now(),
        }
    }

    pub fn with_latency(mut self, peer: impl Into<String>, latency_ms: f64) -> Self {
        self.peer_latency_ms.insert(peer.into(), latency_ms);
        self
    }

    pub fn reported_at(mut self, at: DateTime<Utc>) -> Self {
        self.reported_at = at;
        self
    }
}

/// Reference to the replicated snapshot a failover resumes from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotRef {
    pub workflow_id: Uuid,
    pub key: String,
    pub version: crate::distributed::Dot,
}

/// Plan moving workloads from a failed region to a healthy one
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailoverPlan {
    pub id: Uuid,
    pub source: RegionId,
    pub destination: RegionId,
    pub workload_ids: Vec<Uuid>,
    pub snapshots: Vec<SnapshotRef>,
    pub created_at: DateTime<Utc>,
}
