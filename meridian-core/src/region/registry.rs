//! Region membership and health tracking
//!
//! ```text
//! HEALTHY --(error rate high | missed < N)--> DEGRADED
//! HEALTHY | DEGRADED --(missed >= N)--> UNREACHABLE
//! DEGRADED | UNREACHABLE --(heartbeat, error rate ok)--> HEALTHY
//! ```

use crate::distributed::{keys, DistributedState};
use crate::error::MachineDefinitionError;
use crate::models::configuration::Configuration;
use crate::models::region::{HealthEvent, HealthStatus, RegionConfig, RegionId, RegionMetrics};
use crate::state_machine::{StateMachine, StateMachineInstance, Transition};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Inputs to the health guards
#[derive(Debug, Clone, Copy)]
pub struct HealthSignal {
    pub missed: u32,
    pub threshold: u32,
    pub error_rate: f64,
    pub degraded_error_rate: f64,
}

impl HealthSignal {
    fn unreachable(&self) -> bool {
        self.missed >= self.threshold
    }

    fn erroring(&self) -> bool {
        self.error_rate >= self.degraded_error_rate
    }
}

pub type HealthMachine = StateMachine<HealthStatus, HealthEvent, HealthSignal>;

/// Weight of the newest round trip in the moving average
const LATENCY_SMOOTHING: f64 = 0.3;

/// Build the per-region health machine
pub fn health_machine() -> Result<HealthMachine, MachineDefinitionError> {
    use HealthEvent::{Heartbeat, Missed};
    use HealthStatus::{Degraded, Healthy, Unreachable};

    let mut builder = StateMachine::builder("region-health")
        .states([Healthy, Degraded, Unreachable])
        .initial(Healthy);

    for from in [Healthy, Degraded, Unreachable] {
        builder = builder
            .transition(Transition::new(from, Heartbeat, Degraded).with_guard(HealthSignal::erroring))
            .transition(Transition::new(from, Heartbeat, Healthy));
    }
    for from in [Healthy, Degraded] {
        builder = builder
            .transition(Transition::new(from, Missed, Unreachable).with_guard(HealthSignal::unreachable))
            .transition(Transition::new(from, Missed, Degraded));
    }
    builder
        .transition(Transition::new(Unreachable, Missed, Unreachable))
        .build()
}

/// A region whose health changed during a report or check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthChange {
    pub region: RegionId,
    pub from: HealthStatus,
    pub to: HealthStatus,
}

/// Read-only view of one region
#[derive(Debug, Clone, Serialize)]
pub struct RegionStatus {
    pub id: RegionId,
    pub endpoint: String,
    pub capacity: u32,
    pub health: HealthStatus,
    pub missed_heartbeats: u32,
    pub last_seen: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<RegionMetrics>,
}

struct RegionRecord {
    config: RegionConfig,
    metrics: Option<RegionMetrics>,
    health: StateMachineInstance<HealthStatus, HealthEvent, HealthSignal>,
    missed: u32,
    last_seen: DateTime<Utc>,
}

pub struct RegionRegistry {
    machine: Arc<HealthMachine>,
    regions: DashMap<RegionId, RegionRecord>,
    /// Smoothed round trips measured here, keyed by (from, to)
    round_trips: DashMap<(RegionId, RegionId), f64>,
    heartbeat_interval: Duration,
    threshold: u32,
    degraded_error_rate: f64,
}

impl RegionRegistry {
    pub fn new(
        heartbeat_interval: Duration,
        threshold: u32,
        degraded_error_rate: f64,
    ) -> Result<Self, MachineDefinitionError> {
        Ok(Self {
            machine: Arc::new(health_machine()?),
            regions: DashMap::new(),
            round_trips: DashMap::new(),
            heartbeat_interval: heartbeat_interval.max(Duration::from_millis(1)),
            threshold: threshold.max(1),
            degraded_error_rate,
        })
    }

    pub fn from_config(config: &Configuration) -> Result<Self, MachineDefinitionError> {
        let registry = Self::new(
            config.heartbeat_interval(),
            config.missed_heartbeat_threshold,
            config.degraded_error_rate,
        )?;
        registry.register(config.local_region());
        for peer in &config.peers {
            registry.register(peer.clone());
        }
        Ok(registry)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Add a region; it starts HEALTHY and counts as seen now
    pub fn register(&self, config: RegionConfig) {
        self.register_at(config, Utc::now());
    }

    pub fn register_at(&self, config: RegionConfig, now: DateTime<Utc>) {
        let id = config.id.clone();
        self.regions.insert(
            id,
            RegionRecord {
                config,
                metrics: None,
                health: StateMachineInstance::new(Arc::clone(&self.machine)),
                missed: 0,
                last_seen: now,
            },
        );
    }

    pub fn contains(&self, region: &str) -> bool {
        self.regions.contains_key(region)
    }

    fn signal(&self, missed: u32, error_rate: f64) -> HealthSignal {
        HealthSignal {
            missed,
            threshold: self.threshold,
            error_rate,
            degraded_error_rate: self.degraded_error_rate,
        }
    }

    /// Record a heartbeat. Reports older than the last one seen are ignored.
    pub fn report(&self, metrics: RegionMetrics) -> Option<HealthChange> {
        let Some(mut record) = self.regions.get_mut(&metrics.region_id) else {
            tracing::warn!(region = %metrics.region_id, "Heartbeat from unknown region");
            return None;
        };
        if record.metrics.as_ref().is_some_and(|m| m.reported_at >= metrics.reported_at) {
            return None;
        }

        let signal = self.signal(0, metrics.error_rate);
        let from = record.health.current();
        record.missed = 0;
        record.last_seen = record.last_seen.max(metrics.reported_at);
        record.metrics = Some(metrics);
        let to = record.health.fire(HealthEvent::Heartbeat, &signal).ok()?.to;

        (from != to).then(|| {
            tracing::info!(region = %record.config.id, %from, %to, "Region health changed");
            HealthChange {
                region: record.config.id.clone(),
                from,
                to,
            }
        })
    }

    /// Count heartbeats missed up to `now` and fire the health machine for each
    pub fn check(&self, now: DateTime<Utc>) -> Vec<HealthChange> {
        let interval_ms = self.heartbeat_interval.as_millis().max(1) as i64;
        let mut changes = Vec::new();

        for mut entry in self.regions.iter_mut() {
            let record = entry.value_mut();
            let elapsed = (now - record.last_seen).num_milliseconds().max(0);
            let due = (elapsed / interval_ms) as u32;
            if due <= record.missed {
                continue;
            }

            let from = record.health.current();
            let error_rate = record.metrics.as_ref().map_or(0.0, |m| m.error_rate);
            while record.missed < due {
                record.missed += 1;
                let signal = self.signal(record.missed, error_rate);
                if let Err(rejection) = record.health.fire(HealthEvent::Missed, &signal) {
                    tracing::debug!(region = %record.config.id, %rejection, "Health event ignored");
                }
                if record.health.current() == HealthStatus::Unreachable {
                    record.missed = due;
                }
            }

            let to = record.health.current();
            if from != to {
                if to == HealthStatus::Unreachable {
                    tracing::warn!(region = %record.config.id, missed = record.missed, "Region unreachable");
                } else {
                    tracing::info!(region = %record.config.id, %from, %to, "Region health changed");
                }
                changes.push(HealthChange {
                    region: record.config.id.clone(),
                    from,
                    to,
                });
            }
        }
        changes.sort_by(|a, b| a.region.cmp(&b.region));
        changes
    }

    /// Feed heartbeats that arrived through replicated `region-metrics:*` keys
    pub fn sync_from(&self, replica: &DistributedState) -> Vec<HealthChange> {
        let mut changes = Vec::new();
        for key in replica.keys_with_prefix(keys::REGION_METRICS_PREFIX) {
            match replica.read_as::<RegionMetrics>(&key) {
                Ok(Some((metrics, _))) => changes.extend(self.report(metrics)),
                Ok(None) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "Unreadable region metrics"),
            }
        }
        changes
    }

    /// Fold one measured round trip into the moving average for `from -> to`
    pub fn observe_round_trip(&self, from: &str, to: &str, rtt: Duration) {
        let sample = rtt.as_secs_f64() * 1_000.0;
        self.round_trips
            .entry((from.to_string(), to.to_string()))
            .and_modify(|avg| *avg += LATENCY_SMOOTHING * (sample - *avg))
            .or_insert(sample);
    }

    /// Latencies measured here from `from`, for publishing in its heartbeat
    pub fn latencies_from(&self, from: &str) -> BTreeMap<RegionId, f64> {
        self.round_trips
            .iter()
            .filter(|e| e.key().0 == from)
            .map(|e| (e.key().1.clone(), *e.value()))
            .collect()
    }

    /// Observed latency from `from` to `to` in milliseconds. Local measurements
    /// come first, then the table `from` published with its last heartbeat.
    pub fn latency(&self, from: &str, to: &str) -> Option<f64> {
        if from == to {
            return Some(0.0);
        }
        if let Some(avg) = self.round_trips.get(&(from.to_string(), to.to_string())) {
            return Some(*avg);
        }
        self.regions
            .get(from)
            .and_then(|r| r.metrics.as_ref()?.peer_latency_ms.get(to).copied())
    }

    pub fn health(&self, region: &str) -> Option<HealthStatus> {
        self.regions.get(region).map(|r| r.health.current())
    }

    pub fn config(&self, region: &str) -> Option<RegionConfig> {
        self.regions.get(region).map(|r| r.config.clone())
    }

    pub fn metrics(&self, region: &str) -> Option<RegionMetrics> {
        self.regions.get(region).and_then(|r| r.metrics.clone())
    }

    pub fn regions_in(&self, health: HealthStatus) -> Vec<RegionId> {
        let mut ids: Vec<RegionId> = self
            .regions
            .iter()
            .filter(|r| r.health.current() == health)
            .map(|r| r.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Every region, sorted by id
    pub fn statuses(&self) -> Vec<RegionStatus> {
        let mut statuses: Vec<RegionStatus> = self
            .regions
            .iter()
            .map(|r| RegionStatus {
                id: r.config.id.clone(),
                endpoint: r.config.endpoint.clone(),
                capacity: r.config.capacity,
                health: r.health.current(),
                missed_heartbeats: r.missed,
                last_seen: r.last_seen,
                metrics: r.metrics.clone(),
            })
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }
}

impl std::fmt::Debug for RegionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionRegistry")
            .field("regions", &self.regions.len())
            .field("threshold", &self.threshold)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> RegionRegistry {
        RegionRegistry::new(Duration::from_millis(100), 3, 0.25).unwrap()
    }

    #[test]
    fn test_health_machine_is_valid() {
        assert!(health_machine().is_ok());
    }

    #[test]
    fn test_missed_heartbeats() {
        let registry = registry();
        let t0 = Utc::now();
        registry.register_at(RegionConfig::new("eu", "http://eu", 10), t0);

        let changes = registry.check(t0 + chrono::Duration::milliseconds(150));
        assert_eq!(changes[0].to, HealthStatus::Degraded);

        let changes = registry.check(t0 + chrono::Duration::milliseconds(310));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].from, HealthStatus::Degraded);
        assert_eq!(changes[0].to, HealthStatus::Unreachable);

        assert!(registry.check(t0 + chrono::Duration::milliseconds(900)).is_empty());
    }

    #[test]
    fn test_recovery_and_error_rate() {
        let registry = registry();
        let t0 = Utc::now();
        registry.register_at(RegionConfig::new("eu", "http://eu", 10), t0);
        registry.check(t0 + chrono::Duration::seconds(1));
        assert_eq!(registry.health("eu"), Some(HealthStatus::Unreachable));

        let change = registry
            .report(RegionMetrics::new("eu", 1, 0.0).reported_at(t0 + chrono::Duration::seconds(2)))
            .unwrap();
        assert_eq!(change.to, HealthStatus::Healthy);

        let change = registry
            .report(RegionMetrics::new("eu", 1, 0.5).reported_at(t0 + chrono::Duration::seconds(3)))
            .unwrap();
        assert_eq!(change.to, HealthStatus::Degraded);
    }

    #[test]
    fn test_stale_reports_ignored() {
        let registry = registry();
        let t0 = Utc::now();
        registry.register_at(RegionConfig::new("eu", "http://eu", 10), t0);
        registry.report(RegionMetrics::new("eu", 5, 0.0).reported_at(t0));
        registry.report(RegionMetrics::new("eu", 9, 0.0).reported_at(t0 - chrono::Duration::seconds(1)));
        assert_eq!(registry.metrics("eu").unwrap().current_load, 5);
    }

    #[test]
    fn test_latency_prefers_local_measurements() {
        let registry = registry();
        let t0 = Utc::now();
        registry.register_at(RegionConfig::new("eu", "http://eu", 10), t0);
        registry.register_at(RegionConfig::new("us", "http://us", 10), t0);
        registry.register_at(RegionConfig::new("ap", "http://ap", 10), t0);

        assert_eq!(registry.latency("eu", "eu"), Some(0.0));
        assert_eq!(registry.latency("eu", "us"), None);

        registry.observe_round_trip("eu", "us", Duration::from_millis(100));
        registry.observe_round_trip("eu", "us", Duration::from_millis(200));
        let smoothed = registry.latency("eu", "us").unwrap();
        assert!((smoothed - 130.0).abs() < 1e-6);
        assert_eq!(registry.latencies_from("eu").len(), 1);

        // Remote requesters are answered from their published table
        registry.report(RegionMetrics::new("ap", 0, 0.0).with_latency("us", 40.0).reported_at(t0));
        assert_eq!(registry.latency("ap", "us"), Some(40.0));
        assert_eq!(registry.latency("ap", "eu"), None);
    }

    #[test]
    fn test_sync_from_replica() {
        let registry = registry();
        registry.register(RegionConfig::new("us", "http://us", 10));
        let replica = DistributedState::new("eu");
        replica
            .write_json(&keys::region_metrics("us"), &RegionMetrics::new("us", 3, 0.9))
            .unwrap();

        let changes = registry.sync_from(&replica);
        assert_eq!(changes.len(), 1);
        assert_eq!(registry.health("us"), Some(HealthStatus::Degraded));
        assert_eq!(registry.metrics("us").unwrap().current_load, 3);
    }
}
