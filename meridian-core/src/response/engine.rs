//! Threat response engine
//!
//! Matches incoming [`ThreatEvent`]s against registered patterns and starts
//! the mapped workflow. Patterns are evaluated most severe first, ties in
//! registration order, and the first match wins. A per `(pattern, correlation
//! key)` cooldown keeps one incident from spawning a storm of workflows.

use super::pattern::{PatternSet, ThreatResponsePattern};
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::models::event::ThreatEvent;
use crate::models::workflow::{AuditEntry, AuditKind};
use crate::workflow::orchestrator::OrchestrationEngine;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Cooldown map size below which no sweep runs
const SWEEP_FLOOR: usize = 32;

/// Result of submitting one event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum ResponseOutcome {
    NoMatch,
    Suppressed { pattern_id: String },
    Triggered { pattern_id: String, workflow_id: Uuid },
}

/// Event counters since the engine started
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ResponseStats {
    pub received: u64,
    pub matched: u64,
    pub suppressed: u64,
    pub triggered: u64,
    /// Matches whose workflow could not be submitted
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    matched: AtomicU64,
    suppressed: AtomicU64,
    triggered: AtomicU64,
    failed: AtomicU64,
}

struct Registered {
    seq: u64,
    pattern: ThreatResponsePattern,
}

pub struct ThreatResponseEngine {
    orchestrator: Arc<OrchestrationEngine>,
    /// Kept in evaluation order
    patterns: RwLock<Vec<Registered>>,
    next_seq: AtomicU64,
    /// Suppression deadline per (pattern id, correlation key)
    cooldowns: DashMap<(String, String), Instant>,
    /// Map size that triggers the next sweep of expired cooldowns
    next_sweep: AtomicUsize,
    default_cooldown: Duration,
    counters: Counters,
}

impl ThreatResponseEngine {
    pub fn new(orchestrator: Arc<OrchestrationEngine>, default_cooldown: Duration) -> Self {
        Self {
            orchestrator,
            patterns: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(0),
            cooldowns: DashMap::new(),
            next_sweep: AtomicUsize::new(SWEEP_FLOOR),
            default_cooldown,
            counters: Counters::default(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Registered>> {
        self.patterns.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Registered>> {
        self.patterns.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a pattern. Re-registering an id replaces it in place and keeps
    /// its original registration position.
    pub fn register_pattern(&self, pattern: ThreatResponsePattern) -> OrchestrationResult<()> {
        if self.orchestrator.definition(&pattern.workflow).is_none() {
            return Err(OrchestrationError::UnknownDefinition(pattern.workflow));
        }

        let mut patterns = self.write();
        match patterns.iter_mut().find(|r| r.pattern.id == pattern.id) {
            Some(existing) => existing.pattern = pattern,
            None => {
                let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                patterns.push(Registered { seq, pattern });
            }
        }
        patterns.sort_by(|a, b| {
            b.pattern
                .severity
                .cmp(&a.pattern.severity)
                .then(a.seq.cmp(&b.seq))
        });
        Ok(())
    }

    /// Register every pattern of a set; stops at the first failure
    pub fn load_patterns(&self, set: PatternSet) -> OrchestrationResult<usize> {
        let count = set.patterns.len();
        for pattern in set.patterns {
            self.register_pattern(pattern)?;
        }
        Ok(count)
    }

    pub fn remove_pattern(&self, id: &str) -> bool {
        let mut patterns = self.write();
        let before = patterns.len();
        patterns.retain(|r| r.pattern.id != id);
        let removed = patterns.len() != before;
        drop(patterns);
        if removed {
            self.cooldowns.retain(|(pattern_id, _), _| pattern_id != id);
        }
        removed
    }

    /// Patterns in evaluation order
    pub fn patterns(&self) -> Vec<ThreatResponsePattern> {
        self.read().iter().map(|r| r.pattern.clone()).collect()
    }

    pub fn stats(&self) -> ResponseStats {
        ResponseStats {
            received: self.counters.received.load(Ordering::Relaxed),
            matched: self.counters.matched.load(Ordering::Relaxed),
            suppressed: self.counters.suppressed.load(Ordering::Relaxed),
            triggered: self.counters.triggered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    fn first_match(&self, event: &ThreatEvent) -> Option<ThreatResponsePattern> {
        self.read()
            .iter()
            .find(|r| r.pattern.matches(event))
            .map(|r| r.pattern.clone())
    }

    /// True when this call claimed the cooldown slot
    fn claim_cooldown(&self, key: (String, String), window: Duration, now: Instant) -> bool {
        // Windows past the Instant range are treated as a year
        let until = now
            .checked_add(window)
            .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 3600));
        let inserted = match self.cooldowns.entry(key) {
            Entry::Occupied(mut slot) => {
                if now < *slot.get() {
                    return false;
                }
                slot.insert(until);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(until);
                true
            }
        };

        // Amortized: the map is swept each time it doubles past the floor
        if inserted && self.cooldowns.len() >= self.next_sweep.load(Ordering::Relaxed) {
            self.sweep_cooldowns(now);
        }
        true
    }

    fn sweep_cooldowns(&self, now: Instant) -> usize {
        let before = self.cooldowns.len();
        self.cooldowns.retain(|_, until| now < *until);
        let remaining = self.cooldowns.len();
        self.next_sweep
            .store((remaining * 2).max(SWEEP_FLOOR), Ordering::Relaxed);
        if remaining < before {
            tracing::debug!(expired = before - remaining, remaining, "Swept expired cooldowns");
        }
        before.saturating_sub(remaining)
    }

    /// Drop cooldowns whose window has passed; returns how many were dropped
    pub fn prune_cooldowns(&self) -> usize {
        self.sweep_cooldowns(Instant::now())
    }

    /// Cooldown slots currently held, expired or not
    pub fn cooldown_entries(&self) -> usize {
        self.cooldowns.len()
    }

    pub async fn submit(&self, event: ThreatEvent) -> OrchestrationResult<ResponseOutcome> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let Some(pattern) = self.first_match(&event) else {
            tracing::debug!(event_type = %event.event_type, "No pattern matched");
            return Ok(ResponseOutcome::NoMatch);
        };
        self.counters.matched.fetch_add(1, Ordering::Relaxed);

        let key = (pattern.id.clone(), event.correlation_key.clone());
        let window = pattern.cooldown().unwrap_or(self.default_cooldown);
        if !self.claim_cooldown(key.clone(), window, Instant::now()) {
            self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
            self.orchestrator.audit().record(AuditEntry::new(
                None,
                self.orchestrator.region(),
                AuditKind::Suppressed,
                json!({
                    "pattern_id": pattern.id,
                    "correlation_key": event.correlation_key,
                    "event_id": event.id,
                }),
            ));
            tracing::info!(
                pattern_id = %pattern.id,
                correlation_key = %event.correlation_key,
                "Threat event suppressed by cooldown"
            );
            return Ok(ResponseOutcome::Suppressed { pattern_id: pattern.id });
        }

        let result = match self.orchestrator.definition(&pattern.workflow) {
            Some(definition) => {
                let params = json!({ "event": event });
                self.orchestrator
                    .submit_definition(definition, params, Uuid::new_v4(), &format!("pattern:{}", pattern.id))
                    .await
            }
            None => Err(OrchestrationError::UnknownDefinition(pattern.workflow.clone())),
        };

        match result {
            Ok(workflow_id) => {
                self.counters.triggered.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    pattern_id = %pattern.id,
                    correlation_key = %event.correlation_key,
                    workflow_id = %workflow_id,
                    "Threat response triggered"
                );
                Ok(ResponseOutcome::Triggered {
                    pattern_id: pattern.id,
                    workflow_id,
                })
            }
            Err(e) => {
                // Nothing ran, so the incident must not stay suppressed
                self.cooldowns.remove(&key);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(pattern_id = %pattern.id, error = %e, "Failed to start response workflow");
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for ThreatResponseEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreatResponseEngine")
            .field("patterns", &self.read().len())
            .field("stats", &self.stats())
            .finish()
    }
}
