//! Replicated key-scoped state with deterministic merge
//!
//! Every region holds a full replica. Local writes stamp a fresh [`Dot`] from a
//! Lamport clock; remote entries are folded in with [`merge`], which keeps the
//! entry with the highest dot and joins the version vectors. Because `max` and
//! pointwise join are both commutative, associative and idempotent, replicas
//! converge to identical contents once they have seen the same writes.

use super::gossip::{GossipMessage, GossipReply};
use super::outbox::Outbox;
use super::version::{Causality, Dot, VersionVector};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

const RECENT_CAPACITY: usize = 4096;
const CONFLICT_CAPACITY: usize = 1024;

/// Key layout shared by every region
pub mod keys {
    use uuid::Uuid;

    pub const WORKFLOW_PREFIX: &str = "workflow:";
    pub const LEASE_PREFIX: &str = "lease:";
    pub const REGION_METRICS_PREFIX: &str = "region-metrics:";

    pub fn workflow(id: &Uuid) -> String {
        format!("{}{}", WORKFLOW_PREFIX, id)
    }

    pub fn lease(id: &Uuid) -> String {
        format!("{}{}", LEASE_PREFIX, id)
    }

    pub fn region_metrics(region: &str) -> String {
        format!("{}{}", REGION_METRICS_PREFIX, region)
    }

    /// Workflow a `workflow:` or `lease:` key belongs to
    pub fn workflow_id(key: &str) -> Option<Uuid> {
        key.strip_prefix(WORKFLOW_PREFIX)
            .or_else(|| key.strip_prefix(LEASE_PREFIX))
            .and_then(|id| Uuid::parse_str(id).ok())
    }
}

/// One replicated entry. `value == None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub key: String,
    pub value: Option<Value>,
    /// Version of the winning write; `version.writer` is the last-write region
    pub version: Dot,
    /// Every write this entry has observed
    pub clock: VersionVector,
}

impl StateEntry {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    pub fn last_writer(&self) -> &str {
        &self.version.writer
    }
}

/// Concurrent write that lost a merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub key: String,
    pub winner: Dot,
    pub loser: Dot,
    pub discarded: Option<Value>,
    pub resolved_by: String,
    pub resolved_at: DateTime<Utc>,
}

/// Durable destination for resolved conflicts
pub trait ConflictSink: Send + Sync {
    fn record_conflict(&self, record: &ConflictRecord);
}

/// Result of merging two versions of the same key
#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult {
    pub entry: StateEntry,
    /// Present when the inputs were concurrent
    pub conflict: Option<(Dot, Option<Value>)>,
}

/// Deterministic merge of two versions of one key
pub fn merge(a: &StateEntry, b: &StateEntry) -> MergeResult {
    let (winner, loser) = if a.version >= b.version { (a, b) } else { (b, a) };
    let conflict = (a.clock.compare(&b.clock) == Causality::Concurrent)
        .then(|| (loser.version.clone(), loser.value.clone()));

    MergeResult {
        entry: StateEntry {
            key: winner.key.clone(),
            value: winner.value.clone(),
            version: winner.version.clone(),
            clock: a.clock.join(&b.clock),
        },
        conflict,
    }
}

/// Outcome of a compare-and-set
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    Written(StateEntry),
    /// Expected version did not match; carries the current entry
    Conflict(Option<StateEntry>),
}

/// One region's replica
pub struct DistributedState {
    region: String,
    entries: DashMap<String, StateEntry>,
    clock: AtomicU64,
    recent: Outbox<String>,
    /// Most recent conflicts; the sink keeps the full history
    conflicts: Outbox<ConflictRecord>,
    sink: OnceLock<Arc<dyn ConflictSink>>,
}

impl DistributedState {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            entries: DashMap::new(),
            clock: AtomicU64::new(0),
            recent: Outbox::new(RECENT_CAPACITY),
            conflicts: Outbox::new(CONFLICT_CAPACITY),
            sink: OnceLock::new(),
        }
    }

    /// Send every future conflict to `sink`. Only the first sink set is kept.
    pub fn set_conflict_sink(&self, sink: Arc<dyn ConflictSink>) -> bool {
        self.sink.set(sink).is_ok()
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn observe(&self, counter: u64) {
        self.clock.fetch_max(counter, Ordering::SeqCst);
    }

    /// Counter for a write over an entry currently at `current`.
    /// Must be called with the entry locked.
    fn tick_above(&self, current: &Dot) -> u64 {
        let counter = self.tick().max(current.counter + 1);
        self.observe(counter);
        counter
    }

    fn local_write(&self, key: &str, value: Option<Value>) -> Dot {
        let dot = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let counter = self.tick_above(&entry.version);
                let dot = Dot::new(counter, self.region.clone());
                entry.clock.observe(&self.region, counter);
                entry.value = value;
                entry.version = dot.clone();
                dot
            }
            Entry::Vacant(vacant) => {
                let counter = self.tick();
                let dot = Dot::new(counter, self.region.clone());
                let mut clock = VersionVector::new();
                clock.observe(&self.region, counter);
                vacant.insert(StateEntry {
                    key: key.to_string(),
                    value,
                    version: dot.clone(),
                    clock,
                });
                dot
            }
        };

        self.recent.push(key.to_string());
        dot
    }

    /// Write a value, returning its version
    pub fn write(&self, key: &str, value: Value) -> Dot {
        self.local_write(key, Some(value))
    }

    pub fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<Dot, serde_json::Error> {
        let value = serde_json::to_value(value)?;
        Ok(self.write(key, value))
    }

    /// Write a versioned tombstone
    pub fn delete(&self, key: &str) -> Dot {
        self.local_write(key, None)
    }

    /// Current value and version; tombstones read as absent
    pub fn read(&self, key: &str) -> Option<(Value, Dot)> {
        let entry = self.entries.get(key)?;
        let value = entry.value.clone()?;
        Some((value, entry.version.clone()))
    }

    pub fn read_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<(T, Dot)>, serde_json::Error> {
        match self.read(key) {
            Some((value, dot)) => Ok(Some((serde_json::from_value(value)?, dot))),
            None => Ok(None),
        }
    }

    /// Raw entry including tombstones
    pub fn entry(&self, key: &str) -> Option<StateEntry> {
        self.entries.get(key).map(|e| e.clone())
    }

    /// Fold a remote entry into the replica. Returns true if the local entry changed.
    pub fn apply_remote(&self, remote: StateEntry) -> bool {
        self.observe(remote.version.counter);

        let (changed, conflict) = match self.entries.entry(remote.key.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(remote);
                (true, None)
            }
            Entry::Occupied(mut occupied) => {
                let result = merge(occupied.get(), &remote);
                let conflict = result.conflict.map(|(loser, discarded)| ConflictRecord {
                    key: remote.key.clone(),
                    winner: result.entry.version.clone(),
                    loser,
                    discarded,
                    resolved_by: self.region.clone(),
                    resolved_at: Utc::now(),
                });
                if &result.entry == occupied.get() {
                    (false, conflict)
                } else {
                    occupied.insert(result.entry);
                    (true, conflict)
                }
            }
        };

        // Recorded outside the entry lock
        if let Some(record) = conflict {
            crate::services::logging::log_merge_conflict(&record);
            if let Some(sink) = self.sink.get() {
                sink.record_conflict(&record);
            }
            self.conflicts.push(record);
        }
        changed
    }

    /// Live keys starting with `prefix`, sorted
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().is_tombstone())
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Key to version summary of the whole replica
    pub fn digest(&self) -> BTreeMap<String, Dot> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().version.clone()))
            .collect()
    }

    /// Entries the digest owner has not seen
    pub fn entries_newer_than(&self, digest: &BTreeMap<String, Dot>) -> Vec<StateEntry> {
        self.entries
            .iter()
            .filter(|e| digest.get(e.key()).map_or(true, |seen| e.value().version > *seen))
            .map(|e| e.value().clone())
            .collect()
    }

    /// Keys where the digest owner holds a newer version than this replica
    pub fn wanted_from(&self, digest: &BTreeMap<String, Dot>) -> Vec<String> {
        digest
            .iter()
            .filter(|(key, dot)| {
                self.entries
                    .get(key.as_str())
                    .map_or(true, |local| **dot > local.version)
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Entries written locally since the last drain
    pub fn drain_recent(&self) -> Vec<StateEntry> {
        let mut keys = self.recent.drain();
        keys.sort();
        keys.dedup();
        keys.iter().filter_map(|k| self.entry(k)).collect()
    }

    /// Resolved conflicts still held for audit
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.conflicts.snapshot()
    }

    pub fn drain_conflicts(&self) -> Vec<ConflictRecord> {
        self.conflicts.drain()
    }

    /// Ordered copy of every entry
    pub fn snapshot(&self) -> BTreeMap<String, StateEntry> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Linearizable (per key) compare-and-set.
    ///
    /// `expected == None` matches a missing key. Used only by the lease arbiter.
    pub fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&Dot>,
        value: Option<Value>,
    ) -> CasOutcome {
        match self.entries.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return CasOutcome::Conflict(None);
                }
                let counter = self.tick();
                let mut clock = VersionVector::new();
                clock.observe(&self.region, counter);
                let entry = StateEntry {
                    key: key.to_string(),
                    value,
                    version: Dot::new(counter, self.region.clone()),
                    clock,
                };
                vacant.insert(entry.clone());
                CasOutcome::Written(entry)
            }
            Entry::Occupied(mut occupied) => {
                if expected != Some(&occupied.get().version) {
                    return CasOutcome::Conflict(Some(occupied.get().clone()));
                }
                let entry = occupied.get_mut();
                let counter = self.tick_above(&entry.version);
                entry.clock.observe(&self.region, counter);
                entry.value = value;
                entry.version = Dot::new(counter, self.region.clone());
                CasOutcome::Written(entry.clone())
            }
        }
    }

    /// Serve a gossip message from a peer
    pub fn handle_gossip(&self, message: GossipMessage) -> GossipReply {
        match message {
            GossipMessage::Push { from, entries } => {
                let received = entries.len();
                let changed = entries.into_iter().filter(|e| self.apply_remote(e.clone())).count();
                tracing::trace!(region = %self.region, peer = %from, received, changed, "Applied gossip push");
                GossipReply::default()
            }
            GossipMessage::Digest { from, digest } => {
                let reply = GossipReply {
                    entries: self.entries_newer_than(&digest),
                    wanted: self.wanted_from(&digest),
                };
                tracing::trace!(
                    region = %self.region,
                    peer = %from,
                    sending = reply.entries.len(),
                    wanted = reply.wanted.len(),
                    "Answered digest"
                );
                reply
            }
        }
    }
}

impl std::fmt::Debug for DistributedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedState")
            .field("region", &self.region)
            .field("entries", &self.entries.len())
            .field("clock", &self.clock.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_read_delete() {
        let state = DistributedState::new("eu");
        let v1 = state.write("k", json!(1));
        let (value, dot) = state.read("k").unwrap();
        assert_eq!(value, json!(1));
        assert_eq!(dot, v1);

        let v2 = state.delete("k");
        assert!(v2 > v1);
        assert!(state.read("k").is_none());
        assert!(state.entry("k").unwrap().is_tombstone());
    }

    #[test]
    fn test_sequential_writes_are_not_conflicts() {
        let eu = DistributedState::new("eu");
        let us = DistributedState::new("us");
        eu.write("k", json!("a"));
        us.apply_remote(eu.entry("k").unwrap());
        us.write("k", json!("b"));
        eu.apply_remote(us.entry("k").unwrap());

        assert_eq!(eu.read("k").unwrap().0, json!("b"));
        assert!(eu.conflicts().is_empty());
    }

    #[test]
    fn test_clock_advances_past_remote_counters() {
        let eu = DistributedState::new("eu");
        let us = DistributedState::new("us");
        for i in 0..5 {
            us.write("k", json!(i));
        }
        eu.apply_remote(us.entry("k").unwrap());
        let dot = eu.write("k", json!("later"));
        assert!(dot.counter > 5);
    }

    #[test]
    fn test_entry_version_never_regresses_under_racing_merges() {
        let eu = DistributedState::new("eu");
        let remote = |counter: u64| {
            let mut clock = VersionVector::new();
            clock.observe("us", counter);
            StateEntry {
                key: "k".to_string(),
                value: Some(json!(counter)),
                version: Dot::new(counter, "us"),
                clock,
            }
        };
        let done = AtomicU64::new(0);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..2_000 {
                    eu.write("k", json!(i));
                }
                done.fetch_add(1, Ordering::SeqCst);
            });
            scope.spawn(|| {
                for counter in 1..=2_000 {
                    eu.apply_remote(remote(counter * 2));
                }
                done.fetch_add(1, Ordering::SeqCst);
            });
            scope.spawn(|| {
                let mut last = Dot::new(0, "");
                while done.load(Ordering::SeqCst) < 2 {
                    if let Some(entry) = eu.entry("k") {
                        assert!(entry.version >= last, "{:?} after {:?}", entry.version, last);
                        last = entry.version;
                    }
                }
            });
        });

        let dot = eu.write("k", json!("final"));
        assert!(dot.counter > 4_000);
        assert_eq!(eu.read("k").unwrap().0, json!("final"));
    }

    #[test]
    fn test_conflicts_are_handed_to_the_sink() {
        struct Collect(std::sync::Mutex<Vec<ConflictRecord>>);
        impl ConflictSink for Collect {
            fn record_conflict(&self, record: &ConflictRecord) {
                self.0.lock().unwrap().push(record.clone());
            }
        }

        let sink = Arc::new(Collect(std::sync::Mutex::new(Vec::new())));
        let eu = DistributedState::new("eu");
        assert!(eu.set_conflict_sink(Arc::clone(&sink) as Arc<dyn ConflictSink>));
        assert!(!eu.set_conflict_sink(Arc::clone(&sink) as Arc<dyn ConflictSink>));

        let us = DistributedState::new("us");
        eu.write("k", json!("eu"));
        us.write("k", json!("us"));
        eu.apply_remote(us.entry("k").unwrap());

        let recorded = sink.0.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].loser, Dot::new(1, "eu"));
    }

    #[test]
    fn test_prefix_listing_skips_tombstones() {
        let state = DistributedState::new("eu");
        state.write("workflow:b", json!({}));
        state.write("workflow:a", json!({}));
        state.write("lease:a", json!({}));
        state.delete("workflow:b");
        assert_eq!(state.keys_with_prefix("workflow:"), vec!["workflow:a".to_string()]);
    }

    #[test]
    fn test_compare_and_set() {
        let state = DistributedState::new("arbiter");
        let first = match state.compare_and_set("lease:x", None, Some(json!("eu"))) {
            CasOutcome::Written(entry) => entry,
            other => panic!("unexpected {:?}", other),
        };
        assert!(matches!(
            state.compare_and_set("lease:x", None, Some(json!("us"))),
            CasOutcome::Conflict(Some(_))
        ));
        assert!(matches!(
            state.compare_and_set("lease:x", Some(&first.version), None),
            CasOutcome::Written(_)
        ));
    }

    #[test]
    fn test_digest_exchange() {
        let eu = DistributedState::new("eu");
        let us = DistributedState::new("us");
        eu.write("only-eu", json!(1));
        us.write("only-us", json!(2));

        let reply = us.handle_gossip(GossipMessage::Digest {
            from: "eu".to_string(),
            digest: eu.digest(),
        });
        assert_eq!(reply.entries.len(), 1);
        assert_eq!(reply.wanted, vec!["only-eu".to_string()]);
    }
}
