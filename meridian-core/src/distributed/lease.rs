//! Exclusive, time-bound execution leases
//!
//! Leases are the one piece of coordination that needs linearizability. The
//! arbiter is a strongly consistent compare-and-set store holding entries in the
//! same format as [`DistributedState`]; every region of a cluster shares it.
//! Holders mirror their leases into their own replica so peers can see who owns
//! what through ordinary gossip.

use super::state::{keys, CasOutcome, DistributedState, StateEntry};
use super::version::Dot;
use crate::error::LeaseError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Linearizable compare-and-set store used for leases only
#[async_trait]
pub trait LeaseArbiter: Send + Sync {
    async fn compare_and_set(&self, key: &str, expected: Option<Dot>, value: Option<Value>) -> CasOutcome;

    async fn get(&self, key: &str) -> Option<StateEntry>;
}

#[async_trait]
impl LeaseArbiter for DistributedState {
    async fn compare_and_set(&self, key: &str, expected: Option<Dot>, value: Option<Value>) -> CasOutcome {
        DistributedState::compare_and_set(self, key, expected.as_ref(), value)
    }

    async fn get(&self, key: &str) -> Option<StateEntry> {
        self.entry(key)
    }
}

/// Lease payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub workflow_id: Uuid,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

fn decode(entry: &StateEntry) -> Option<Lease> {
    entry
        .value
        .as_ref()
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

/// Per-region lease client
pub struct LeaseManager {
    region: String,
    arbiter: Arc<dyn LeaseArbiter>,
    replica: Arc<DistributedState>,
    ttl: Duration,
    held: DashMap<Uuid, Dot>,
}

impl LeaseManager {
    pub fn new(
        region: impl Into<String>,
        arbiter: Arc<dyn LeaseArbiter>,
        replica: Arc<DistributedState>,
        ttl: Duration,
    ) -> Self {
        Self {
            region: region.into(),
            arbiter,
            replica,
            ttl,
            held: DashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn fresh_lease(&self, workflow_id: Uuid) -> Lease {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::seconds(1));
        Lease {
            workflow_id,
            holder: self.region.clone(),
            expires_at: Utc::now() + ttl,
        }
    }

    fn encode(&self, lease: &Lease) -> Result<Value, LeaseError> {
        serde_json::to_value(lease).map_err(|e| LeaseError::Encoding {
            key: keys::lease(&lease.workflow_id),
            reason: e.to_string(),
        })
    }

    fn mirror(&self, lease: &Lease) {
        if let Err(e) = self.replica.write_json(&keys::lease(&lease.workflow_id), lease) {
            tracing::warn!(workflow_id = %lease.workflow_id, error = %e, "Failed to mirror lease");
        }
    }

    /// Take the lease. Succeeds when it is free, expired, or left behind by an
    /// earlier incarnation of this region. A lease this manager holds is only
    /// extended through [`renew`](Self::renew).
    pub async fn acquire(&self, workflow_id: Uuid) -> Result<Lease, LeaseError> {
        let key = keys::lease(&workflow_id);
        if self.held.contains_key(&workflow_id) {
            return Err(LeaseError::Held {
                key,
                holder: self.region.clone(),
            });
        }
        let current = self.arbiter.get(&key).await;

        if let Some(existing) = current.as_ref().and_then(decode) {
            if existing.holder != self.region && !existing.is_expired_at(Utc::now()) {
                return Err(LeaseError::Held {
                    key,
                    holder: existing.holder,
                });
            }
        }

        let lease = self.fresh_lease(workflow_id);
        let value = self.encode(&lease)?;
        match self
            .arbiter
            .compare_and_set(&key, current.map(|e| e.version), Some(value))
            .await
        {
            CasOutcome::Written(entry) => {
                self.held.insert(workflow_id, entry.version);
                self.mirror(&lease);
                tracing::debug!(workflow_id = %workflow_id, region = %self.region, "Lease acquired");
                Ok(lease)
            }
            CasOutcome::Conflict(winner) => {
                let holder = winner
                    .as_ref()
                    .and_then(decode)
                    .map(|l| l.holder)
                    .unwrap_or_else(|| "unknown".to_string());
                Err(LeaseError::Held { key, holder })
            }
        }
    }

    /// Extend a lease this manager holds
    pub async fn renew(&self, workflow_id: Uuid) -> Result<Lease, LeaseError> {
        let key = keys::lease(&workflow_id);
        let expected = self
            .held
            .get(&workflow_id)
            .map(|d| d.value().clone())
            .ok_or_else(|| LeaseError::Lost { key: key.clone() })?;

        let lease = self.fresh_lease(workflow_id);
        let value = self.encode(&lease)?;
        match self.arbiter.compare_and_set(&key, Some(expected), Some(value)).await {
            CasOutcome::Written(entry) => {
                self.held.insert(workflow_id, entry.version);
                self.mirror(&lease);
                Ok(lease)
            }
            CasOutcome::Conflict(_) => {
                self.held.remove(&workflow_id);
                tracing::warn!(workflow_id = %workflow_id, region = %self.region, "Lease lost");
                Err(LeaseError::Lost { key })
            }
        }
    }

    /// Give up a lease. Releasing a lease we no longer hold is a no-op.
    pub async fn release(&self, workflow_id: Uuid) {
        let Some((_, expected)) = self.held.remove(&workflow_id) else {
            return;
        };
        let key = keys::lease(&workflow_id);
        if let CasOutcome::Written(_) = self.arbiter.compare_and_set(&key, Some(expected), None).await {
            self.replica.delete(&key);
            tracing::debug!(workflow_id = %workflow_id, region = %self.region, "Lease released");
        }
    }

    /// Forget held leases without releasing them (simulated crash)
    pub fn abandon_all(&self) {
        self.held.clear();
    }

    pub fn holds(&self, workflow_id: &Uuid) -> bool {
        self.held.contains_key(workflow_id)
    }

    pub async fn current(&self, workflow_id: Uuid) -> Option<Lease> {
        self.arbiter
            .get(&keys::lease(&workflow_id))
            .await
            .as_ref()
            .and_then(decode)
    }

    /// True when no live lease exists for the workflow at `now`
    pub async fn is_expired(&self, workflow_id: Uuid, now: DateTime<Utc>) -> bool {
        self.current(workflow_id)
            .await
            .map_or(true, |lease| lease.is_expired_at(now))
    }
}
