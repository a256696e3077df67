//! Logical versions for replicated entries

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Lamport-style version `(counter, writer)`.
///
/// The derived ordering compares the counter first and breaks ties on the
/// writer region id, giving a total order across all writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dot {
    pub counter: u64,
    pub writer: String,
}

impl Dot {
    pub fn new(counter: u64, writer: impl Into<String>) -> Self {
        Self {
            counter,
            writer: writer.into(),
        }
    }
}

impl fmt::Display for Dot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.writer)
    }
}

/// Causal relation between two version vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    Equal,
    Before,
    After,
    Concurrent,
}

/// Highest counter observed per writer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector(BTreeMap<String, u64>);

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, writer: &str) -> u64 {
        self.0.get(writer).copied().unwrap_or(0)
    }

    /// Record that `writer` produced `counter`
    pub fn observe(&mut self, writer: &str, counter: u64) {
        let slot = self.0.entry(writer.to_string()).or_insert(0);
        *slot = (*slot).max(counter);
    }

    /// Pointwise maximum
    pub fn join(&self, other: &VersionVector) -> VersionVector {
        let mut joined = self.clone();
        for (writer, counter) in &other.0 {
            joined.observe(writer, *counter);
        }
        joined
    }

    pub fn compare(&self, other: &VersionVector) -> Causality {
        let mut less = false;
        let mut greater = false;
        for writer in self.0.keys().chain(other.0.keys()) {
            match self.get(writer).cmp(&other.get(writer)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
        }
        match (less, greater) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::Before,
            (false, true) => Causality::After,
            (true, true) => Causality::Concurrent,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
