//! Durable audit log stored as JSON lines
//!
//! Every entry and archived execution is appended as one line under an
//! exclusive file lock. Memory holds only the most recent history.

use crate::distributed::{keys, ConflictRecord, ConflictSink};
use crate::models::workflow::{AuditEntry, AuditKind, WorkflowExecution, WorkflowState};
use crate::services::logging::{log_audit_event, log_error};
use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const DEFAULT_RETAINED_ENTRIES: usize = 10_000;
const DEFAULT_RETAINED_EXECUTIONS: usize = 1_000;

/// One line of the store file
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "record", content = "data", rename_all = "snake_case")]
enum AuditRecord {
    Entry(AuditEntry),
    Archived(WorkflowExecution),
}

/// Retained in-memory view, oldest first
#[derive(Debug, Default)]
struct History {
    archived: VecDeque<WorkflowExecution>,
    entries: VecDeque<AuditEntry>,
}

impl History {
    fn apply(&mut self, record: AuditRecord) {
        match record {
            AuditRecord::Entry(entry) => self.entries.push_back(entry),
            AuditRecord::Archived(execution) => {
                match self.archived.iter_mut().find(|e| e.id == execution.id) {
                    Some(existing) => *existing = execution,
                    None => self.archived.push_back(execution),
                }
            }
        }
    }

    fn trim(&mut self, max_entries: usize, max_archived: usize) {
        while self.entries.len() > max_entries {
            self.entries.pop_front();
        }
        while self.archived.len() > max_archived {
            self.archived.pop_front();
        }
    }
}

/// Append-only audit log, optionally backed by a file
pub struct AuditLog {
    /// Path to the JSON lines file; `None` keeps everything in memory
    store_path: Option<PathBuf>,
    history: Mutex<History>,
    max_entries: usize,
    max_archived: usize,
}

impl AuditLog {
    /// Audit log that never touches disk
    pub fn in_memory() -> Self {
        Self {
            store_path: None,
            history: Mutex::new(History::default()),
            max_entries: DEFAULT_RETAINED_ENTRIES,
            max_archived: DEFAULT_RETAINED_EXECUTIONS,
        }
    }

    /// Open (or create) a file-backed audit log
    pub fn new<P: AsRef<Path>>(store_path: P) -> Result<Self> {
        let store_path = store_path.as_ref().to_path_buf();

        if let Some(parent) = store_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create audit store directory")?;
        }

        let history = if store_path.exists() {
            Self::load_history(&store_path)?
        } else {
            History::default()
        };

        let log = Self {
            store_path: Some(store_path),
            history: Mutex::new(history),
            max_entries: DEFAULT_RETAINED_ENTRIES,
            max_archived: DEFAULT_RETAINED_EXECUTIONS,
        };
        log.lock().trim(log.max_entries, log.max_archived);
        Ok(log)
    }

    /// Bound the in-memory history. The store file is never trimmed.
    pub fn with_retention(mut self, max_entries: usize, max_archived: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self.max_archived = max_archived.max(1);
        let (entries, archived) = (self.max_entries, self.max_archived);
        self.lock().trim(entries, archived);
        self
    }

    /// Replay the store file under a shared lock. A torn final line is skipped.
    fn load_history(path: &Path) -> Result<History> {
        let file = File::open(path).context("Failed to open audit store file")?;

        file.lock_shared()
            .context("Failed to acquire read lock on audit store")?;

        let lines = BufReader::new(file)
            .lines()
            .collect::<std::io::Result<Vec<_>>>()
            .context("Failed to read audit store")?;

        let mut history = History::default();
        let last = lines.len().saturating_sub(1);
        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditRecord>(line) {
                Ok(record) => history.apply(record),
                Err(e) if index == last => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping torn audit record");
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to parse audit store line {}", index + 1)
                    });
                }
            }
        }
        Ok(history)
    }

    fn lock(&self) -> MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append one record to the store file with file locking
    fn write_record(&self, record: &AuditRecord) -> Result<()> {
        let Some(path) = &self.store_path else {
            return Ok(());
        };

        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .context("Failed to open audit store file for appending")?;

        file.lock_exclusive()
            .context("Failed to acquire write lock on audit store")?;

        let mut line = serde_json::to_string(record).context("Failed to serialize audit record")?;
        line.push('\n');

        let mut writer = std::io::BufWriter::new(&file);
        writer
            .write_all(line.as_bytes())
            .context("Failed to write audit store")?;
        writer
            .flush()
            .context("Failed to flush audit store to disk")?;

        Ok(())
    }

    /// Persist a record, then apply it to the retained history
    fn commit(&self, record: AuditRecord) -> Result<()> {
        let mut history = self.lock();
        self.write_record(&record)?;
        history.apply(record);
        history.trim(self.max_entries, self.max_archived);
        Ok(())
    }

    /// Append one entry
    pub fn append(&self, entry: AuditEntry) -> Result<()> {
        log_audit_event(&entry);
        self.commit(AuditRecord::Entry(entry))
    }

    /// Append an entry, logging instead of propagating storage errors
    pub fn record(&self, entry: AuditEntry) {
        if let Err(e) = self.append(entry) {
            log_error(&e.to_string(), Some("audit append"));
        }
    }

    /// Store the final form of a settled execution
    pub fn archive_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let entry = AuditEntry::new(
            Some(execution.id),
            execution.region.clone(),
            AuditKind::Archived,
            serde_json::json!({
                "state": execution.state,
                "partial_rollback": execution.partial_rollback,
            }),
        );
        self.commit(AuditRecord::Archived(execution.clone()))?;
        self.append(entry)
    }

    /// Audit trail of one workflow in append order
    pub fn entries_for(&self, workflow_id: Uuid) -> Vec<AuditEntry> {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.workflow_id == Some(workflow_id))
            .cloned()
            .collect()
    }

    /// Entries of a given kind across all workflows
    pub fn entries_of_kind(&self, kind: AuditKind) -> Vec<AuditEntry> {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    pub fn get_archived(&self, workflow_id: Uuid) -> Option<WorkflowExecution> {
        self.lock()
            .archived
            .iter()
            .find(|e| e.id == workflow_id)
            .cloned()
    }

    pub fn archived(&self) -> Vec<WorkflowExecution> {
        self.lock().archived.iter().cloned().collect()
    }

    /// Query metrics over archived executions
    pub fn query_metrics(&self, workflow_name: Option<&str>) -> WorkflowMetrics {
        let history = self.lock();

        let executions: Vec<_> = history
            .archived
            .iter()
            .filter(|e| workflow_name.map_or(true, |w| e.definition.name == w))
            .collect();

        let total = executions.len();
        let success = executions
            .iter()
            .filter(|e| e.state == WorkflowState::Completed)
            .count();
        let failed = executions
            .iter()
            .filter(|e| {
                matches!(
                    e.state,
                    WorkflowState::Failed | WorkflowState::RolledBack | WorkflowState::Cancelled
                )
            })
            .count();

        let durations: Vec<_> = executions
            .iter()
            .filter_map(|e| {
                let started = e.started_at.unwrap_or(e.created_at);
                e.completed_at
                    .map(|completed| (completed - started).num_milliseconds().max(0) as u64)
            })
            .collect();

        let avg_duration_ms = if !durations.is_empty() {
            durations.iter().sum::<u64>() / durations.len() as u64
        } else {
            0
        };

        WorkflowMetrics {
            execution_count: total,
            success_count: success,
            failure_count: failed,
            avg_duration_ms,
        }
    }
}

impl ConflictSink for AuditLog {
    fn record_conflict(&self, record: &ConflictRecord) {
        self.record(AuditEntry::new(
            keys::workflow_id(&record.key),
            record.resolved_by.clone(),
            AuditKind::MergeConflict,
            serde_json::json!(record),
        ));
    }
}

/// Workflow execution metrics
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowMetrics {
    pub execution_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub avg_duration_ms: u64,
}

impl WorkflowMetrics {
    /// Percentage of executions that did not complete (0.0 to 100.0).
    /// Rolled back and cancelled executions count as failures.
    pub fn failure_rate(&self) -> f64 {
        if self.execution_count == 0 {
            return 0.0;
        }
        (self.failure_count as f64 / self.execution_count as f64) * 100.0
    }

    /// Percentage of executions that completed (0.0 to 100.0)
    pub fn success_rate(&self) -> f64 {
        if self.execution_count == 0 {
            return 0.0;
        }
        (self.success_count as f64 / self.execution_count as f64) * 100.0
    }
}
