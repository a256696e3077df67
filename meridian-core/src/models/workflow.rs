//! Workflow orchestration data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Closed set of actions a workflow step can invoke
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Send an alert to an operator channel
    Notify,
    /// POST a JSON payload to an HTTP endpoint
    Webhook,
    /// Block a source address at the tunnel edge
    BlockAddress,
    /// Lift an address block
    UnblockAddress,
    /// Move a VPN peer into quarantine
    QuarantinePeer,
    /// Release a quarantined peer
    ReleasePeer,
    /// Rotate tunnel key material
    RotateKeys,
    /// Revoke an authenticated session
    RevokeSession,
    /// Ask the scoring service for a threat score
    ScoreThreat,
    /// Do nothing (placeholder steps, tests)
    Noop,
}

impl ActionKind {
    pub const ALL: [ActionKind; 10] = [
        ActionKind::Notify,
        ActionKind::Webhook,
        ActionKind::BlockAddress,
        ActionKind::UnblockAddress,
        ActionKind::QuarantinePeer,
        ActionKind::ReleasePeer,
        ActionKind::RotateKeys,
        ActionKind::RevokeSession,
        ActionKind::ScoreThreat,
        ActionKind::Noop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Notify => "notify",
            ActionKind::Webhook => "webhook",
            ActionKind::BlockAddress => "block_address",
            ActionKind::UnblockAddress => "unblock_address",
            ActionKind::QuarantinePeer => "quarantine_peer",
            ActionKind::ReleasePeer => "release_peer",
            ActionKind::RotateKeys => "rotate_keys",
            ActionKind::RevokeSession => "revoke_session",
            ActionKind::ScoreThreat => "score_threat",
            ActionKind::Noop => "noop",
        }
    }

    /// Actions with side effects on the protected network
    pub fn is_remediation(&self) -> bool {
        matches!(
            self,
            ActionKind::BlockAddress
                | ActionKind::UnblockAddress
                | ActionKind::QuarantinePeer
                | ActionKind::ReleasePeer
                | ActionKind::RotateKeys
                | ActionKind::RevokeSession
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle states of a workflow execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Created,
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    RolledBack,
    Cancelled,
}

impl WorkflowState {
    pub const ALL: [WorkflowState; 8] = [
        WorkflowState::Created,
        WorkflowState::Queued,
        WorkflowState::Running,
        WorkflowState::Paused,
        WorkflowState::Completed,
        WorkflowState::Failed,
        WorkflowState::RolledBack,
        WorkflowState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Created => "created",
            WorkflowState::Queued => "queued",
            WorkflowState::Running => "running",
            WorkflowState::Paused => "paused",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
            WorkflowState::RolledBack => "rolled_back",
            WorkflowState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events driving the workflow lifecycle machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEvent {
    Enqueue,
    Start,
    Pause,
    Resume,
    Complete,
    Fail,
    RollbackFinished,
    Cancel,
}

/// Workflow definition - reusable template for executions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    /// Unique workflow identifier
    pub name: String,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Steps in declaration order
    pub steps: Vec<WorkflowStep>,
    /// Maximum steps of one execution running at the same time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps,
            max_concurrency: None,
        }
    }

    /// Parse a definition from YAML
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(content).map_err(|e| anyhow::anyhow!("invalid workflow YAML: {}", e))
    }

    /// Look up a step by id
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Individual workflow step definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    /// Step id (unique within workflow)
    pub id: String,
    /// Action to invoke
    pub action: ActionKind,
    /// Action input parameters
    #[serde(default)]
    pub params: serde_json::Value,
    /// Steps that must be done before this one starts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Undo action run during rollback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<CompensatingAction>,
    /// Retry configuration for this step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Per-attempt timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Region affinity for cross-region execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, action: ActionKind) -> Self {
        Self {
            id: id.into(),
            action,
            params: serde_json::Value::Null,
            depends_on: Vec::new(),
            compensation: None,
            retry_policy: None,
            timeout_ms: None,
            region: None,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    pub fn with_compensation(mut self, action: ActionKind, params: serde_json::Value) -> Self {
        self.compensation = Some(CompensatingAction { action, params });
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn in_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

/// Compensating (undo) action for a step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompensatingAction {
    pub action: ActionKind,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first (1-10)
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds
    #[serde(default)]
    pub initial_delay_ms: u64,
    /// Whether to use exponential backoff
    #[serde(default)]
    pub exponential_backoff: bool,
    /// Multiplier for exponential backoff (1.0-10.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound for any single delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    600_000
}

impl RetryPolicy {
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_delay_ms(mut self, initial_delay_ms: u64) -> Self {
        self.initial_delay_ms = initial_delay_ms;
        self
    }

    pub fn exponential(mut self, multiplier: f64) -> Self {
        self.exponential_backoff = true;
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay before retrying after the given zero-based failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay_ms = if self.exponential_backoff {
            let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
            delay.min(self.max_delay_ms as f64) as u64
        } else {
            self.initial_delay_ms.min(self.max_delay_ms)
        };
        Duration::from_millis(delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 0,
            exponential_backoff: false,
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Per-step execution status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Failed,
    /// In flight when the workflow was cancelled; its effect may still land
    Interrupted,
    Compensated,
    RollbackFailed,
}

/// Runtime record of one step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub status: StepStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_error: Option<String>,
}

impl Default for StepRecord {
    fn default() -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: 0,
            started_at: None,
            ended_at: None,
            output: None,
            error: None,
            compensation_error: None,
        }
    }
}

/// Where a workflow-level failure originated
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStage {
    Step,
    Rollback,
    Cancellation,
    Failover,
}

/// Result of the rollback phase
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RollbackOutcome {
    /// No step needed compensation
    NotRequired,
    /// Every compensable step was compensated
    Complete,
    /// Some compensations failed
    Partial { failed_steps: Vec<String> },
    /// Rollback could not run (no region left to run it)
    NotAttempted,
}

/// Structured error record surfaced through the status API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorRecord {
    pub stage: ErrorStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub cause: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackOutcome>,
}

/// Runtime workflow execution instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowExecution {
    /// Unique execution identifier
    pub id: Uuid,
    /// Definition being executed
    pub definition: WorkflowDefinition,
    /// Submission parameters
    #[serde(default)]
    pub params: serde_json::Value,
    /// Lifecycle state
    pub state: WorkflowState,
    /// Region currently owning the execution
    pub region: String,
    /// Identity of the submitter
    pub initiator: String,
    /// Per-step records keyed by step id
    pub steps: BTreeMap<String, StepRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    /// Set when rollback left at least one step uncompensated
    #[serde(default)]
    pub partial_rollback: bool,
}

impl WorkflowExecution {
    pub fn new(
        id: Uuid,
        definition: WorkflowDefinition,
        params: serde_json::Value,
        region: impl Into<String>,
        initiator: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let steps = definition
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepRecord::default()))
            .collect();
        Self {
            id,
            definition,
            params,
            state: WorkflowState::Created,
            region: region.into(),
            initiator: initiator.into(),
            steps,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error: None,
            partial_rollback: false,
        }
    }

    /// True once no further work will happen for this execution.
    ///
    /// `Failed` and `Cancelled` only settle after the rollback outcome is recorded.
    pub fn is_settled(&self) -> bool {
        match self.state {
            WorkflowState::Completed | WorkflowState::RolledBack => true,
            WorkflowState::Failed | WorkflowState::Cancelled => self
                .error
                .as_ref()
                .is_some_and(|e| e.rollback.is_some()),
            _ => false,
        }
    }

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.steps.get(step_id).map(|r| r.status)
    }

    /// Ids of steps currently in the given status
    pub fn steps_in(&self, status: StepStatus) -> Vec<String> {
        self.steps
            .iter()
            .filter(|(_, r)| r.status == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn all_steps_done(&self) -> bool {
        self.steps.values().all(|r| r.status == StepStatus::Done)
    }

    /// Outputs of every step that produced one
    pub fn outputs(&self) -> serde_json::Map<String, serde_json::Value> {
        self.steps
            .iter()
            .filter_map(|(id, r)| r.output.clone().map(|o| (id.clone(), o)))
            .collect()
    }
}

/// Kinds of audit trail entries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Transition,
    StepStarted,
    StepRetried,
    StepSucceeded,
    StepFailed,
    StepInterrupted,
    Compensated,
    CompensationFailed,
    ActionFailed,
    LeaseContention,
    MergeConflict,
    Failover,
    FailoverFailed,
    Suppressed,
    Archived,
}

/// Audit trail record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    pub region: String,
    pub kind: AuditKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl AuditEntry {
    pub fn new(
        workflow_id: Option<Uuid>,
        region: impl Into<String>,
        kind: AuditKind,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            region: region.into(),
            kind,
            timestamp: Utc::now(),
            detail,
        }
    }
}
