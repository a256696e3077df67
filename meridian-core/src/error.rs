//! Error types for the orchestration engine

use crate::models::workflow::ActionKind;
use thiserror::Error;
use uuid::Uuid;

/// Reasons a state machine refused an event. Rejections never mutate state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionRejection {
    #[error("state '{state}' is terminal")]
    TerminalState { state: String },

    #[error("no transition from '{state}' on event '{event}'")]
    NoMatchingTransition { state: String, event: String },

    #[error("guard rejected transition from '{state}' on event '{event}'")]
    GuardFailed { state: String, event: String },
}

/// Errors raised while building a state machine definition
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MachineDefinitionError {
    #[error("state machine '{0}' has no states")]
    Empty(String),

    #[error("state machine '{0}' has no initial state")]
    NoInitialState(String),

    #[error("state '{state}' is referenced but not declared")]
    UndeclaredState { state: String },

    #[error("state '{state}' is unreachable from the initial state")]
    Unreachable { state: String },

    #[error("non-terminal state '{state}' has no outgoing transition")]
    DeadEnd { state: String },
}

/// Failure of an external action invocation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("action timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("no handler registered for action '{0}'")]
    Unregistered(ActionKind),
}

impl ActionError {
    /// Transient failures and timeouts are retried; everything else is final
    pub fn is_transient(&self) -> bool {
        matches!(self, ActionError::Transient(_) | ActionError::Timeout { .. })
    }
}

/// Errors raised when registering action handlers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("handler '{handler}' does not declare action '{kind}'")]
    UndeclaredKind { handler: String, kind: ActionKind },

    #[error("handler '{0}' declares no actions")]
    NoKinds(String),
}

/// Lease arbitration failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    #[error("lease '{key}' is held by '{holder}'")]
    Held { key: String, holder: String },

    #[error("lease '{key}' is no longer held by this executor")]
    Lost { key: String },

    #[error("lease '{key}' could not be encoded: {reason}")]
    Encoding { key: String, reason: String },
}

/// Errors surfaced by the orchestration engine
#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("workflow definition '{0}' is not registered")]
    UnknownDefinition(String),

    #[error("invalid workflow definition: {}", .0.join("; "))]
    InvalidDefinition(Vec<String>),

    #[error("workflow {0} not found")]
    NotFound(Uuid),

    #[error("workflow {workflow_id} is already executing on '{holder}'")]
    AlreadyExecuting { workflow_id: Uuid, holder: String },

    #[error("transition rejected: {0}")]
    Rejected(#[from] TransitionRejection),

    #[error("engine for region '{0}' is shut down")]
    ShutDown(String),

    #[error("timed out waiting for workflow {0} to settle")]
    WaitTimeout(Uuid),

    #[error(transparent)]
    Definition(#[from] MachineDefinitionError),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Placement failures from the load balancer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlacementError {
    #[error("no healthy region available")]
    NoHealthyRegion,
}

/// Errors raised while coordinating a cross-region workflow
#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("no target regions supplied")]
    NoTargets,

    #[error("no engine registered for region '{0}'")]
    UnknownRegion(String),

    #[error("step '{step}' targets region '{region}' which is not a target of this run")]
    UntargetedRegion { step: String, region: String },

    #[error("step '{0}' has no region affinity and no default region was given")]
    MissingAffinity(String),

    #[error("step '{step}' in '{region}' depends on '{dependency}' in '{other_region}'")]
    CrossRegionDependency {
        step: String,
        region: String,
        dependency: String,
        other_region: String,
    },

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),
}

/// Gossip transport failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer '{0}' is unreachable")]
    Unreachable(String),

    #[error("unknown peer '{0}'")]
    UnknownPeer(String),
}

/// Convenience result types
pub type OrchestrationResult<T> = std::result::Result<T, OrchestrationError>;
pub type ActionResult<T> = std::result::Result<T, ActionError>;
