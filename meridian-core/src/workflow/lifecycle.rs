//! Workflow execution lifecycle
//!
//! ```text
//! CREATED -> QUEUED -> RUNNING <-> PAUSED
//! RUNNING -> COMPLETED            (all steps done)
//! any non-terminal -> FAILED -> ROLLED_BACK   (rollback clean)
//! any non-terminal -> CANCELLED
//! ```
//!
//! FAILED is not terminal: it rests there until the rollback outcome is
//! recorded and becomes ROLLED_BACK only when every compensation succeeded.
//! A cancel accepted while FAILED is still draining or compensating takes
//! the workflow to CANCELLED.

use crate::error::{MachineDefinitionError, TransitionRejection};
use crate::models::workflow::{
    RollbackOutcome, WorkflowEvent, WorkflowExecution, WorkflowState,
};
use crate::state_machine::{StateMachine, Transition, TransitionOutcome};
use chrono::Utc;

pub type LifecycleMachine = StateMachine<WorkflowState, WorkflowEvent, WorkflowExecution>;

fn rollback_clean(execution: &WorkflowExecution) -> bool {
    matches!(
        execution.error.as_ref().and_then(|e| e.rollback.as_ref()),
        Some(RollbackOutcome::Complete) | Some(RollbackOutcome::NotRequired)
    )
}

/// Build the workflow lifecycle machine
pub fn workflow_lifecycle() -> Result<LifecycleMachine, MachineDefinitionError> {
    use WorkflowEvent as E;
    use WorkflowState as S;

    let mut builder = StateMachine::builder("workflow")
        .states(WorkflowState::ALL)
        .initial(S::Created)
        .terminal(S::Completed)
        .terminal(S::RolledBack)
        .terminal(S::Cancelled)
        .transition(Transition::new(S::Created, E::Enqueue, S::Queued))
        .transition(Transition::new(S::Queued, E::Start, S::Running))
        .transition(Transition::new(S::Queued, E::Pause, S::Paused))
        .transition(Transition::new(S::Running, E::Pause, S::Paused))
        .transition(Transition::new(S::Paused, E::Resume, S::Running))
        .transition(
            Transition::new(S::Running, E::Complete, S::Completed)
                .with_guard(|exec: &WorkflowExecution| exec.all_steps_done()),
        )
        .transition(
            Transition::new(S::Failed, E::RollbackFinished, S::RolledBack).with_guard(rollback_clean),
        )
        .transition(
            Transition::new(S::Failed, E::Cancel, S::Cancelled)
                .with_guard(|exec: &WorkflowExecution| !exec.is_settled()),
        );

    for from in [S::Created, S::Queued, S::Running, S::Paused] {
        builder = builder
            .transition(Transition::new(from, E::Fail, S::Failed).with_action(
                |exec: &WorkflowExecution| {
                    tracing::warn!(workflow_id = %exec.id, workflow = %exec.definition.name, "Workflow failed");
                    Ok(())
                },
            ))
            .transition(Transition::new(from, E::Cancel, S::Cancelled));
    }

    builder.build()
}

impl WorkflowExecution {
    /// Fire a lifecycle event, updating state and timestamps on acceptance
    pub fn apply_event(
        &mut self,
        machine: &LifecycleMachine,
        event: WorkflowEvent,
    ) -> Result<TransitionOutcome<WorkflowState>, TransitionRejection> {
        let outcome = machine.transition(self.state, event, self)?;
        let now = Utc::now();
        self.state = outcome.to;
        self.updated_at = now;
        match outcome.to {
            WorkflowState::Running if self.started_at.is_none() => self.started_at = Some(now),
            WorkflowState::Completed
            | WorkflowState::Failed
            | WorkflowState::RolledBack
            | WorkflowState::Cancelled => self.completed_at = Some(now),
            _ => {}
        }
        Ok(outcome)
    }
}
