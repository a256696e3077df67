//! Integration tests for step execution, retries, rollback and control

mod common;

use common::{GateHandler, ScriptedHandler};
use meridian_core::distributed::DistributedState;
use meridian_core::models::workflow::{
    ActionKind, AuditKind, ErrorStage, RetryPolicy, RollbackOutcome, StepStatus, WorkflowDefinition,
    WorkflowState, WorkflowStep,
};
use meridian_core::workflow::ActionRegistry;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const SETTLE: Duration = Duration::from_secs(5);

fn registry_with(handler: Arc<dyn meridian_core::workflow::ActionHandler>) -> Arc<ActionRegistry> {
    let actions = ActionRegistry::with_builtin_handlers();
    actions.register(handler).unwrap();
    Arc::new(actions)
}

/// block -> quarantine -> rotate, every step compensable
fn containment() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "contain",
        vec![
            WorkflowStep::new("a", ActionKind::BlockAddress)
                .with_params(json!({ "address": "{{event.source}}" }))
                .with_compensation(ActionKind::UnblockAddress, json!({ "address": "{{event.source}}" })),
            WorkflowStep::new("b", ActionKind::QuarantinePeer)
                .depends_on("a")
                .with_compensation(ActionKind::ReleasePeer, json!({})),
            WorkflowStep::new("c", ActionKind::RotateKeys)
                .depends_on("b")
                .with_compensation(ActionKind::RotateKeys, json!({})),
        ],
    )
}

fn remediation_kinds() -> Vec<ActionKind> {
    vec![
        ActionKind::BlockAddress,
        ActionKind::UnblockAddress,
        ActionKind::QuarantinePeer,
        ActionKind::ReleasePeer,
        ActionKind::RotateKeys,
    ]
}

#[tokio::test]
async fn test_linear_workflow_completes_in_order() {
    let handler = Arc::new(ScriptedHandler::new(&remediation_kinds()));
    let arbiter = Arc::new(DistributedState::new("arbiter"));
    let (_ctx, engine) = common::region(common::config("eu", &[]), arbiter, registry_with(handler.clone()));
    engine.register_definition(containment()).unwrap();

    let id = engine
        .submit("contain", json!({ "event": { "source": "10.0.0.7" } }))
        .await
        .unwrap();
    let execution = engine.wait_for_settled(id, SETTLE).await.unwrap();

    assert_eq!(execution.state, WorkflowState::Completed);
    assert!(execution.all_steps_done());
    for step in ["a", "b", "c"] {
        assert_eq!(handler.executions(step), 1);
        assert_eq!(handler.compensations(step), 0);
    }
    assert_eq!(execution.steps["a"].output, Some(json!({ "step": "a", "attempt": 1 })));
    assert!(execution.completed_at.is_some());
}

#[tokio::test]
async fn test_failed_step_rolls_back_completed_steps() {
    let handler = Arc::new(ScriptedHandler::new(&remediation_kinds()));
    handler.fail_step("b");
    let arbiter = Arc::new(DistributedState::new("arbiter"));
    let (_ctx, engine) = common::region(common::config("eu", &[]), arbiter, registry_with(handler.clone()));
    engine.register_definition(containment()).unwrap();

    let id = engine.submit("contain", json!({})).await.unwrap();
    let execution = engine.wait_for_settled(id, SETTLE).await.unwrap();

    assert_eq!(execution.state, WorkflowState::RolledBack);
    assert_eq!(handler.executions("a"), 1);
    assert_eq!(handler.compensations("a"), 1);
    assert_eq!(handler.executions("c"), 0, "steps after the failure never run");
    assert_eq!(handler.compensations("b"), 0, "the failed step is not compensated");

    assert_eq!(execution.step_status("a"), Some(StepStatus::Compensated));
    assert_eq!(execution.step_status("b"), Some(StepStatus::Failed));
    assert_eq!(execution.step_status("c"), Some(StepStatus::Pending));

    let error = execution.error.unwrap();
    assert_eq!(error.stage, ErrorStage::Step);
    assert_eq!(error.step_id.as_deref(), Some("b"));
    assert_eq!(error.rollback, Some(RollbackOutcome::Complete));
    assert!(!execution.partial_rollback);
}

#[tokio::test]
async fn test_failed_compensation_leaves_workflow_failed() {
    let handler = Arc::new(ScriptedHandler::new(&remediation_kinds()));
    handler.fail_step("c");
    handler.fail_compensation("a");
    let arbiter = Arc::new(DistributedState::new("arbiter"));
    let (_ctx, engine) = common::region(common::config("eu", &[]), arbiter, registry_with(handler.clone()));
    engine.register_definition(containment()).unwrap();

    let id = engine.submit("contain", json!({})).await.unwrap();
    let execution = engine.wait_for_settled(id, SETTLE).await.unwrap();

    assert_eq!(execution.state, WorkflowState::Failed);
    assert!(execution.partial_rollback);
    assert_eq!(execution.step_status("a"), Some(StepStatus::RollbackFailed));
    assert_eq!(execution.step_status("b"), Some(StepStatus::Compensated));
    assert!(execution.steps["a"].compensation_error.is_some());
    assert_eq!(
        execution.error.unwrap().rollback,
        Some(RollbackOutcome::Partial {
            failed_steps: vec!["a".to_string()]
        })
    );

    // Reverse dependency order: b is undone before a
    let trail = engine.get_audit_trail(id);
    let undo: Vec<String> = trail
        .iter()
        .filter(|e| matches!(e.kind, AuditKind::Compensated | AuditKind::CompensationFailed))
        .map(|e| e.detail["step_id"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(undo, vec!["b".to_string(), "a".to_string()]);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let handler = Arc::new(ScriptedHandler::new(&[ActionKind::ScoreThreat]));
    handler.flaky("score", 2);
    let arbiter = Arc::new(DistributedState::new("arbiter"));
    let (_ctx, engine) = common::region(common::config("eu", &[]), arbiter, registry_with(handler.clone()));
    engine
        .register_definition(WorkflowDefinition::new(
            "score",
            vec![WorkflowStep::new("score", ActionKind::ScoreThreat)
                .with_retry(RetryPolicy::attempts(3).with_delay_ms(5))],
        ))
        .unwrap();

    let id = engine.submit("score", json!({})).await.unwrap();
    let execution = engine.wait_for_settled(id, SETTLE).await.unwrap();

    assert_eq!(execution.state, WorkflowState::Completed);
    assert_eq!(execution.steps["score"].attempts, 3);
    assert_eq!(handler.executions("score"), 3);
    let retries = engine
        .get_audit_trail(id)
        .iter()
        .filter(|e| e.kind == AuditKind::StepRetried)
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_retries_exhausted_fail_the_workflow() {
    let handler = Arc::new(ScriptedHandler::new(&[ActionKind::ScoreThreat]));
    handler.flaky("score", 5);
    let arbiter = Arc::new(DistributedState::new("arbiter"));
    let (_ctx, engine) = common::region(common::config("eu", &[]), arbiter, registry_with(handler.clone()));
    engine
        .register_definition(WorkflowDefinition::new(
            "score",
            vec![WorkflowStep::new("score", ActionKind::ScoreThreat).with_retry(RetryPolicy::attempts(2))],
        ))
        .unwrap();

    let id = engine.submit("score", json!({})).await.unwrap();
    let execution = engine.wait_for_settled(id, SETTLE).await.unwrap();

    // Nothing to compensate, so the rollback is clean
    assert_eq!(execution.state, WorkflowState::RolledBack);
    assert_eq!(handler.executions("score"), 2);
    assert_eq!(execution.error.unwrap().rollback, Some(RollbackOutcome::NotRequired));
}

#[tokio::test]
async fn test_independent_steps_run_in_parallel_up_to_limit() {
    let handler = Arc::new(ScriptedHandler::new(&[ActionKind::RevokeSession]).with_delay(40));
    let arbiter = Arc::new(DistributedState::new("arbiter"));
    let (_ctx, engine) = common::region(common::config("eu", &[]), arbiter, registry_with(handler.clone()));

    let mut definition = WorkflowDefinition::new(
        "revoke-all",
        (0..6)
            .map(|i| WorkflowStep::new(format!("s{}", i), ActionKind::RevokeSession))
            .collect(),
    );
    definition.max_concurrency = Some(3);
    engine.register_definition(definition).unwrap();

    let id = engine.submit("revoke-all", json!({})).await.unwrap();
    let execution = engine.wait_for_settled(id, SETTLE).await.unwrap();

    assert_eq!(execution.state, WorkflowState::Completed);
    assert!(handler.peak_concurrency() > 1, "independent steps overlap");
    assert!(handler.peak_concurrency() <= 3, "concurrency limit is respected");
}

#[tokio::test]
async fn test_pause_holds_new_steps_until_resume() {
    let gate = Arc::new(GateHandler::new(&[ActionKind::BlockAddress]));
    let arbiter = Arc::new(DistributedState::new("arbiter"));
    let (_ctx, engine) = common::region(common::config("eu", &[]), arbiter, registry_with(gate.clone()));
    engine
        .register_definition(WorkflowDefinition::new(
            "gated",
            vec![
                WorkflowStep::new("first", ActionKind::BlockAddress),
                WorkflowStep::new("second", ActionKind::Noop).depends_on("first"),
            ],
        ))
        .unwrap();

    let id = engine.submit("gated", json!({})).await.unwrap();
    gate.entered().await;
    assert_eq!(engine.pause(id).unwrap(), WorkflowState::Paused);

    // The in-flight step finishes, but nothing new is started while paused
    gate.open();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let paused = engine.get_status(id).unwrap();
    assert_eq!(paused.state, WorkflowState::Paused);
    assert_eq!(paused.step_status("first"), Some(StepStatus::Done));
    assert_eq!(paused.step_status("second"), Some(StepStatus::Pending));

    assert_eq!(engine.resume(id).unwrap(), WorkflowState::Running);
    let execution = engine.wait_for_settled(id, SETTLE).await.unwrap();
    assert_eq!(execution.state, WorkflowState::Completed);
}

#[tokio::test]
async fn test_cancel_interrupts_and_compensates() {
    let gate = Arc::new(GateHandler::new(&[ActionKind::QuarantinePeer, ActionKind::ReleasePeer]));
    let scripted = Arc::new(ScriptedHandler::new(&[ActionKind::BlockAddress, ActionKind::UnblockAddress]));
    let actions = ActionRegistry::with_builtin_handlers();
    actions.register(gate.clone()).unwrap();
    actions.register(scripted.clone()).unwrap();
    let arbiter = Arc::new(DistributedState::new("arbiter"));
    let (_ctx, engine) = common::region(common::config("eu", &[]), arbiter, Arc::new(actions));
    engine
        .register_definition(WorkflowDefinition::new(
            "cancel-me",
            vec![
                WorkflowStep::new("block", ActionKind::BlockAddress)
                    .with_compensation(ActionKind::UnblockAddress, json!({})),
                WorkflowStep::new("quarantine", ActionKind::QuarantinePeer)
                    .depends_on("block")
                    .with_compensation(ActionKind::ReleasePeer, json!({})),
                WorkflowStep::new("notify", ActionKind::Notify).depends_on("quarantine"),
            ],
        ))
        .unwrap();

    let id = engine.submit("cancel-me", json!({})).await.unwrap();
    gate.entered().await;

    assert_eq!(engine.cancel(id).unwrap(), WorkflowState::Cancelled);
    let execution = engine.wait_for_settled(id, SETTLE).await.unwrap();

    assert_eq!(execution.state, WorkflowState::Cancelled);
    assert_eq!(execution.step_status("block"), Some(StepStatus::Compensated));
    assert_eq!(execution.step_status("quarantine"), Some(StepStatus::Compensated));
    assert_eq!(execution.step_status("notify"), Some(StepStatus::Pending));
    assert_eq!(scripted.compensations("block"), 1);

    let error = execution.error.unwrap();
    assert_eq!(error.stage, ErrorStage::Cancellation);
    assert_eq!(error.rollback, Some(RollbackOutcome::Complete));
    assert!(engine
        .get_audit_trail(id)
        .iter()
        .any(|e| e.kind == AuditKind::StepInterrupted));
}

#[tokio::test]
async fn test_cancel_while_failed_stops_the_drain() {
    let gate = Arc::new(GateHandler::new(&[ActionKind::QuarantinePeer, ActionKind::ReleasePeer]));
    let scripted = Arc::new(ScriptedHandler::new(&[
        ActionKind::BlockAddress,
        ActionKind::UnblockAddress,
        ActionKind::RotateKeys,
    ]));
    scripted.fail_step("rotate");
    let actions = ActionRegistry::with_builtin_handlers();
    actions.register(gate.clone()).unwrap();
    actions.register(scripted.clone()).unwrap();
    let arbiter = Arc::new(DistributedState::new("arbiter"));
    let (_ctx, engine) = common::region(common::config("eu", &[]), arbiter, Arc::new(actions));
    engine
        .register_definition(WorkflowDefinition::new(
            "fail-then-cancel",
            vec![
                WorkflowStep::new("block", ActionKind::BlockAddress)
                    .with_compensation(ActionKind::UnblockAddress, json!({})),
                WorkflowStep::new("rotate", ActionKind::RotateKeys).depends_on("block"),
                WorkflowStep::new("quarantine", ActionKind::QuarantinePeer)
                    .depends_on("block")
                    .with_compensation(ActionKind::ReleasePeer, json!({})),
            ],
        ))
        .unwrap();

    let id = engine.submit("fail-then-cancel", json!({})).await.unwrap();
    gate.entered().await;

    // rotate has failed while quarantine is still held in flight
    let mut draining = engine.get_status(id).unwrap();
    for _ in 0..100 {
        if draining.state == WorkflowState::Failed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        draining = engine.get_status(id).unwrap();
    }
    assert_eq!(draining.state, WorkflowState::Failed);
    assert!(!draining.is_settled());

    assert_eq!(engine.cancel(id).unwrap(), WorkflowState::Cancelled);
    let execution = engine.wait_for_settled(id, SETTLE).await.unwrap();

    assert_eq!(execution.state, WorkflowState::Cancelled);
    assert_eq!(execution.step_status("rotate"), Some(StepStatus::Failed));
    assert_eq!(execution.step_status("quarantine"), Some(StepStatus::Compensated));
    assert_eq!(execution.step_status("block"), Some(StepStatus::Compensated));
    assert_eq!(scripted.compensations("block"), 1);

    let error = execution.error.unwrap();
    assert_eq!(error.stage, ErrorStage::Step);
    assert_eq!(error.step_id.as_deref(), Some("rotate"));
    assert_eq!(error.rollback, Some(RollbackOutcome::Complete));
}

#[tokio::test]
async fn test_execution_is_replicated_and_archived() {
    let handler = Arc::new(ScriptedHandler::new(&remediation_kinds()));
    let arbiter = Arc::new(DistributedState::new("arbiter"));
    let (ctx, engine) = common::region(common::config("eu", &[]), arbiter, registry_with(handler));
    engine.register_definition(containment()).unwrap();

    let id = engine.submit("contain", json!({})).await.unwrap();
    engine.wait_for_settled(id, SETTLE).await.unwrap();

    let (replicated, _) = meridian_core::workflow::load_snapshot(&ctx.replica, &id).unwrap();
    assert_eq!(replicated.state, WorkflowState::Completed);
    assert_eq!(replicated.region, "eu");

    let archived = engine.audit().get_archived(id).unwrap();
    assert_eq!(archived.state, WorkflowState::Completed);
    let metrics = engine.audit().query_metrics(Some("contain"));
    assert_eq!(metrics.execution_count, 1);
    assert_eq!(metrics.success_count, 1);

    let transitions: Vec<String> = engine
        .get_audit_trail(id)
        .iter()
        .filter(|e| e.kind == AuditKind::Transition)
        .filter_map(|e| e.detail["to"].as_str().map(str::to_string))
        .collect();
    assert_eq!(transitions, vec!["queued", "running", "completed"]);
}
