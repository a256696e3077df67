//! Integration tests for event-driven threat response

mod common;

use meridian_core::distributed::DistributedState;
use meridian_core::error::OrchestrationError;
use meridian_core::models::event::{Severity, ThreatEvent};
use meridian_core::models::workflow::{ActionKind, AuditKind, WorkflowDefinition, WorkflowState, WorkflowStep};
use meridian_core::response::{
    FieldPredicate, PatternSet, PredicateOp, ResponseOutcome, ThreatResponseEngine, ThreatResponsePattern,
};
use meridian_core::workflow::{ActionRegistry, OrchestrationEngine};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn engine() -> Arc<OrchestrationEngine> {
    let arbiter = Arc::new(DistributedState::new("arbiter"));
    let (_ctx, engine) = common::region(
        common::config("eu", &[]),
        arbiter,
        Arc::new(ActionRegistry::with_builtin_handlers()),
    );
    engine
        .register_definition(WorkflowDefinition::new(
            "block-source",
            vec![
                WorkflowStep::new("block", ActionKind::BlockAddress)
                    .with_params(json!({ "address": "{{event.correlation_key}}" }))
                    .with_compensation(ActionKind::UnblockAddress, json!({ "address": "{{event.correlation_key}}" })),
                WorkflowStep::new("notify", ActionKind::Notify).depends_on("block"),
            ],
        ))
        .unwrap();
    engine
        .register_definition(WorkflowDefinition::new(
            "watch",
            vec![WorkflowStep::new("notify", ActionKind::Notify)],
        ))
        .unwrap();
    engine
}

fn brute_force(source: &str, attempts: u64) -> ThreatEvent {
    ThreatEvent::new(
        "brute_force",
        Severity::High,
        source,
        json!({ "attempts": attempts, "service": "ssh" }),
    )
}

#[tokio::test]
async fn test_duplicate_event_within_cooldown_is_suppressed() {
    let engine = engine();
    let response = ThreatResponseEngine::new(Arc::clone(&engine), Duration::from_secs(300));
    response
        .register_pattern(ThreatResponsePattern::new("ssh-brute", "brute_force", Severity::High, "block-source"))
        .unwrap();

    let first = response.submit(brute_force("10.0.0.7", 40)).await.unwrap();
    let workflow_id = match first {
        ResponseOutcome::Triggered { pattern_id, workflow_id } => {
            assert_eq!(pattern_id, "ssh-brute");
            workflow_id
        }
        other => panic!("expected a trigger, got {:?}", other),
    };

    let second = response.submit(brute_force("10.0.0.7", 41)).await.unwrap();
    assert_eq!(
        second,
        ResponseOutcome::Suppressed {
            pattern_id: "ssh-brute".to_string()
        }
    );

    // A different incident is not held back by the cooldown
    let other_source = response.submit(brute_force("10.0.0.8", 12)).await.unwrap();
    assert!(matches!(other_source, ResponseOutcome::Triggered { .. }));

    let stats = response.stats();
    assert_eq!(stats.received, 3);
    assert_eq!(stats.matched, 3);
    assert_eq!(stats.triggered, 2);
    assert_eq!(stats.suppressed, 1);
    assert_eq!(engine.audit().entries_of_kind(AuditKind::Suppressed).len(), 1);

    let execution = engine.wait_for_settled(workflow_id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(execution.state, WorkflowState::Completed);
    assert_eq!(execution.initiator, "pattern:ssh-brute");
    assert_eq!(execution.params["event"]["correlation_key"], json!("10.0.0.7"));
}

#[tokio::test]
async fn test_expired_cooldown_triggers_again() {
    let engine = engine();
    let response = ThreatResponseEngine::new(Arc::clone(&engine), Duration::from_secs(300));
    response
        .register_pattern(
            ThreatResponsePattern::new("ssh-brute", "brute_force", Severity::High, "block-source")
                .with_cooldown(Duration::ZERO),
        )
        .unwrap();

    let first = response.submit(brute_force("10.0.0.7", 40)).await.unwrap();
    let second = response.submit(brute_force("10.0.0.7", 41)).await.unwrap();
    assert!(matches!(first, ResponseOutcome::Triggered { .. }));
    assert!(matches!(second, ResponseOutcome::Triggered { .. }));
}

#[tokio::test]
async fn test_most_severe_pattern_wins() {
    let engine = engine();
    let response = ThreatResponseEngine::new(Arc::clone(&engine), Duration::from_secs(300));
    response
        .register_pattern(ThreatResponsePattern::new("watch-all", "brute_force", Severity::Low, "watch"))
        .unwrap();
    response
        .register_pattern(
            ThreatResponsePattern::new("block-heavy", "brute_force", Severity::Critical, "block-source")
                .with_predicate(FieldPredicate::new("attempts", PredicateOp::GreaterThan, json!(100))),
        )
        .unwrap();

    let heavy = response.submit(brute_force("10.0.0.9", 500)).await.unwrap();
    assert!(matches!(heavy, ResponseOutcome::Triggered { ref pattern_id, .. } if pattern_id == "block-heavy"));

    let light = response.submit(brute_force("10.0.0.10", 5)).await.unwrap();
    assert!(matches!(light, ResponseOutcome::Triggered { ref pattern_id, .. } if pattern_id == "watch-all"));

    let unknown = response
        .submit(ThreatEvent::new("port_scan", Severity::Low, "10.0.0.11", json!({})))
        .await
        .unwrap();
    assert_eq!(unknown, ResponseOutcome::NoMatch);
}

#[tokio::test]
async fn test_pattern_for_unknown_workflow_is_rejected() {
    let engine = engine();
    let response = ThreatResponseEngine::new(engine, Duration::from_secs(300));
    let err = response
        .register_pattern(ThreatResponsePattern::new("p", "brute_force", Severity::High, "missing"))
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::UnknownDefinition(name) if name == "missing"));
}

#[tokio::test]
async fn test_failed_submission_releases_cooldown() {
    let engine = engine();
    let response = ThreatResponseEngine::new(Arc::clone(&engine), Duration::from_secs(300));
    response
        .register_pattern(ThreatResponsePattern::new("ssh-brute", "brute_force", Severity::High, "block-source"))
        .unwrap();

    engine.shutdown();
    let err = response.submit(brute_force("10.0.0.7", 40)).await.unwrap_err();
    assert!(matches!(err, OrchestrationError::ShutDown(_)));
    assert_eq!(response.stats().failed, 1);

    // The slot was released, so the same incident is not reported as suppressed
    let again = response.submit(brute_force("10.0.0.7", 41)).await.unwrap_err();
    assert!(matches!(again, OrchestrationError::ShutDown(_)));
    assert_eq!(response.stats().suppressed, 0);
}

#[tokio::test]
async fn test_load_patterns_from_yaml() {
    let engine = engine();
    let response = ThreatResponseEngine::new(Arc::clone(&engine), Duration::from_secs(300));
    let set = PatternSet::from_yaml(
        r#"
patterns:
  - id: ssh-brute
    event_type: brute_force
    severity: high
    workflow: block-source
    cooldown_seconds: 60
    predicates:
      - field: service
        op: equals
        value: ssh
  - id: scan-watch
    event_type: port_scan
    severity: low
    workflow: watch
"#,
    )
    .unwrap();

    assert_eq!(response.load_patterns(set).unwrap(), 2);
    let ids: Vec<String> = response.patterns().into_iter().map(|p| p.id).collect();
    assert_eq!(ids, vec!["ssh-brute".to_string(), "scan-watch".to_string()]);

    assert!(response.remove_pattern("scan-watch"));
    assert!(!response.remove_pattern("scan-watch"));
    assert_eq!(response.patterns().len(), 1);
}
