//! Cross-region workflow fan-out
//!
//! A definition whose steps carry region affinity is split into one sub-plan
//! per region. Each sub-plan runs on that region's engine as an ordinary
//! workflow, so a failing sub-plan is rolled back by its own executor. With
//! `global_rollback` the sub-plans that completed are undone as well, by
//! submitting a compensation workflow to their region.

use super::RegionDirectory;
use crate::error::CoordinationError;
use crate::models::workflow::{
    ErrorRecord, RollbackOutcome, WorkflowDefinition, WorkflowExecution, WorkflowState, WorkflowStep,
};
use crate::workflow::orchestrator::OrchestrationEngine;
use crate::workflow::validator::WorkflowValidator;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Options for [`RegionCoordinator::execute_cross_region`]
#[derive(Debug, Clone, Default)]
pub struct CrossRegionOptions {
    /// Submission parameters shared by every sub-plan
    pub params: Value,
    /// Region for steps without an affinity annotation
    pub default_region: Option<String>,
    /// Also compensate sub-plans that completed when another one failed
    pub global_rollback: bool,
}

/// Overall outcome of a cross-region run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    Completed,
    /// A sub-plan failed and every region was rolled back cleanly
    RolledBack,
    Failed,
}

/// Outcome of one region's sub-plan
#[derive(Debug, Clone, Serialize)]
pub struct SubPlanResult {
    pub region: String,
    pub workflow_id: Uuid,
    pub state: WorkflowState,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compensation_workflow: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compensation_state: Option<WorkflowState>,
}

impl SubPlanResult {
    fn rolled_back_cleanly(&self) -> bool {
        match self.state {
            WorkflowState::RolledBack => true,
            WorkflowState::Cancelled => matches!(
                self.error.as_ref().and_then(|e| e.rollback.as_ref()),
                Some(RollbackOutcome::Complete) | Some(RollbackOutcome::NotRequired)
            ),
            WorkflowState::Completed => self.compensation_state == Some(WorkflowState::Completed),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregatedResult {
    pub workflow: String,
    pub status: AggregateStatus,
    pub sub_plans: Vec<SubPlanResult>,
}

struct SubPlan {
    region: String,
    engine: Arc<OrchestrationEngine>,
    definition: WorkflowDefinition,
}

pub struct RegionCoordinator {
    directory: Arc<RegionDirectory>,
    region_timeout: Duration,
}

impl RegionCoordinator {
    pub fn new(directory: Arc<RegionDirectory>, region_timeout: Duration) -> Self {
        Self {
            directory,
            region_timeout,
        }
    }

    /// Split a definition into per-region sub-plans, in target order
    fn split(
        &self,
        definition: &WorkflowDefinition,
        targets: &[String],
        options: &CrossRegionOptions,
    ) -> Result<Vec<SubPlan>, CoordinationError> {
        if targets.is_empty() {
            return Err(CoordinationError::NoTargets);
        }

        let mut placement: HashMap<&str, &str> = HashMap::new();
        for step in &definition.steps {
            let region = step
                .region
                .as_deref()
                .or(options.default_region.as_deref())
                .ok_or_else(|| CoordinationError::MissingAffinity(step.id.clone()))?;
            if !targets.iter().any(|t| t == region) {
                return Err(CoordinationError::UntargetedRegion {
                    step: step.id.clone(),
                    region: region.to_string(),
                });
            }
            placement.insert(step.id.as_str(), region);
        }

        for step in &definition.steps {
            let region = placement[step.id.as_str()];
            for dep in &step.depends_on {
                if let Some(other) = placement.get(dep.as_str()) {
                    if *other != region {
                        return Err(CoordinationError::CrossRegionDependency {
                            step: step.id.clone(),
                            region: region.to_string(),
                            dependency: dep.clone(),
                            other_region: other.to_string(),
                        });
                    }
                }
            }
        }

        let mut plans = Vec::new();
        for region in targets {
            let steps: Vec<WorkflowStep> = definition
                .steps
                .iter()
                .filter(|s| placement.get(s.id.as_str()) == Some(&region.as_str()))
                .cloned()
                .collect();
            if steps.is_empty() {
                continue;
            }
            let engine = self
                .directory
                .get(region)
                .ok_or_else(|| CoordinationError::UnknownRegion(region.clone()))?;
            plans.push(SubPlan {
                region: region.clone(),
                engine,
                definition: WorkflowDefinition {
                    name: format!("{}@{}", definition.name, region),
                    description: definition.description.clone(),
                    steps,
                    max_concurrency: definition.max_concurrency,
                },
            });
        }
        Ok(plans)
    }

    pub async fn execute_cross_region(
        &self,
        definition: &WorkflowDefinition,
        targets: &[String],
        options: CrossRegionOptions,
    ) -> Result<AggregatedResult, CoordinationError> {
        for target in targets {
            if !self.directory.is_live(target) {
                return Err(CoordinationError::UnknownRegion(target.clone()));
            }
        }
        let plans = self.split(definition, targets, &options)?;
        let initiator = format!("coordinator:{}", definition.name);

        let mut submitted: Vec<(SubPlan, Uuid)> = Vec::with_capacity(plans.len());
        for plan in plans {
            let id = Uuid::new_v4();
            match plan
                .engine
                .submit_definition(plan.definition.clone(), options.params.clone(), id, &initiator)
                .await
            {
                Ok(id) => submitted.push((plan, id)),
                Err(e) => {
                    for (plan, id) in &submitted {
                        cancel_sub_plan(&plan.engine, &plan.region, *id);
                    }
                    return Err(e.into());
                }
            }
        }
        tracing::info!(
            workflow = %definition.name,
            regions = submitted.len(),
            "Cross-region workflow dispatched"
        );

        let waits = submitted
            .iter()
            .map(|(plan, id)| self.await_sub_plan(&plan.engine, &plan.region, *id));
        let mut results = join_all(waits).await;

        let any_failed = results.iter().any(|r| r.state != WorkflowState::Completed);
        if any_failed && options.global_rollback {
            let compensations = submitted
                .iter()
                .zip(results.iter_mut())
                .filter(|(_, result)| result.state == WorkflowState::Completed)
                .map(|((plan, _), result)| self.compensate_sub_plan(plan, result, &options.params, &initiator));
            join_all(compensations).await;
        }

        let status = if !any_failed {
            AggregateStatus::Completed
        } else if options.global_rollback && results.iter().all(SubPlanResult::rolled_back_cleanly) {
            AggregateStatus::RolledBack
        } else {
            AggregateStatus::Failed
        };
        if status != AggregateStatus::Completed {
            tracing::warn!(workflow = %definition.name, ?status, "Cross-region workflow did not complete");
        }

        Ok(AggregatedResult {
            workflow: definition.name.clone(),
            status,
            sub_plans: results,
        })
    }

    /// Wait for a sub-plan; cancel it if the region timeout elapses
    async fn await_sub_plan(&self, engine: &OrchestrationEngine, region: &str, id: Uuid) -> SubPlanResult {
        let (execution, timed_out) = match engine.wait_for_settled(id, self.region_timeout).await {
            Ok(execution) => (Some(execution), false),
            Err(_) => {
                tracing::warn!(workflow_id = %id, region = %region, "Sub-plan timed out, cancelling");
                cancel_sub_plan(engine, region, id);
                let settled = engine.wait_for_settled(id, self.region_timeout).await.ok();
                (settled.or_else(|| engine.get_status(id).ok()), true)
            }
        };
        sub_plan_result(region, id, execution, timed_out)
    }

    async fn compensate_sub_plan(
        &self,
        plan: &SubPlan,
        result: &mut SubPlanResult,
        params: &Value,
        initiator: &str,
    ) {
        let Some(definition) = compensation_workflow(&plan.definition) else {
            // Nothing to undo
            result.compensation_state = Some(WorkflowState::Completed);
            return;
        };
        let id = Uuid::new_v4();
        if let Err(e) = plan
            .engine
            .submit_definition(definition, params.clone(), id, initiator)
            .await
        {
            tracing::warn!(region = %plan.region, error = %e, "Failed to submit compensation workflow");
            return;
        }
        result.compensation_workflow = Some(id);
        result.compensation_state = plan
            .engine
            .wait_for_settled(id, self.region_timeout)
            .await
            .ok()
            .map(|e| e.state);
    }
}

/// Cancel a sub-plan; a rejected cancel is logged, not propagated
fn cancel_sub_plan(engine: &OrchestrationEngine, region: &str, id: Uuid) -> Option<WorkflowState> {
    match engine.cancel(id) {
        Ok(state) => Some(state),
        Err(e) => {
            tracing::debug!(workflow_id = %id, region = %region, error = %e, "Sub-plan cancel not applied");
            None
        }
    }
}

fn sub_plan_result(region: &str, id: Uuid, execution: Option<WorkflowExecution>, timed_out: bool) -> SubPlanResult {
    SubPlanResult {
        region: region.to_string(),
        workflow_id: id,
        state: execution.as_ref().map_or(WorkflowState::Failed, |e| e.state),
        timed_out,
        error: execution.and_then(|e| e.error),
        compensation_workflow: None,
        compensation_state: None,
    }
}

/// Sequential workflow running every compensation of `definition` in reverse
/// dependency order. `None` when no step declares one.
pub fn compensation_workflow(definition: &WorkflowDefinition) -> Option<WorkflowDefinition> {
    let order = WorkflowValidator::topological_order(definition)?;
    let mut steps: Vec<WorkflowStep> = Vec::new();
    for id in order.iter().rev() {
        let Some(compensation) = definition.step(id).and_then(|s| s.compensation.clone()) else {
            continue;
        };
        let source = definition.step(id)?;
        let mut step = WorkflowStep::new(format!("undo-{}", id), compensation.action)
            .with_params(compensation.params);
        step.retry_policy = source.retry_policy.clone();
        step.timeout_ms = source.timeout_ms;
        if let Some(previous) = steps.last() {
            step = step.depends_on(previous.id.clone());
        }
        steps.push(step);
    }
    if steps.is_empty() {
        return None;
    }
    Some(WorkflowDefinition {
        name: format!("{}:compensate", definition.name),
        description: Some(format!("Compensation of {}", definition.name)),
        steps,
        max_concurrency: Some(1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::workflow::ActionKind;

    fn coordinator() -> RegionCoordinator {
        RegionCoordinator::new(Arc::new(RegionDirectory::new()), Duration::from_secs(1))
    }

    #[test]
    fn test_split_rejects_cross_region_dependency() {
        let def = WorkflowDefinition::new(
            "span",
            vec![
                WorkflowStep::new("a", ActionKind::Noop).in_region("eu"),
                WorkflowStep::new("b", ActionKind::Noop).in_region("us").depends_on("a"),
            ],
        );
        let targets = vec!["eu".to_string(), "us".to_string()];
        let err = coordinator()
            .split(&def, &targets, &CrossRegionOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, CoordinationError::CrossRegionDependency { .. }));
    }

    #[test]
    fn test_split_requires_affinity_and_targets() {
        let def = WorkflowDefinition::new("span", vec![WorkflowStep::new("a", ActionKind::Noop)]);
        let targets = vec!["eu".to_string()];
        let err = coordinator()
            .split(&def, &targets, &CrossRegionOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, CoordinationError::MissingAffinity(_)));

        let err = coordinator()
            .split(&def, &[], &CrossRegionOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, CoordinationError::NoTargets));

        let def = WorkflowDefinition::new("span", vec![WorkflowStep::new("a", ActionKind::Noop).in_region("ap")]);
        let err = coordinator()
            .split(&def, &targets, &CrossRegionOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, CoordinationError::UntargetedRegion { .. }));
    }

    #[test]
    fn test_compensation_workflow_reverses_order() {
        let def = WorkflowDefinition::new(
            "contain",
            vec![
                WorkflowStep::new("block", ActionKind::BlockAddress)
                    .with_compensation(ActionKind::UnblockAddress, serde_json::json!({"address": "{{addr}}"})),
                WorkflowStep::new("notify", ActionKind::Notify).depends_on("block"),
                WorkflowStep::new("quarantine", ActionKind::QuarantinePeer)
                    .depends_on("notify")
                    .with_compensation(ActionKind::ReleasePeer, Value::Null),
            ],
        );
        let undo = compensation_workflow(&def).unwrap();
        let ids: Vec<&str> = undo.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["undo-quarantine", "undo-block"]);
        assert_eq!(undo.steps[0].action, ActionKind::ReleasePeer);
        assert_eq!(undo.steps[1].depends_on, vec!["undo-quarantine".to_string()]);

        let plain = WorkflowDefinition::new("plain", vec![WorkflowStep::new("a", ActionKind::Noop)]);
        assert!(compensation_workflow(&plain).is_none());
    }

    #[tokio::test]
    async fn test_rejected_sub_plan_cancel_is_reported() {
        use crate::context::RegionContext;
        use crate::models::configuration::Configuration;

        let ctx = RegionContext::builder(Configuration::default()).build().unwrap();
        let engine = OrchestrationEngine::new(&ctx).unwrap();
        assert_eq!(cancel_sub_plan(&engine, "local", Uuid::new_v4()), None);
    }
}
