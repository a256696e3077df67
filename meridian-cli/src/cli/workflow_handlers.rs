//! Workflow command handlers

use anyhow::{Context, Result};
use meridian_core::context::RegionContext;
use meridian_core::models::workflow::{StepStatus, WorkflowDefinition, WorkflowExecution, WorkflowState};
use meridian_core::workflow::{ActionRegistry, OrchestrationEngine, WorkflowValidator};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::params::params_to_json;

/// Read a workflow definition from a YAML file
pub fn load_definition(path: &Path) -> Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflow file: {}", path.display()))?;
    WorkflowDefinition::from_yaml(&content)
        .with_context(|| format!("Failed to parse workflow YAML: {}", path.display()))
}

/// Every `*.yaml` / `*.yml` definition in `dir`, sorted by file name
pub fn load_definitions_dir(dir: &Path) -> Result<Vec<(PathBuf, WorkflowDefinition)>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read workflows directory: {}", dir.display()))?
    {
        let path = entry?.path();
        let is_yaml = matches!(path.extension().and_then(|s| s.to_str()), Some("yaml") | Some("yml"));
        if path.is_file() && is_yaml {
            paths.push(path);
        }
    }
    paths.sort();

    paths
        .into_iter()
        .map(|path| load_definition(&path).map(|definition| (path, definition)))
        .collect()
}

/// Single-region engine built from the configuration
pub fn local_engine(config: meridian_core::models::Configuration) -> Result<(RegionContext, Arc<OrchestrationEngine>)> {
    let ctx = RegionContext::builder(config).build()?;
    let engine = OrchestrationEngine::new(&ctx).context("Failed to start orchestration engine")?;
    Ok((ctx, engine))
}

/// Handle the 'validate' command
pub fn handle_validate(workflow_file: String, json: bool) -> Result<()> {
    let workflow = load_definition(Path::new(&workflow_file))?;
    let validation_result = WorkflowValidator::validate_workflow(&workflow);
    let unhandled: Vec<String> = ActionRegistry::with_builtin_handlers()
        .missing_kinds(&workflow)
        .iter()
        .map(|k| k.as_str().to_string())
        .collect();
    let order = WorkflowValidator::topological_order(&workflow);

    if json {
        let json_output = serde_json::json!({
            "valid": validation_result.is_valid(),
            "workflow": workflow.name,
            "file": workflow_file,
            "errors": validation_result.errors.iter().map(|e| serde_json::json!({
                "field": e.field,
                "message": e.message,
            })).collect::<Vec<_>>(),
            "warnings": validation_result.warnings,
            "unhandled_actions": unhandled,
            "execution_order": order,
        });
        println!("{}", serde_json::to_string_pretty(&json_output)?);
    } else {
        println!("Validating workflow: {}", workflow.name);
        println!("File: {}", workflow_file);
        println!();

        if validation_result.is_valid() {
            println!("✓ Workflow is valid");
            println!();
            println!("Summary:");
            println!("  Name:            {}", workflow.name);
            if let Some(desc) = &workflow.description {
                println!("  Description:     {}", desc);
            }
            println!("  Steps:           {}", workflow.steps.len());
            if let Some(order) = &order {
                println!("  Execution order: {}", order.join(" → "));
            }
            let compensated = workflow.steps.iter().filter(|s| s.compensation.is_some()).count();
            println!("  Compensated:     {}/{}", compensated, workflow.steps.len());
        } else {
            println!("✗ Workflow validation failed");
            println!();
            println!("Errors:");
            for error in &validation_result.errors {
                println!("  ✗ {}: {}", error.field, error.message);
            }
        }

        if !validation_result.warnings.is_empty() {
            println!();
            println!("Warnings:");
            for warning in &validation_result.warnings {
                println!("  ⚠  {}", warning);
            }
        }
        if !unhandled.is_empty() {
            println!();
            println!("Actions without a built-in handler: {}", unhandled.join(", "));
        }
    }

    if !validation_result.is_valid() {
        return Err(anyhow::anyhow!("Workflow validation failed"));
    }
    Ok(())
}

/// Handle the 'run' command
pub async fn handle_run(
    config: meridian_core::models::Configuration,
    workflow_file: String,
    params: Vec<(String, String)>,
    timeout_secs: u64,
    json: bool,
) -> Result<()> {
    let definition = load_definition(Path::new(&workflow_file))?;
    let name = definition.name.clone();
    let (_ctx, engine) = local_engine(config)?;
    engine
        .register_definition(definition)
        .with_context(|| format!("Workflow '{}' cannot be run", name))?;

    let params = params_to_json(&params);
    let workflow_id = engine
        .submit(&name, params)
        .await
        .context("Failed to start workflow")?;
    if !json {
        println!("▶ Started workflow '{}' ({})", name, workflow_id);
    }

    let execution = engine
        .wait_for_settled(workflow_id, Duration::from_secs(timeout_secs))
        .await;
    let execution = match execution {
        Ok(execution) => execution,
        Err(e) => {
            engine.shutdown();
            return Err(anyhow::anyhow!("Workflow {} did not settle: {}", workflow_id, e));
        }
    };
    let audit = engine.get_audit_trail(workflow_id);
    engine.shutdown();

    if json {
        let output = serde_json::json!({
            "workflow_id": workflow_id,
            "workflow": name,
            "state": execution.state,
            "steps": execution.steps,
            "outputs": execution.outputs(),
            "error": execution.error,
            "audit": audit,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_execution(&execution);
    }

    if execution.state != WorkflowState::Completed {
        return Err(anyhow::anyhow!("Workflow finished as {}", execution.state));
    }
    Ok(())
}

/// Human-readable execution summary
pub fn print_execution(execution: &WorkflowExecution) {
    println!();
    println!("Workflow Execution");
    println!("==================");
    println!("Workflow ID:  {}", execution.id);
    println!("Workflow:     {}", execution.definition.name);
    println!("Region:       {}", execution.region);
    println!("Initiator:    {}", execution.initiator);
    println!("State:        {}", execution.state);
    let duration = (execution.updated_at - execution.created_at).num_milliseconds();
    println!("Duration:     {} ms", duration);

    println!();
    println!("Steps:");
    for step in &execution.definition.steps {
        let status = execution.step_status(&step.id).unwrap_or(StepStatus::Pending);
        let marker = match status {
            StepStatus::Done => "✓",
            StepStatus::Compensated => "↺",
            StepStatus::Failed | StepStatus::RollbackFailed => "✗",
            _ => "·",
        };
        println!("  {} {:<20} {:<22} {:?}", marker, step.id, step.action.as_str(), status);
    }

    if let Some(error) = &execution.error {
        println!();
        println!("Error:");
        println!("  Stage:    {:?}", error.stage);
        if let Some(step_id) = &error.step_id {
            println!("  Step:     {}", step_id);
        }
        println!("  Cause:    {}", error.cause);
        if let Some(rollback) = &error.rollback {
            println!("  Rollback: {:?}", rollback);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CONTAIN: &str = r#"
name: contain
steps:
  - id: block
    action: block_address
    params:
      address: "{{source}}"
    compensation:
      action: unblock_address
      params:
        address: "{{source}}"
  - id: notify
    action: notify
    depends_on: [block]
"#;

    #[test]
    fn test_load_definitions_dir_skips_other_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.yaml"), CONTAIN.replace("contain", "second")).unwrap();
        std::fs::write(dir.path().join("a.yml"), CONTAIN).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a workflow").unwrap();

        let loaded = load_definitions_dir(dir.path()).unwrap();
        let names: Vec<&str> = loaded.iter().map(|(_, d)| d.name.as_str()).collect();
        assert_eq!(names, vec!["contain", "second"]);
    }

    #[test]
    fn test_load_definition_reports_path_on_bad_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "steps: [").unwrap();
        let err = load_definition(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("broken.yaml"));
    }

    #[tokio::test]
    async fn test_local_engine_runs_definition() {
        let (_ctx, engine) = local_engine(meridian_core::models::Configuration::default()).unwrap();
        engine
            .register_definition(WorkflowDefinition::from_yaml(CONTAIN).unwrap())
            .unwrap();
        let id = engine
            .submit("contain", serde_json::json!({ "source": "10.0.0.7" }))
            .await
            .unwrap();
        let execution = engine.wait_for_settled(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(execution.state, WorkflowState::Completed);
        assert_eq!(execution.step_status("block"), Some(StepStatus::Done));
    }
}
