//! Threat response command handlers

use anyhow::{Context, Result};
use meridian_core::models::{Configuration, ThreatEvent, WorkflowState};
use meridian_core::response::{PatternSet, ResponseOutcome, ThreatResponseEngine};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::workflow_handlers::{load_definitions_dir, local_engine, print_execution};

/// Read a threat event from a JSON file
pub fn load_event(path: &Path) -> Result<ThreatEvent> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read event file: {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid threat event JSON: {}", path.display()))
}

/// Handle the 'trigger' command
pub async fn handle_trigger(
    config: Configuration,
    patterns: String,
    workflows: String,
    event: String,
    timeout_secs: u64,
    json: bool,
) -> Result<()> {
    let cooldown = config.pattern_cooldown();
    let (_ctx, engine) = local_engine(config)?;

    for (path, definition) in load_definitions_dir(Path::new(&workflows))? {
        let name = definition.name.clone();
        engine
            .register_definition(definition)
            .with_context(|| format!("Failed to register {} ({})", name, path.display()))?;
    }

    let response = ThreatResponseEngine::new(Arc::clone(&engine), cooldown);
    let loaded = response
        .load_patterns(PatternSet::load(Path::new(&patterns))?)
        .context("Failed to load response patterns")?;
    tracing::debug!(patterns = loaded, "Response patterns loaded");

    let event = load_event(Path::new(&event))?;
    let event_id = event.id;
    let outcome = response.submit(event).await.context("Failed to dispatch threat event")?;

    let execution = match &outcome {
        ResponseOutcome::Triggered { workflow_id, .. } => {
            let settled = engine
                .wait_for_settled(*workflow_id, Duration::from_secs(timeout_secs))
                .await;
            match settled {
                Ok(execution) => Some(execution),
                Err(e) => {
                    engine.shutdown();
                    return Err(anyhow::anyhow!("Workflow {} did not settle: {}", workflow_id, e));
                }
            }
        }
        _ => None,
    };
    engine.shutdown();

    if json {
        let output = serde_json::json!({
            "event_id": event_id,
            "outcome": outcome,
            "execution": execution,
            "stats": response.stats(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        match &outcome {
            ResponseOutcome::NoMatch => println!("No pattern matched event {}", event_id),
            ResponseOutcome::Suppressed { pattern_id } => {
                println!("Event {} suppressed by cooldown of pattern '{}'", event_id, pattern_id)
            }
            ResponseOutcome::Triggered { pattern_id, workflow_id } => {
                println!("⚡ Pattern '{}' triggered workflow {}", pattern_id, workflow_id);
            }
        }
        if let Some(execution) = &execution {
            print_execution(execution);
        }
    }

    if let Some(execution) = execution {
        if execution.state != WorkflowState::Completed {
            return Err(anyhow::anyhow!("Response workflow finished as {}", execution.state));
        }
    }
    Ok(())
}
