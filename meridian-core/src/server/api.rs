//! Read-only HTTP status API

use crate::error::OrchestrationError;
use crate::models::workflow::{WorkflowExecution, WorkflowState};
use crate::region::registry::RegionRegistry;
use crate::response::engine::{ResponseStats, ThreatResponseEngine};
use crate::workflow::orchestrator::OrchestrationEngine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::Filter;

/// Services the API reads from
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<OrchestrationEngine>,
    pub registry: Arc<RegionRegistry>,
    pub response: Option<Arc<ThreatResponseEngine>>,
}

/// Health check response
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub region: String,
    pub active_workflows: usize,
    pub definitions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_stats: Option<ResponseStats>,
}

/// One row of GET /api/v1/workflows
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSummary {
    pub id: Uuid,
    pub workflow: String,
    pub state: WorkflowState,
    pub region: String,
    pub initiator: String,
    pub steps_done: usize,
    pub steps_total: usize,
    pub created_at: DateTime<Utc>,
}

impl From<&WorkflowExecution> for WorkflowSummary {
    fn from(execution: &WorkflowExecution) -> Self {
        Self {
            id: execution.id,
            workflow: execution.definition.name.clone(),
            state: execution.state,
            region: execution.region.clone(),
            initiator: execution.initiator.clone(),
            steps_done: execution.steps_in(crate::models::workflow::StepStatus::Done).len(),
            steps_total: execution.steps.len(),
            created_at: execution.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowsResponse {
    pub region: String,
    pub workflows: Vec<WorkflowSummary>,
    pub total_count: usize,
}

/// Create HTTP API routes
pub fn create_api_routes(state: ApiState) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let state_filter = warp::any().map(move || state.clone());

    // GET /api/v1/health
    let get_health = warp::path!("api" / "v1" / "health")
        .and(warp::get())
        .and(state_filter.clone())
        .and_then(handle_get_health);

    // GET /api/v1/workflows
    let get_workflows = warp::path!("api" / "v1" / "workflows")
        .and(warp::get())
        .and(state_filter.clone())
        .and_then(handle_get_workflows);

    // GET /api/v1/workflows/:id
    let get_workflow = warp::path!("api" / "v1" / "workflows" / Uuid)
        .and(warp::get())
        .and(state_filter.clone())
        .and_then(handle_get_workflow);

    // GET /api/v1/workflows/:id/audit
    let get_audit = warp::path!("api" / "v1" / "workflows" / Uuid / "audit")
        .and(warp::get())
        .and(state_filter.clone())
        .and_then(handle_get_audit);

    // GET /api/v1/regions
    let get_regions = warp::path!("api" / "v1" / "regions")
        .and(warp::get())
        .and(state_filter)
        .and_then(handle_get_regions);

    get_health
        .or(get_workflows)
        .or(get_workflow)
        .or(get_audit)
        .or(get_regions)
}

fn not_found(workflow_id: Uuid) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(
        warp::reply::json(&serde_json::json!({
            "error": "Workflow not found",
            "workflow_id": workflow_id.to_string()
        })),
        StatusCode::NOT_FOUND,
    )
}

/// Handle GET /api/v1/health
async fn handle_get_health(state: ApiState) -> Result<impl warp::Reply, warp::Rejection> {
    let region = state.engine.region().to_string();
    let status = state
        .registry
        .health(&region)
        .map(|h| h.to_string())
        .unwrap_or_else(|| "healthy".to_string());

    let response = HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        region,
        active_workflows: state.engine.active_count(),
        definitions: state.engine.list_definitions(),
        response_stats: state.response.as_ref().map(|r| r.stats()),
    };
    Ok(warp::reply::json(&response))
}

/// Handle GET /api/v1/workflows
async fn handle_get_workflows(state: ApiState) -> Result<impl warp::Reply, warp::Rejection> {
    let workflows: Vec<WorkflowSummary> = state
        .engine
        .list_active_workflows()
        .iter()
        .map(WorkflowSummary::from)
        .collect();
    let response = WorkflowsResponse {
        region: state.engine.region().to_string(),
        total_count: workflows.len(),
        workflows,
    };
    Ok(warp::reply::json(&response))
}

/// Handle GET /api/v1/workflows/:id
async fn handle_get_workflow(workflow_id: Uuid, state: ApiState) -> Result<impl warp::Reply, warp::Rejection> {
    match state.engine.get_status(workflow_id) {
        Ok(execution) => Ok(warp::reply::with_status(warp::reply::json(&execution), StatusCode::OK)),
        Err(OrchestrationError::NotFound(_)) => Ok(not_found(workflow_id)),
        Err(e) => Ok(warp::reply::with_status(
            warp::reply::json(&serde_json::json!({ "error": e.to_string() })),
            StatusCode::INTERNAL_SERVER_ERROR,
        )),
    }
}

/// Handle GET /api/v1/workflows/:id/audit
async fn handle_get_audit(workflow_id: Uuid, state: ApiState) -> Result<impl warp::Reply, warp::Rejection> {
    let entries = state.engine.get_audit_trail(workflow_id);
    if entries.is_empty() && state.engine.get_status(workflow_id).is_err() {
        return Ok(not_found(workflow_id));
    }
    Ok(warp::reply::with_status(
        warp::reply::json(&serde_json::json!({
            "workflow_id": workflow_id,
            "entries": entries,
        })),
        StatusCode::OK,
    ))
}

/// Handle GET /api/v1/regions
async fn handle_get_regions(state: ApiState) -> Result<impl warp::Reply, warp::Rejection> {
    Ok(warp::reply::json(&serde_json::json!({
        "regions": state.registry.statuses(),
    })))
}
