/// Workflow management REST API endpoints
///
/// Provides CRUD operations for workflow definitions. Every change re-syncs the
/// workflow's cron trigger, so schedules follow saves, toggles and deletes without
/// a restart.

use crate::{
    api::reject,
    app::AppContext,
    runtime::{CronTriggerStatus, WorkflowRun},
    workflow::{Workflow, WorkflowSummary},
};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Response for workflow creation/update operations
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResponse {
    pub id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron_trigger: Option<CronTriggerStatus>,
}

/// Request body for workflow creation
#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    pub workflow: Workflow,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronRequest {
    pub cron_expression: String,
}

/// Create workflow management routes
pub fn create_workflow_routes() -> Router<AppContext> {
    Router::new()
        .route("/api/workflows", post(create_workflow).get(list_workflows))
        .route(
            "/api/workflows/{id}",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
        .route("/api/workflows/{id}/enable", post(enable_workflow))
        .route("/api/workflows/{id}/disable", post(disable_workflow))
        .route("/api/workflows/{id}/trigger", post(trigger_workflow))
        .route("/api/workflows/{id}/cron", put(upsert_cron).delete(remove_cron))
}

/// Create a new workflow
///
/// POST /api/workflows
/// Body: { "workflow": { "id": "...", "name": "...", "trigger": {...}, "steps": [...] } }
async fn create_workflow(
    State(state): State<AppContext>,
    Json(payload): Json<CreateWorkflowRequest>,
) -> Result<Json<WorkflowResponse>, StatusCode> {
    let workflow = payload.workflow;

    // Check if workflow already exists
    match state.store.get_workflow(&workflow.id).await {
        Ok(Some(_)) => return Err(StatusCode::CONFLICT),
        Ok(None) => {}
        Err(e) => {
            tracing::error!("Failed to look up workflow {}: {}", workflow.id, e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    let cron_trigger = state
        .save_workflow(&workflow)
        .await
        .map_err(|e| reject(&format!("Failed to create workflow {}", workflow.id), e))?;

    Ok(Json(WorkflowResponse {
        id: workflow.id.clone(),
        message: format!("Workflow '{}' created successfully", workflow.name),
        cron_trigger,
    }))
}

/// List all workflows
///
/// GET /api/workflows
async fn list_workflows(
    State(state): State<AppContext>,
) -> Result<Json<Vec<WorkflowSummary>>, StatusCode> {
    match state.store.list_workflows().await {
        Ok(workflows) => Ok(Json(workflows)),
        Err(e) => {
            tracing::error!("Failed to list workflows: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /api/workflows/{id}
async fn get_workflow(
    State(state): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<Workflow>, StatusCode> {
    match state.store.get_workflow(&id).await {
        Ok(Some(workflow)) => Ok(Json(workflow)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to get workflow {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Update an existing workflow
///
/// PUT /api/workflows/{id}
async fn update_workflow(
    State(state): State<AppContext>,
    Path(id): Path<String>,
    Json(payload): Json<CreateWorkflowRequest>,
) -> Result<Json<WorkflowResponse>, StatusCode> {
    let mut workflow = payload.workflow;

    // Ensure the workflow ID matches the URL parameter
    workflow.id = id.clone();

    match state.store.get_workflow(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to look up workflow {}: {}", id, e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    let cron_trigger = state
        .save_workflow(&workflow)
        .await
        .map_err(|e| reject(&format!("Failed to update workflow {}", id), e))?;

    Ok(Json(WorkflowResponse {
        id,
        message: format!("Workflow '{}' updated successfully", workflow.name),
        cron_trigger,
    }))
}

/// DELETE /api/workflows/{id}
async fn delete_workflow(
    State(state): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match state.delete_workflow(&id).await {
        Ok(true) => Ok(Json(json!({ "message": "Workflow deleted successfully" }))),
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(e) => Err(reject(&format!("Failed to delete workflow {}", id), e)),
    }
}

/// POST /api/workflows/{id}/enable
async fn enable_workflow(
    State(state): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<Workflow>, StatusCode> {
    state
        .set_workflow_enabled(&id, true)
        .await
        .map(Json)
        .map_err(|e| reject(&format!("Failed to enable workflow {}", id), e))
}

/// POST /api/workflows/{id}/disable
async fn disable_workflow(
    State(state): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<Workflow>, StatusCode> {
    state
        .set_workflow_enabled(&id, false)
        .await
        .map(Json)
        .map_err(|e| reject(&format!("Failed to disable workflow {}", id), e))
}

/// Fire a workflow manually and wait for the run
///
/// POST /api/workflows/{id}/trigger
/// Body: optional JSON payload exposed to steps as `{{trigger.*}}`
async fn trigger_workflow(
    State(state): State<AppContext>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<WorkflowRun>, StatusCode> {
    let payload: Value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            tracing::warn!("❌ Invalid JSON payload for manual run of {}: {}", id, e);
            StatusCode::BAD_REQUEST
        })?
    };
    state
        .scheduler
        .trigger_workflow(&id, payload)
        .await
        .map(Json)
        .map_err(|e| reject(&format!("Manual run of workflow {} failed", id), e))
}

/// Bind the workflow to a cron schedule
///
/// PUT /api/workflows/{id}/cron
/// Body: { "cronExpression": "*/5 * * * *" }
///
/// The schedule is stored as the workflow's trigger, so it survives later edits
/// and enable/disable toggles.
async fn upsert_cron(
    State(state): State<AppContext>,
    Path(id): Path<String>,
    Json(request): Json<CronRequest>,
) -> Result<Json<WorkflowResponse>, StatusCode> {
    let (workflow, cron_trigger) = state
        .set_workflow_cron(&id, &request.cron_expression)
        .await
        .map_err(|e| reject(&format!("Failed to schedule workflow {}", id), e))?;

    Ok(Json(WorkflowResponse {
        id,
        message: format!("Workflow '{}' scheduled", workflow.name),
        cron_trigger,
    }))
}

/// Remove the workflow's cron schedule; it becomes manually triggered
///
/// DELETE /api/workflows/{id}/cron
async fn remove_cron(
    State(state): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let removed = state
        .clear_workflow_cron(&id)
        .await
        .map_err(|e| reject(&format!("Failed to unschedule workflow {}", id), e))?;
    Ok(Json(json!({ "removed": removed })))
}
