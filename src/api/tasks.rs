/// Task queue endpoints

use crate::{
    api::reject,
    app::AppContext,
    runtime::{NewTask, QueueStats, TaskStatusReport},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};

pub fn create_task_routes() -> Router<AppContext> {
    Router::new()
        .route("/api/tasks", post(add_task))
        .route("/api/tasks/stats", get(queue_stats))
        .route("/api/tasks/{id}", get(task_status))
}

/// Enqueue a task
///
/// POST /api/tasks
/// Body: { "type": "workflow", "workflowId": "...", "payload": {...} }
async fn add_task(
    State(state): State<AppContext>,
    Json(new_task): Json<NewTask>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    if new_task.workflow_id.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let task_id = state.queue.add_task(new_task).await;
    Ok((StatusCode::ACCEPTED, Json(json!({ "taskId": task_id }))))
}

/// GET /api/tasks/{id}
async fn task_status(
    State(state): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<TaskStatusReport>, StatusCode> {
    state
        .queue
        .get_task_status(&id)
        .await
        .map(Json)
        .map_err(|e| reject("Task status lookup failed", e))
}

/// GET /api/tasks/stats
async fn queue_stats(State(state): State<AppContext>) -> Json<QueueStats> {
    Json(state.queue.get_queue_stats().await)
}
