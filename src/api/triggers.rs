/// Cron trigger introspection and schedule helpers

use crate::{
    api::reject,
    app::AppContext,
    runtime::{generate_cron_expression, next_fire_times, CronSpec, CronTriggerStatus},
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const DEFAULT_PREVIEW_COUNT: usize = 5;
const MAX_PREVIEW_COUNT: usize = 50;

#[derive(Debug, Deserialize)]
pub struct PreviewQuery {
    pub expression: String,
    pub count: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulePreview {
    pub expression: String,
    pub next_runs: Vec<DateTime<Utc>>,
}

pub fn create_trigger_routes() -> Router<AppContext> {
    Router::new()
        .route("/api/triggers", get(list_triggers))
        .route("/api/triggers/cron/preview", get(preview_schedule))
        .route("/api/triggers/cron/generate", post(generate_schedule))
        .route("/api/triggers/{workflow_id}", get(trigger_status))
}

/// GET /api/triggers
async fn list_triggers(State(state): State<AppContext>) -> Json<Vec<CronTriggerStatus>> {
    Json(state.scheduler.get_cron_triggers_status().await)
}

/// GET /api/triggers/{workflow_id}
async fn trigger_status(
    State(state): State<AppContext>,
    Path(workflow_id): Path<String>,
) -> Result<Json<CronTriggerStatus>, StatusCode> {
    state
        .scheduler
        .get_cron_trigger_status(&workflow_id)
        .await
        .map(Json)
        .map_err(|e| reject("Trigger status lookup failed", e))
}

/// Upcoming fire times of an expression
///
/// GET /api/triggers/cron/preview?expression=*/5+*+*+*+*&count=3
async fn preview_schedule(
    Query(query): Query<PreviewQuery>,
) -> Result<Json<SchedulePreview>, StatusCode> {
    let count = query
        .count
        .unwrap_or(DEFAULT_PREVIEW_COUNT)
        .min(MAX_PREVIEW_COUNT);
    let next_runs = next_fire_times(&query.expression, count)
        .map_err(|e| reject("Schedule preview failed", e))?;

    Ok(Json(SchedulePreview {
        expression: query.expression,
        next_runs,
    }))
}

/// Build an expression from a friendly description
///
/// POST /api/triggers/cron/generate
/// Body: { "frequency": "daily", "hour": 2, "minute": 30 }
async fn generate_schedule(
    Json(spec): Json<CronSpec>,
) -> Result<Json<SchedulePreview>, StatusCode> {
    let expression =
        generate_cron_expression(&spec).map_err(|e| reject("Schedule generation failed", e))?;
    let next_runs = next_fire_times(&expression, DEFAULT_PREVIEW_COUNT)
        .map_err(|e| reject("Schedule generation failed", e))?;

    Ok(Json(SchedulePreview {
        expression,
        next_runs,
    }))
}
