/// Ad hoc script execution endpoint

use crate::{
    api::error_status,
    app::AppContext,
    error::ExecutionOutcome,
};
use axum::{extract::State, http::StatusCode, response::Json, routing::post, Router};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct RunScriptRequest {
    pub code: String,
    #[serde(default)]
    pub inputs: Value,
}

pub fn create_script_routes() -> Router<AppContext> {
    Router::new().route("/api/scripts/run", post(run_script))
}

/// Run Lua in the in-process sandbox
///
/// POST /api/scripts/run
/// Body: { "code": "return ctx.inputs.a + 1", "inputs": { "a": 1 } }
async fn run_script(
    State(state): State<AppContext>,
    Json(request): Json<RunScriptRequest>,
) -> (StatusCode, Json<ExecutionOutcome>) {
    let result = state.run_script(&request.code, request.inputs).await;
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(e) => error_status(e),
    };
    (status, Json(ExecutionOutcome::from(result)))
}
