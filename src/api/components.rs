/// Component registry endpoints
///
/// Listing, standalone execution, user component management and cache refresh.

use crate::{
    api::{error_status, reject},
    app::AppContext,
    component::{ComponentManifest, ComponentSummary},
    error::ExecutionOutcome,
    sandbox::CallContext,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Default, Deserialize)]
pub struct ExecuteComponentRequest {
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub context: Option<CallContext>,
}

#[derive(Debug, Deserialize)]
pub struct SaveComponentRequest {
    pub manifest: ComponentManifest,
    pub code: String,
}

pub fn create_component_routes() -> Router<AppContext> {
    Router::new()
        .route("/api/components", get(list_components))
        .route("/api/components/refresh", post(refresh_components))
        .route(
            "/api/components/user/{name}",
            put(save_user_component).delete(delete_user_component),
        )
        .route(
            "/api/components/{namespace}/{name}/execute",
            post(execute_component),
        )
}

/// GET /api/components
async fn list_components(
    State(state): State<AppContext>,
) -> Result<Json<Vec<ComponentSummary>>, StatusCode> {
    state
        .registry
        .list()
        .await
        .map(Json)
        .map_err(|e| reject("Failed to list components", e))
}

/// Execute a component outside of any workflow
///
/// POST /api/components/{namespace}/{name}/execute
/// Body: { "inputs": {...} }
/// Returns: { "result": ... } or { "error": { "kind": "...", "message": "..." } }
async fn execute_component(
    State(state): State<AppContext>,
    Path((namespace, name)): Path<(String, String)>,
    Json(request): Json<ExecuteComponentRequest>,
) -> (StatusCode, Json<ExecutionOutcome>) {
    let result = state
        .execute_component(&namespace, &name, request.inputs, request.context)
        .await;

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!("⚠️ Component {}/{} failed: {}", namespace, name, e);
            error_status(e)
        }
    };
    (status, Json(ExecutionOutcome::from(result)))
}

/// Create or replace a user component
///
/// PUT /api/components/user/{name}
/// Body: { "manifest": {...}, "code": "..." }
async fn save_user_component(
    State(state): State<AppContext>,
    Path(name): Path<String>,
    Json(mut request): Json<SaveComponentRequest>,
) -> Result<Json<Value>, StatusCode> {
    // Ensure the manifest name matches the URL parameter
    request.manifest.name = name.clone();

    state
        .registry
        .save_user_component(&request.manifest, &request.code)
        .await
        .map_err(|e| reject(&format!("Failed to save user component {}", name), e))?;

    Ok(Json(json!({
        "name": name,
        "message": format!("Component '{}' saved successfully", name),
    })))
}

/// DELETE /api/components/user/{name}
async fn delete_user_component(
    State(state): State<AppContext>,
    Path(name): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match state.registry.delete_user_component(&name).await {
        Ok(true) => Ok(Json(json!({ "message": "Component deleted successfully" }))),
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(e) => Err(reject(&format!("Failed to delete user component {}", name), e)),
    }
}

/// POST /api/components/refresh
async fn refresh_components(State(state): State<AppContext>) -> Result<Json<Value>, StatusCode> {
    let local = state
        .registry
        .refresh()
        .await
        .map_err(|e| reject("Component refresh failed", e))?;
    Ok(Json(json!({ "localComponents": local })))
}
