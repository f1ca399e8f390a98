/// HTTP API Layer
///
/// This module provides the REST API endpoints over the engine services. It handles:
/// - Webhook activation (queued or inline)
/// - Task submission and status
/// - Workflow CRUD, enable/disable, manual trigger and cron management
/// - Component listing, execution and user component management
/// - Ad hoc script execution

use crate::{
    app::AppContext,
    error::{EngineError, ErrorKind},
};
use axum::{http::StatusCode, Router};

// Component registry endpoints
pub mod components;

// Ad hoc script execution endpoint
pub mod scripts;

// Task queue endpoints
pub mod tasks;

// Cron trigger status and helpers
pub mod triggers;

// Webhook activation endpoint
pub mod webhooks;

// Workflow management endpoints (POST/GET/PUT/DELETE)
pub mod workflows;

// Re-export router builders
pub use components::create_component_routes;
pub use scripts::create_script_routes;
pub use tasks::create_task_routes;
pub use triggers::create_trigger_routes;
pub use webhooks::create_webhook_routes;
pub use workflows::create_workflow_routes;

/// All API routes, sharing one [`AppContext`]
pub fn create_api_routes() -> Router<AppContext> {
    Router::new()
        .merge(create_webhook_routes())
        .merge(create_task_routes())
        .merge(create_workflow_routes())
        .merge(create_trigger_routes())
        .merge(create_component_routes())
        .merge(create_script_routes())
}

/// HTTP status for an engine error
///
/// Execution failures use 422 (Unprocessable Entity) so they stay distinct from
/// 500s raised by the host itself.
pub(crate) fn error_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Store(_) | EngineError::Io(_) | EngineError::Scheduler(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => match err.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Execution => StatusCode::UNPROCESSABLE_ENTITY,
        },
    }
}

/// Log and convert an engine error for handlers returning a bare status
pub(crate) fn reject(context: &str, err: EngineError) -> StatusCode {
    let status = error_status(&err);
    if status.is_server_error() {
        tracing::error!("❌ {}: {}", context, err);
    } else {
        tracing::warn!("⚠️ {}: {}", context, err);
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_error_kinds_to_statuses() {
        assert_eq!(
            error_status(&EngineError::MissingRequiredInput("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&EngineError::TaskNotFound("t".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&EngineError::ComponentError("boom".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            error_status(&EngineError::Scheduler("down".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
