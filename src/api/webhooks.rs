/// Webhook activation endpoint
///
/// `POST /webhook/{trigger_id}` resolves the webhook-triggered workflow and enqueues
/// a task, answering with its id. With `?wait=true` the workflow runs inline and
/// the run itself is returned.

use crate::{
    api::reject,
    app::AppContext,
    runtime::{WebhookRequest, WorkflowRun},
};
use axum::{
    extract::{ConnectInfo, Path, Query, Request, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, net::SocketAddr};

/// Largest webhook body accepted
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

#[derive(Debug, Default, Deserialize)]
pub struct WebhookQuery {
    #[serde(default)]
    pub wait: bool,
}

/// Response for a queued webhook
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAccepted {
    pub task_id: String,
    pub status: &'static str,
}

pub fn create_webhook_routes() -> Router<AppContext> {
    Router::new().route("/webhook/{trigger_id}", post(receive_webhook))
}

/// Accept a webhook call
///
/// POST /webhook/{trigger_id}[?wait=true]
/// Body: JSON payload exposed to steps as `{{trigger.body}}`
async fn receive_webhook(
    State(state): State<AppContext>,
    Path(trigger_id): Path<String>,
    Query(query): Query<WebhookQuery>,
    request: Request,
) -> Result<Response, StatusCode> {
    tracing::info!("📥 Webhook request received: {}", trigger_id);

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES).await.map_err(|e| {
        tracing::warn!("❌ Unreadable webhook body for {}: {}", trigger_id, e);
        StatusCode::PAYLOAD_TOO_LARGE
    })?;

    let body: Value = if bytes.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).map_err(|e| {
            tracing::warn!("❌ Invalid JSON payload for webhook {} - Error: {}", trigger_id, e);
            StatusCode::BAD_REQUEST
        })?
    };

    let headers: HashMap<String, String> = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let source_ip = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    let webhook = WebhookRequest {
        method: parts.method.to_string(),
        headers,
        body,
        source_ip,
    };

    if query.wait {
        let workflow_start_time = std::time::Instant::now();
        let run: WorkflowRun = state
            .scheduler
            .run_webhook_inline(&trigger_id, webhook)
            .await
            .map_err(|e| reject(&format!("Inline webhook {} failed", trigger_id), e))?;

        tracing::info!(
            "🎉 Inline webhook {} completed in {:?}",
            trigger_id,
            workflow_start_time.elapsed()
        );
        return Ok(Json(run).into_response());
    }

    let task_id = state
        .scheduler
        .handle_webhook(&trigger_id, webhook)
        .await
        .map_err(|e| reject(&format!("Webhook {} rejected", trigger_id), e))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookAccepted {
            task_id,
            status: "queued",
        }),
    )
        .into_response())
}
