/// Server setup and initialization
///
/// Wires together all components: document store, component registry, task queue,
/// trigger scheduler and HTTP routes. Provides the main application factory
/// function for creating the Axum app.

use crate::{api::create_api_routes, app::AppContext, config::Config};
use anyhow::Result;
use axum::{routing::get, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Create the main Axum application with all routes
pub fn create_app(context: AppContext) -> Router {
    tracing::info!("📡 Creating HTTP router with all endpoints");
    Router::new()
        // Health check endpoint
        .route("/healthz", get(health_check))
        .merge(create_api_routes())
        .with_state(context)
}

/// Start the HTTP server with the given configuration
///
/// Builds every service, starts the trigger scheduler and serves until Ctrl-C,
/// then stops triggers and drains the task queue.
pub async fn start_server(config: Config) -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting Flowhost server...");

    let context = AppContext::from_config(config.clone()).await?;

    tracing::info!("🚀 Starting trigger scheduler");
    context
        .scheduler
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start trigger scheduler: {}", e))?;

    let app = create_app(context.clone());

    // Bind to the configured address
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("🛑 Shutdown requested, draining engine services");
    context.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
