/// Flowhost: low-code automation host
///
/// Main entry point for the Flowhost server. Initializes configuration and starts
/// the HTTP server with workflow management and execution capabilities.

use flowhost::{config::Config, server::start_server};

/// Application entry point
///
/// Initializes the server with environment-derived configuration. The server provides:
/// - Workflow management API at /api/workflows/*
/// - Webhook activation at /webhook/{trigger_id}
/// - Task, trigger, component and script APIs under /api/*
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration (defaults to 0.0.0.0:3004 and data/flowhost.db)
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
