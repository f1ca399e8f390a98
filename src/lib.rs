/// Flowhost: low-code automation host
///
/// This library provides the workflow execution engine: cron and webhook triggers,
/// a bounded-concurrency task queue with retries, a component registry and the
/// sandbox runtime that isolates component and script execution.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by every engine service
pub mod error;

// Workflow definitions (workflow, trigger binding, steps)
pub mod workflow;

// Document store abstraction with SQLite and in-memory backends
pub mod store;

// Process and Lua sandboxes
pub mod sandbox;

// Component manifests and the hot-reload component registry
pub mod component;

// Workflow engine, task queue and trigger scheduler
pub mod runtime;

// Explicitly constructed service graph
pub mod app;

// HTTP API layer - REST endpoints for workflows, tasks, components and webhooks
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use app::AppContext;
pub use error::{EngineError, ErrorKind, ExecutionOutcome};
pub use runtime::{TaskQueue, TriggerScheduler, WorkflowEngine, WorkflowRun};
pub use server::start_server;
pub use workflow::{Step, Workflow};
