/// Runtime Execution Engine
///
/// This module turns trigger activations into workflow runs. It handles:
/// - Sequential step execution with input interpolation
/// - Bounded-concurrency task queue with retries
/// - Cron and webhook trigger scheduling with tokio-cron-scheduler

// Sequential workflow execution engine
pub mod engine;

// `{{steps.*}}` / `{{trigger.*}}` input interpolation
pub mod interpolate;

// In-memory task queue with retry and status tracking
pub mod queue;

// Cron and webhook trigger scheduler service
pub mod scheduler;

// Re-export main types
pub use engine::{StepResult, StepStatus, WorkflowEngine, WorkflowRun, WorkflowTaskHandler};
pub use interpolate::{InputInterpolator, RunScope, TemplateInterpolator};
pub use queue::{
    NewTask, QueueStats, Task, TaskEvent, TaskHandler, TaskQueue, TaskStatus, TaskStatusReport,
    TaskType,
};
pub use scheduler::{
    generate_cron_expression, next_fire_times, CronSpec, CronTriggerStatus, TriggerScheduler,
    WebhookRequest,
};
