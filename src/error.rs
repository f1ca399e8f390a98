/// Engine error taxonomy
///
/// Every failure the engine can produce maps onto one of four kinds: validation,
/// execution, timeout and not-found. The task queue consults [`EngineError::is_retryable`]
/// and is the only place that ever retries.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Coarse classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Execution,
    Timeout,
    NotFound,
}

/// Errors produced by the sandbox, registry, queue and scheduler.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------
    /// Cron expression could not be parsed into a schedule.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    /// A schema entry marked `required` was absent or null.
    #[error("missing required input '{0}'")]
    MissingRequiredInput(String),

    /// Component manifest failed structural validation.
    #[error("invalid manifest for component '{component}': {reason}")]
    InvalidManifest { component: String, reason: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    // ------ Not found ------
    #[error("component not found: {namespace}/{name}")]
    ComponentNotFound { namespace: String, name: String },

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("trigger not found: {0}")]
    TriggerNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    // ------ Execution errors ------
    /// Sandboxed execution exceeded its wall-clock budget.
    #[error("{what} timed out after {}ms", after.as_millis())]
    Timeout { what: String, after: Duration },

    /// Component process exited without delivering a result.
    #[error("component process failed (exit code {code:?}): {message}")]
    ProcessFailure { code: Option<i32>, message: String },

    /// Component process broke the single request/single response protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Component reported an error through the result protocol.
    #[error("component error: {0}")]
    ComponentError(String),

    /// Script raised an error inside the in-process sandbox.
    #[error("script error: {0}")]
    ScriptError(String),

    /// A workflow step failed; the run was aborted at this step.
    #[error("step '{step_id}' failed: {source}")]
    StepFailed {
        step_id: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("document store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Classify the error for logging, API responses and retry policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidCronExpression { .. }
            | EngineError::MissingRequiredInput(_)
            | EngineError::InvalidManifest { .. }
            | EngineError::InvalidInput(_) => ErrorKind::Validation,
            EngineError::ComponentNotFound { .. }
            | EngineError::WorkflowNotFound(_)
            | EngineError::TriggerNotFound(_)
            | EngineError::TaskNotFound(_) => ErrorKind::NotFound,
            EngineError::Timeout { .. } => ErrorKind::Timeout,
            EngineError::StepFailed { source, .. } => source.kind(),
            EngineError::ProcessFailure { .. }
            | EngineError::ProtocolViolation(_)
            | EngineError::ComponentError(_)
            | EngineError::ScriptError(_)
            | EngineError::Scheduler(_)
            | EngineError::Store(_)
            | EngineError::Io(_) => ErrorKind::Execution,
        }
    }

    /// Whether the task queue may retry a task that failed with this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Execution | ErrorKind::Timeout)
    }

    /// Stable variant name, reported as `error.kind` to callers.
    pub fn name(&self) -> &'static str {
        match self {
            EngineError::InvalidCronExpression { .. } => "InvalidCronExpression",
            EngineError::MissingRequiredInput(_) => "MissingRequiredInput",
            EngineError::InvalidManifest { .. } => "InvalidManifest",
            EngineError::InvalidInput(_) => "InvalidInput",
            EngineError::ComponentNotFound { .. } => "ComponentNotFound",
            EngineError::WorkflowNotFound(_) => "WorkflowNotFound",
            EngineError::TriggerNotFound(_) => "TriggerNotFound",
            EngineError::TaskNotFound(_) => "TaskNotFound",
            EngineError::Timeout { .. } => "Timeout",
            EngineError::ProcessFailure { .. } => "ProcessFailure",
            EngineError::ProtocolViolation(_) => "ProtocolViolation",
            EngineError::ComponentError(_) => "ComponentError",
            EngineError::ScriptError(_) => "ScriptError",
            EngineError::StepFailed { source, .. } => source.name(),
            EngineError::Scheduler(_) => "Scheduler",
            EngineError::Store(_) => "Store",
            EngineError::Io(_) => "Io",
        }
    }

    pub(crate) fn store(err: impl Into<anyhow::Error>) -> Self {
        EngineError::Store(err.into())
    }
}

/// Serializable failure description: `{kind, message}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: String,
    pub message: String,
}

impl From<&EngineError> for FailureInfo {
    fn from(err: &EngineError) -> Self {
        Self {
            kind: err.name().to_string(),
            message: err.to_string(),
        }
    }
}

/// Wire shape of a sandboxed execution: `{result}` or `{error: {kind, message}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecutionOutcome {
    Success { result: serde_json::Value },
    Failure { error: FailureInfo },
}

impl From<Result<serde_json::Value, EngineError>> for ExecutionOutcome {
    fn from(result: Result<serde_json::Value, EngineError>) -> Self {
        match result {
            Ok(result) => ExecutionOutcome::Success { result },
            Err(err) => ExecutionOutcome::Failure {
                error: FailureInfo::from(&err),
            },
        }
    }
}
