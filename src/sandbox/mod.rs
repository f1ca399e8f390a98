/// Sandbox Runtime
///
/// Runs one unit of untrusted code under a hard wall-clock limit without letting it
/// touch host state. Two strategies:
/// - [`ProcessSandbox`]: dedicated OS process per call, used for registry components
/// - [`ScriptSandbox`]: fresh embedded Lua VM per call, used for ad hoc scripts
///
/// Neither strategy retries. Retries belong to the task queue.

pub mod process;
pub mod script;

use serde::{Deserialize, Serialize};

pub use process::{ProcessRequest, ProcessSandbox, RESULT_MARKER};
pub use script::ScriptSandbox;

/// Call metadata handed to sandboxed code alongside its inputs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallContext {
    /// Unique id of this call, for correlating logs
    pub call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Task that caused this call, when run from the queue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl CallContext {
    /// Context for a call made outside of any workflow run
    pub fn standalone() -> Self {
        Self {
            call_id: uuid::Uuid::new_v4().to_string(),
            ..Default::default()
        }
    }

    /// Context for a step inside a workflow run
    pub fn for_step(workflow_id: &str, step_id: &str, task_id: Option<&str>) -> Self {
        Self {
            call_id: uuid::Uuid::new_v4().to_string(),
            workflow_id: Some(workflow_id.to_string()),
            step_id: Some(step_id.to_string()),
            task_id: task_id.map(str::to_string),
        }
    }

    /// Environment variables exposed to component processes
    pub(crate) fn env_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![("FLOWHOST_CALL_ID", self.call_id.clone())];
        if let Some(workflow_id) = &self.workflow_id {
            vars.push(("FLOWHOST_WORKFLOW_ID", workflow_id.clone()));
        }
        if let Some(step_id) = &self.step_id {
            vars.push(("FLOWHOST_STEP_ID", step_id.clone()));
        }
        if let Some(task_id) = &self.task_id {
            vars.push(("FLOWHOST_TASK_ID", task_id.clone()));
        }
        vars
    }
}
