/// Core workflow type definitions
///
/// Defines workflows, their trigger binding and the ordered step list. These types
/// are serialized to JSON by the document store; the engine only reads them,
/// except for toggling `enabled`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A complete workflow definition
///
/// Steps run strictly in array order. A step's inputs may reference outputs of
/// any earlier step in the same run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Unique workflow identifier (e.g., "wf-nightly-report")
    pub id: String,
    /// Human-readable workflow name
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Disabled workflows are skipped (no-op) when fired
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// How the workflow gets activated
    #[serde(default)]
    pub trigger: TriggerConfig,
    /// Ordered step list
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn default_enabled() -> bool {
    true
}

impl Workflow {
    /// Cron expression if this workflow is cron-triggered
    pub fn cron_expression(&self) -> Option<&str> {
        match self.trigger.trigger_type {
            TriggerType::Cron => self.trigger.cron_expression.as_deref(),
            _ => None,
        }
    }

    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            enabled: self.enabled,
            trigger_type: self.trigger.trigger_type,
        }
    }
}

/// Trigger binding of a workflow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerConfig {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    /// Required for cron triggers: 5-field or seconds-first 6-field expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Cron,
    Webhook,
    /// Only fired explicitly through `trigger_workflow`
    #[default]
    Manual,
}

/// A single workflow step
///
/// Exactly one of `component` or `script` is expected. Steps with neither, or with
/// a `type` this engine does not know, are skipped with a warning so older
/// engines keep running newer workflow definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Registry component invoked by this step
    #[serde(default, alias = "componentRef", skip_serializing_if = "Option::is_none")]
    pub component: Option<ComponentRef>,
    /// Inline Lua source run in the script sandbox
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// Explicit step kind, for kinds introduced after this engine
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Raw inputs, possibly containing `{{...}}` template tokens
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

/// `(namespace, name)` reference to a registry component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRef {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ComponentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Listing view of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub trigger_type: TriggerType,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_camel_case_definition() {
        let workflow: Workflow = serde_json::from_value(json!({
            "id": "wf1",
            "name": "Nightly",
            "trigger": { "type": "cron", "cronExpression": "0 2 * * *" },
            "steps": [
                { "id": "a", "componentRef": { "namespace": "local", "name": "echo" },
                  "inputs": { "message": "hi" } },
                { "id": "b", "script": "return 1" }
            ]
        }))
        .unwrap();

        assert!(workflow.enabled);
        assert_eq!(workflow.cron_expression(), Some("0 2 * * *"));
        assert_eq!(workflow.steps[0].component.as_ref().unwrap().to_string(), "local/echo");
        assert_eq!(workflow.steps[1].script.as_deref(), Some("return 1"));
    }

    #[test]
    fn webhook_workflow_has_no_cron_expression() {
        let workflow: Workflow = serde_json::from_value(json!({
            "id": "wf2",
            "name": "Hook",
            "trigger": { "type": "webhook", "cronExpression": "* * * * *" }
        }))
        .unwrap();
        assert_eq!(workflow.cron_expression(), None);
    }
}
