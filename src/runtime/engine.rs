/// Sequential workflow execution engine
///
/// Runs a workflow's steps strictly in array order. Each step's raw inputs are
/// interpolated against the trigger payload and the outputs of earlier steps,
/// then dispatched to the component registry (component steps) or the script
/// sandbox (script steps). The first failing step aborts the run.

use crate::{
    component::ComponentRegistry,
    error::EngineError,
    runtime::{
        interpolate::{InputInterpolator, RunScope, TemplateInterpolator},
        queue::{Task, TaskHandler},
    },
    sandbox::{CallContext, ScriptSandbox},
    store::DocumentStore,
    workflow::{ComponentRef, Step, Workflow},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Outcome of one workflow run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub run_id: String,
    pub workflow_id: String,
    /// True when the workflow was disabled and nothing ran
    pub skipped: bool,
    pub steps: Vec<StepResult>,
    /// Output of the last executed step
    pub output: Value,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub output: Value,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Skipped,
}

/// What a step asks the engine to do
enum StepAction<'a> {
    Component(&'a ComponentRef),
    Script(&'a str),
    Unsupported(&'a str),
}

impl<'a> StepAction<'a> {
    fn of(step: &'a Step) -> Self {
        match (step.kind.as_deref(), &step.component, &step.script) {
            (None | Some("component"), Some(component), _) => StepAction::Component(component),
            (None | Some("script"), _, Some(script)) => StepAction::Script(script.as_str()),
            (Some(kind), _, _) => StepAction::Unsupported(kind),
            (None, _, _) => StepAction::Unsupported("<empty>"),
        }
    }
}

/// Executes workflows step by step
pub struct WorkflowEngine {
    registry: Arc<ComponentRegistry>,
    scripts: Arc<ScriptSandbox>,
    interpolator: Arc<dyn InputInterpolator>,
}

impl WorkflowEngine {
    /// Create an engine using `{{...}}` template interpolation
    pub fn new(registry: Arc<ComponentRegistry>, scripts: Arc<ScriptSandbox>) -> Self {
        Self {
            registry,
            scripts,
            interpolator: Arc::new(TemplateInterpolator),
        }
    }

    /// Swap in a different input interpolation strategy
    pub fn with_interpolator(mut self, interpolator: Arc<dyn InputInterpolator>) -> Self {
        self.interpolator = interpolator;
        self
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn scripts(&self) -> &Arc<ScriptSandbox> {
        &self.scripts
    }

    /// Execute every step of `workflow` in order
    ///
    /// A disabled workflow is a logged no-op returning a `skipped` run.
    pub async fn execute_workflow(
        &self,
        workflow: &Workflow,
        trigger: Value,
        task_id: Option<&str>,
    ) -> Result<WorkflowRun, EngineError> {
        let started_at = Utc::now();
        let workflow_start_time = std::time::Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();

        if !workflow.enabled {
            tracing::info!("⏸️ Workflow '{}' is disabled, skipping run", workflow.id);
            return Ok(WorkflowRun {
                run_id,
                workflow_id: workflow.id.clone(),
                skipped: true,
                steps: Vec::new(),
                output: Value::Null,
                started_at,
                completed_at: Utc::now(),
                duration_ms: 0,
            });
        }

        tracing::info!(
            "🚀 Starting workflow execution: {} ({} steps, run {})",
            workflow.id,
            workflow.steps.len(),
            run_id
        );

        let mut outputs = Map::new();
        let mut steps = Vec::with_capacity(workflow.steps.len());
        let mut output = Value::Null;

        for (step_num, step) in workflow.steps.iter().enumerate() {
            tracing::info!(
                "📍 Step {}/{}: Executing step '{}'",
                step_num + 1,
                workflow.steps.len(),
                step.id
            );
            let step_start_time = std::time::Instant::now();

            let inputs = self.interpolator.interpolate(
                &step.inputs,
                RunScope {
                    trigger: &trigger,
                    steps: &outputs,
                },
            )?;

            let executed = self
                .execute_step(&workflow.id, step, inputs, task_id)
                .await
                .map_err(|source| {
                    tracing::error!("❌ Step '{}' of workflow '{}' failed: {}", step.id, workflow.id, source);
                    EngineError::StepFailed {
                        step_id: step.id.clone(),
                        source: Box::new(source),
                    }
                })?;

            let duration_ms = step_start_time.elapsed().as_millis() as u64;
            match executed {
                Some(value) => {
                    tracing::info!("✅ Step '{}' completed in {}ms", step.id, duration_ms);
                    outputs.insert(step.id.clone(), value.clone());
                    output = value.clone();
                    steps.push(StepResult {
                        step_id: step.id.clone(),
                        status: StepStatus::Completed,
                        output: value,
                        duration_ms,
                    });
                }
                None => steps.push(StepResult {
                    step_id: step.id.clone(),
                    status: StepStatus::Skipped,
                    output: Value::Null,
                    duration_ms,
                }),
            }
        }

        let workflow_duration = workflow_start_time.elapsed();
        tracing::info!(
            "🎉 Workflow '{}' execution completed successfully in {:?}",
            workflow.id,
            workflow_duration
        );

        Ok(WorkflowRun {
            run_id,
            workflow_id: workflow.id.clone(),
            skipped: false,
            steps,
            output,
            started_at,
            completed_at: Utc::now(),
            duration_ms: workflow_duration.as_millis() as u64,
        })
    }

    /// Execute one step with already-interpolated inputs
    ///
    /// Returns `None` when the step kind is not supported and was skipped.
    pub async fn execute_step(
        &self,
        workflow_id: &str,
        step: &Step,
        inputs: Map<String, Value>,
        task_id: Option<&str>,
    ) -> Result<Option<Value>, EngineError> {
        match StepAction::of(step) {
            StepAction::Component(component) => {
                let context = CallContext::for_step(workflow_id, &step.id, task_id);
                self.registry
                    .execute(&component.namespace, &component.name, inputs, &context)
                    .await
                    .map(Some)
            }
            StepAction::Script(code) => self.scripts.run(code, Value::Object(inputs)).await.map(Some),
            StepAction::Unsupported(kind) => {
                tracing::warn!(
                    "⚠️ Skipping step '{}' of workflow '{}': unsupported step kind '{}'",
                    step.id,
                    workflow_id,
                    kind
                );
                Ok(None)
            }
        }
    }
}

/// Queue handler running the workflow a task points at
pub struct WorkflowTaskHandler {
    store: Arc<dyn DocumentStore>,
    engine: Arc<WorkflowEngine>,
}

impl WorkflowTaskHandler {
    pub fn new(store: Arc<dyn DocumentStore>, engine: Arc<WorkflowEngine>) -> Self {
        Self { store, engine }
    }
}

#[async_trait]
impl TaskHandler for WorkflowTaskHandler {
    async fn handle(&self, task: &Task) -> Result<Value, EngineError> {
        let workflow = self
            .store
            .get_workflow(&task.workflow_id)
            .await
            .map_err(EngineError::store)?
            .ok_or_else(|| EngineError::WorkflowNotFound(task.workflow_id.clone()))?;

        let run = self
            .engine
            .execute_workflow(&workflow, task.payload.clone(), Some(&task.id))
            .await?;

        serde_json::to_value(run).map_err(|e| EngineError::InvalidInput(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        component::ComponentRegistry,
        error::ErrorKind,
        sandbox::ProcessSandbox,
        store::MemoryDocumentStore,
    };
    use serde_json::json;
    use std::time::Duration;

    fn engine(dir: &std::path::Path) -> WorkflowEngine {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let sandbox = Arc::new(ProcessSandbox::new(dir.join("staging"), Duration::from_secs(5)));
        let registry = Arc::new(ComponentRegistry::new(dir.join("components"), store, sandbox));
        let scripts = Arc::new(ScriptSandbox::new(Duration::from_secs(5), dir.join("work"), Vec::new()));
        WorkflowEngine::new(registry, scripts)
    }

    fn workflow(steps: Value) -> Workflow {
        serde_json::from_value(json!({"id": "wf", "name": "Test", "steps": steps})).unwrap()
    }

    #[tokio::test]
    async fn steps_run_in_order_and_chain_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let wf = workflow(json!([
            {"id": "a", "script": "return { n = 2 }"},
            {"id": "b", "script": "return { n = ctx.inputs.x * 10 }", "inputs": {"x": "{{steps.a.n}}"}},
            {"id": "c", "script": "return ctx.inputs.label .. ':' .. ctx.inputs.n",
             "inputs": {"label": "{{trigger.label}}", "n": "{{steps.b.n}}"}}
        ]));

        let run = engine(dir.path())
            .execute_workflow(&wf, json!({"label": "total"}), None)
            .await
            .unwrap();

        let order: Vec<&str> = run.steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(order, ["a", "b", "c"]);
        assert_eq!(run.steps[1].output, json!({"n": 20}));
        assert_eq!(run.output, json!("total:20"));
    }

    #[tokio::test]
    async fn unsupported_steps_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let wf = workflow(json!([
            {"id": "a", "type": "container", "inputs": {"image": "alpine"}},
            {"id": "b", "script": "return 1"}
        ]));

        let run = engine(dir.path()).execute_workflow(&wf, json!({}), None).await.unwrap();
        assert_eq!(run.steps[0].status, StepStatus::Skipped);
        assert_eq!(run.steps[1].status, StepStatus::Completed);
        assert_eq!(run.output, json!(1));
    }

    #[tokio::test]
    async fn first_failure_aborts_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let wf = workflow(json!([
            {"id": "a", "script": "error('nope')"},
            {"id": "b", "script": "ctx.fs.write('ran.txt', 'yes'); return 1"}
        ]));

        let err = engine(dir.path()).execute_workflow(&wf, json!({}), None).await.unwrap_err();
        assert!(matches!(&err, EngineError::StepFailed { step_id, .. } if step_id == "a"));
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(!dir.path().join("work/ran.txt").exists());
    }

    #[tokio::test]
    async fn missing_component_fails_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let wf = workflow(json!([
            {"id": "a", "componentRef": {"namespace": "local", "name": "missing-component"}}
        ]));

        let err = engine.execute_workflow(&wf, json!({}), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(engine.registry().sandbox().spawned_count(), 0);
    }

    #[tokio::test]
    async fn disabled_workflow_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut wf = workflow(json!([{"id": "a", "script": "error('should not run')"}]));
        wf.enabled = false;

        let run = engine(dir.path()).execute_workflow(&wf, json!({}), None).await.unwrap();
        assert!(run.skipped);
        assert!(run.steps.is_empty());
    }
}
