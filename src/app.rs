/// Application context
///
/// Every engine service is constructed here once and injected where needed; there
/// are no global singletons. The HTTP layer holds a cheap clone of [`AppContext`].

use crate::{
    component::ComponentRegistry,
    config::Config,
    error::EngineError,
    runtime::{
        CronTriggerStatus, TaskQueue, TriggerScheduler, WorkflowEngine, WorkflowTaskHandler,
    },
    sandbox::{CallContext, ProcessSandbox, ScriptSandbox},
    store::{DocumentStore, SqliteDocumentStore},
    workflow::{TriggerConfig, TriggerType, Workflow},
};
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Process-scoped services, wired together
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn DocumentStore>,
    pub registry: Arc<ComponentRegistry>,
    pub scripts: Arc<ScriptSandbox>,
    pub engine: Arc<WorkflowEngine>,
    pub queue: TaskQueue,
    pub scheduler: Arc<TriggerScheduler>,
}

impl AppContext {
    /// Open the SQLite document store named by `config` and wire everything onto it
    pub async fn from_config(config: Config) -> Result<Self> {
        tracing::info!(
            "📋 Opening document store: {}",
            config.storage.database_path.display()
        );
        let store = SqliteDocumentStore::open(&config.storage.database_path)
            .await
            .context("Failed to open document store")?;

        Self::build(config, Arc::new(store))
            .await
            .context("Failed to initialize engine services")
    }

    /// Wire all services onto an existing document store
    ///
    /// Loads local components; does not start the trigger scheduler.
    pub async fn build(config: Config, store: Arc<dyn DocumentStore>) -> Result<Self, EngineError> {
        tracing::info!("🧪 Initializing sandbox runtime (timeout {:?})", config.sandbox.timeout);
        let process_sandbox = Arc::new(ProcessSandbox::new(
            &config.sandbox.temp_dir,
            config.sandbox.timeout,
        ));
        let scripts = Arc::new(ScriptSandbox::new(
            config.sandbox.timeout,
            &config.sandbox.script_workdir,
            config.sandbox.allowed_hosts.clone(),
        )
        .with_memory_limit(config.sandbox.script_memory_limit));

        tracing::info!("📦 Initializing component registry");
        let registry = Arc::new(ComponentRegistry::new(
            &config.components.local_dir,
            Arc::clone(&store),
            process_sandbox,
        ));
        registry.initialize().await?;

        tracing::info!("🚀 Initializing workflow engine");
        let engine = Arc::new(WorkflowEngine::new(Arc::clone(&registry), Arc::clone(&scripts)));

        tracing::info!(
            "📥 Initializing task queue ({} concurrent tasks)",
            config.queue.max_concurrent_tasks
        );
        let handler = Arc::new(WorkflowTaskHandler::new(Arc::clone(&store), Arc::clone(&engine)));
        let queue = TaskQueue::new(config.queue.clone(), handler);

        tracing::info!("⏰ Initializing trigger scheduler");
        let scheduler = Arc::new(
            TriggerScheduler::new(Arc::clone(&engine), queue.clone(), Arc::clone(&store)).await?,
        );

        Ok(Self {
            config: Arc::new(config),
            store,
            registry,
            scripts,
            engine,
            queue,
            scheduler,
        })
    }

    /// Run a registry component outside of any workflow
    pub async fn execute_component(
        &self,
        namespace: &str,
        name: &str,
        inputs: Map<String, Value>,
        context: Option<CallContext>,
    ) -> Result<Value, EngineError> {
        let context = context.unwrap_or_else(CallContext::standalone);
        self.registry.execute(namespace, name, inputs, &context).await
    }

    /// Run an ad hoc script in the in-process sandbox
    pub async fn run_script(&self, code: &str, inputs: Value) -> Result<Value, EngineError> {
        self.scripts.run(code, inputs).await
    }

    /// Persist a workflow and bring its cron trigger in line
    pub async fn save_workflow(
        &self,
        workflow: &Workflow,
    ) -> Result<Option<CronTriggerStatus>, EngineError> {
        if workflow.id.trim().is_empty() || workflow.name.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "workflow id and name are required".to_string(),
            ));
        }
        if let Some(expression) = workflow.cron_expression() {
            crate::runtime::next_fire_times(expression, 1)?;
        }

        self.store.save_workflow(workflow).await.map_err(EngineError::store)?;
        tracing::info!("💾 Saved workflow: {} ({})", workflow.id, workflow.name);
        self.scheduler.sync_workflow(workflow).await
    }

    /// Toggle `enabled` and re-sync the cron trigger
    pub async fn set_workflow_enabled(
        &self,
        workflow_id: &str,
        enabled: bool,
    ) -> Result<Workflow, EngineError> {
        let mut workflow = self.load_workflow(workflow_id).await?;

        workflow.enabled = enabled;
        self.store.save_workflow(&workflow).await.map_err(EngineError::store)?;
        self.scheduler.sync_workflow(&workflow).await?;

        tracing::info!(
            "🔀 Workflow {} {}",
            workflow_id,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(workflow)
    }

    /// Bind a workflow to a cron schedule, persisting the new trigger
    ///
    /// The stored trigger is what later saves and toggles re-sync from, so the
    /// schedule is written to the workflow rather than only registered.
    pub async fn set_workflow_cron(
        &self,
        workflow_id: &str,
        cron_expression: &str,
    ) -> Result<(Workflow, Option<CronTriggerStatus>), EngineError> {
        let mut workflow = self.load_workflow(workflow_id).await?;
        workflow.trigger = TriggerConfig {
            trigger_type: TriggerType::Cron,
            cron_expression: Some(cron_expression.trim().to_string()),
        };
        let status = self.save_workflow(&workflow).await?;
        Ok((workflow, status))
    }

    /// Drop a workflow's cron schedule; it becomes manually triggered
    ///
    /// Returns whether a live trigger was removed.
    pub async fn clear_workflow_cron(&self, workflow_id: &str) -> Result<bool, EngineError> {
        let mut workflow = self.load_workflow(workflow_id).await?;
        if workflow.trigger.trigger_type == TriggerType::Cron {
            workflow.trigger = TriggerConfig::default();
            self.store.save_workflow(&workflow).await.map_err(EngineError::store)?;
        }
        Ok(self.scheduler.remove_cron_trigger(workflow_id).await)
    }

    async fn load_workflow(&self, workflow_id: &str) -> Result<Workflow, EngineError> {
        self.store
            .get_workflow(workflow_id)
            .await
            .map_err(EngineError::store)?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))
    }

    /// Remove a workflow and its cron trigger; returns whether it existed
    pub async fn delete_workflow(&self, workflow_id: &str) -> Result<bool, EngineError> {
        self.scheduler.remove_cron_trigger(workflow_id).await;
        let existed = self
            .store
            .delete_workflow(workflow_id)
            .await
            .map_err(EngineError::store)?;
        if existed {
            tracing::info!("🗑️ Deleted workflow: {}", workflow_id);
        }
        Ok(existed)
    }

    /// Stop firing triggers, then drain running tasks
    pub async fn shutdown(&self) {
        if let Err(e) = self.scheduler.shutdown().await {
            tracing::warn!("⚠️ Trigger scheduler did not stop cleanly: {}", e);
        }
        self.queue.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::SandboxConfig, store::MemoryDocumentStore};
    use serde_json::json;

    async fn context(dir: &std::path::Path) -> AppContext {
        let config = Config {
            sandbox: SandboxConfig {
                temp_dir: dir.join("staging"),
                script_workdir: dir.join("scripts"),
                ..SandboxConfig::default()
            },
            components: crate::config::ComponentsConfig {
                local_dir: dir.join("components"),
            },
            ..Config::default()
        };
        AppContext::build(config, Arc::new(MemoryDocumentStore::new()))
            .await
            .unwrap()
    }

    async fn manual_workflow(context: &AppContext) {
        let workflow: Workflow =
            serde_json::from_value(json!({"id": "wf", "name": "Nightly", "steps": []})).unwrap();
        context.save_workflow(&workflow).await.unwrap();
    }

    #[tokio::test]
    async fn cron_binding_survives_toggle() {
        let dir = tempfile::tempdir().unwrap();
        let context = context(dir.path()).await;
        manual_workflow(&context).await;

        let (workflow, status) = context.set_workflow_cron("wf", "*/5 * * * *").await.unwrap();
        assert_eq!(workflow.cron_expression(), Some("*/5 * * * *"));
        assert!(status.is_some());

        let stored = context.store.get_workflow("wf").await.unwrap().unwrap();
        assert_eq!(stored.trigger.trigger_type, TriggerType::Cron);

        context.set_workflow_enabled("wf", false).await.unwrap();
        assert!(context.scheduler.get_cron_trigger_status("wf").await.is_err());
        context.set_workflow_enabled("wf", true).await.unwrap();
        let status = context.scheduler.get_cron_trigger_status("wf").await.unwrap();
        assert_eq!(status.cron_expression, "*/5 * * * *");
    }

    #[tokio::test]
    async fn cleared_cron_stays_cleared_after_toggle() {
        let dir = tempfile::tempdir().unwrap();
        let context = context(dir.path()).await;
        manual_workflow(&context).await;

        context.set_workflow_cron("wf", "0 2 * * *").await.unwrap();
        assert!(context.clear_workflow_cron("wf").await.unwrap());

        context.set_workflow_enabled("wf", false).await.unwrap();
        context.set_workflow_enabled("wf", true).await.unwrap();
        assert!(context.scheduler.get_cron_trigger_status("wf").await.is_err());
        let stored = context.store.get_workflow("wf").await.unwrap().unwrap();
        assert_eq!(stored.trigger.trigger_type, TriggerType::Manual);
    }

    #[tokio::test]
    async fn invalid_cron_leaves_stored_workflow_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let context = context(dir.path()).await;
        manual_workflow(&context).await;

        let err = context.set_workflow_cron("wf", "61 * * * *").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidCronExpression { .. }));
        let stored = context.store.get_workflow("wf").await.unwrap().unwrap();
        assert_eq!(stored.trigger.trigger_type, TriggerType::Manual);

        let err = context.set_workflow_cron("missing", "* * * * *").await.unwrap_err();
        assert!(matches!(err, EngineError::WorkflowNotFound(_)));
    }
}
