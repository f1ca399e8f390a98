/// Trigger scheduler service
///
/// Owns cron and webhook activations. Cron triggers are tokio-cron-scheduler jobs
/// tracked one per workflow id; creating a trigger for a workflow that already has
/// one cancels the old job first under the same lock, so there is never more than
/// one live job per workflow. Cron and manual fires run inline; webhook fires are
/// enqueued on the task queue.

use crate::{
    error::EngineError,
    runtime::{
        engine::{WorkflowEngine, WorkflowRun},
        queue::{NewTask, TaskQueue, TaskType},
    },
    store::DocumentStore,
    workflow::{TriggerType, Workflow},
};
use chrono::{DateTime, Utc, Weekday};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::{BTreeSet, HashMap},
    str::FromStr,
    sync::Arc,
};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Live cron trigger for one workflow
struct CronTrigger {
    workflow_id: String,
    cron_expression: String,
    schedule: Schedule,
    job_id: Uuid,
    created_at: DateTime<Utc>,
}

impl CronTrigger {
    fn status(&self) -> CronTriggerStatus {
        CronTriggerStatus {
            workflow_id: self.workflow_id.clone(),
            cron_expression: self.cron_expression.clone(),
            job_id: self.job_id,
            created_at: self.created_at,
            next_run: self.schedule.upcoming(Utc).next(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CronTriggerStatus {
    pub workflow_id: String,
    pub cron_expression: String,
    pub job_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub next_run: Option<DateTime<Utc>>,
}

/// Inbound webhook call as delivered by the HTTP layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRequest {
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
}

/// Cron and webhook trigger orchestration
pub struct TriggerScheduler {
    scheduler: Arc<RwLock<JobScheduler>>,
    cron_triggers: Arc<RwLock<HashMap<String, CronTrigger>>>,
    engine: Arc<WorkflowEngine>,
    queue: TaskQueue,
    store: Arc<dyn DocumentStore>,
}

impl TriggerScheduler {
    pub async fn new(
        engine: Arc<WorkflowEngine>,
        queue: TaskQueue,
        store: Arc<dyn DocumentStore>,
    ) -> Result<Self, EngineError> {
        let scheduler = JobScheduler::new().await.map_err(scheduler_error)?;

        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            cron_triggers: Arc::new(RwLock::new(HashMap::new())),
            engine,
            queue,
            store,
        })
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// Register cron triggers for every enabled cron workflow, then start firing
    ///
    /// Workflows with a broken cron expression are logged and skipped.
    pub async fn start(&self) -> Result<usize, EngineError> {
        tracing::info!("⏰ Starting trigger scheduler");

        let summaries = self.store.list_workflows().await.map_err(EngineError::store)?;
        let mut registered = 0;
        for summary in summaries
            .iter()
            .filter(|s| s.enabled && s.trigger_type == TriggerType::Cron)
        {
            let Some(workflow) = self
                .store
                .get_workflow(&summary.id)
                .await
                .map_err(EngineError::store)?
            else {
                continue;
            };
            match self.sync_workflow(&workflow).await {
                Ok(Some(_)) => registered += 1,
                Ok(None) => {}
                Err(e) => tracing::warn!("⚠️ Skipping cron trigger for workflow {}: {}", workflow.id, e),
            }
        }

        {
            let scheduler = self.scheduler.read().await;
            scheduler.start().await.map_err(scheduler_error)?;
        }

        tracing::info!("📊 Registered {} cron triggers from {} workflows", registered, summaries.len());
        tracing::info!("✅ Trigger scheduler started successfully");
        Ok(registered)
    }

    pub async fn shutdown(&self) -> Result<(), EngineError> {
        tracing::info!("⏹️ Stopping trigger scheduler");

        {
            let mut cron_triggers = self.cron_triggers.write().await;
            cron_triggers.clear();
            tracing::debug!("🧹 Cleared cron trigger map during shutdown");
        }

        {
            let mut scheduler = self.scheduler.write().await;
            scheduler.shutdown().await.map_err(scheduler_error)?;
        }

        tracing::info!("✅ Trigger scheduler stopped");
        Ok(())
    }

    /// Create or replace the cron trigger for `workflow_id`
    ///
    /// Accepts 5-field expressions and seconds-first 6/7-field expressions. Each
    /// firing runs `workflow` inline; failures are logged and the next tick tries again.
    pub async fn create_cron_trigger(
        &self,
        workflow_id: &str,
        cron_expression: &str,
        workflow: Workflow,
    ) -> Result<CronTriggerStatus, EngineError> {
        let normalized = normalize_cron(cron_expression)?;
        let schedule = parse_schedule(cron_expression, &normalized)?;

        // Probe job: rejects expressions the job scheduler cannot run, fires nothing
        Job::new_async(normalized.as_str(), |_uuid, _l| Box::pin(async {})).map_err(|e| {
            EngineError::InvalidCronExpression {
                expression: cron_expression.to_string(),
                reason: e.to_string(),
            }
        })?;

        tracing::info!("🔥 Upserting cron trigger for workflow {}: {}", workflow_id, cron_expression);

        let mut cron_triggers = self.cron_triggers.write().await;
        if let Some(existing) = cron_triggers.remove(workflow_id) {
            self.remove_job(workflow_id, existing.job_id).await;
        }

        let job = self.build_job(&normalized, workflow_id, cron_expression, Arc::new(workflow))?;
        let job_id = {
            let scheduler = self.scheduler.read().await;
            scheduler.add(job).await.map_err(scheduler_error)?
        };

        let trigger = CronTrigger {
            workflow_id: workflow_id.to_string(),
            cron_expression: cron_expression.to_string(),
            schedule,
            job_id,
            created_at: Utc::now(),
        };
        let status = trigger.status();
        cron_triggers.insert(workflow_id.to_string(), trigger);

        tracing::info!(
            "✅ Cron trigger active for workflow {} (next run {:?})",
            workflow_id,
            status.next_run
        );
        Ok(status)
    }

    /// Same upsert semantics as [`Self::create_cron_trigger`]
    pub async fn update_cron_trigger(
        &self,
        workflow_id: &str,
        cron_expression: &str,
        workflow: Workflow,
    ) -> Result<CronTriggerStatus, EngineError> {
        self.create_cron_trigger(workflow_id, cron_expression, workflow).await
    }

    /// Cancel the cron trigger for `workflow_id`; returns whether one existed
    pub async fn remove_cron_trigger(&self, workflow_id: &str) -> bool {
        let mut cron_triggers = self.cron_triggers.write().await;
        match cron_triggers.remove(workflow_id) {
            Some(trigger) => {
                self.remove_job(workflow_id, trigger.job_id).await;
                tracing::info!("🗑️ Removed cron trigger for workflow {}", workflow_id);
                true
            }
            None => {
                tracing::debug!("⏭️ No cron trigger to remove for workflow {}", workflow_id);
                false
            }
        }
    }

    pub async fn get_cron_trigger_status(
        &self,
        workflow_id: &str,
    ) -> Result<CronTriggerStatus, EngineError> {
        self.cron_triggers
            .read()
            .await
            .get(workflow_id)
            .map(CronTrigger::status)
            .ok_or_else(|| EngineError::TriggerNotFound(workflow_id.to_string()))
    }

    pub async fn get_cron_triggers_status(&self) -> Vec<CronTriggerStatus> {
        let mut statuses: Vec<CronTriggerStatus> = self
            .cron_triggers
            .read()
            .await
            .values()
            .map(CronTrigger::status)
            .collect();
        statuses.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        statuses
    }

    /// Bring the cron trigger in line with a saved, toggled or deleted workflow
    pub async fn sync_workflow(
        &self,
        workflow: &Workflow,
    ) -> Result<Option<CronTriggerStatus>, EngineError> {
        match workflow.cron_expression() {
            Some(expression) if workflow.enabled => {
                let status = self
                    .create_cron_trigger(&workflow.id, expression, workflow.clone())
                    .await?;
                Ok(Some(status))
            }
            _ => {
                self.remove_cron_trigger(&workflow.id).await;
                Ok(None)
            }
        }
    }

    /// Run a stored workflow inline with `payload` as its trigger data
    pub async fn trigger_workflow(
        &self,
        workflow_id: &str,
        payload: Value,
    ) -> Result<WorkflowRun, EngineError> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await
            .map_err(EngineError::store)?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;

        tracing::info!("👆 Manually triggering workflow {}", workflow_id);
        self.engine.execute_workflow(&workflow, payload, None).await
    }

    /// Enqueue a webhook task for the workflow bound to `trigger_id`
    pub async fn handle_webhook(
        &self,
        trigger_id: &str,
        request: WebhookRequest,
    ) -> Result<String, EngineError> {
        let workflow = self.resolve_webhook(trigger_id).await?;
        let payload = webhook_payload(&request)?;

        tracing::info!(
            "🔗 Webhook {} {} received for workflow {}",
            request.method,
            trigger_id,
            workflow.id
        );
        Ok(self
            .queue
            .add_task(NewTask::new(TaskType::Webhook, workflow.id, payload))
            .await)
    }

    /// Execute the webhook's workflow inline instead of queueing it
    pub async fn run_webhook_inline(
        &self,
        trigger_id: &str,
        request: WebhookRequest,
    ) -> Result<WorkflowRun, EngineError> {
        let workflow = self.resolve_webhook(trigger_id).await?;
        let payload = webhook_payload(&request)?;

        tracing::info!("🔗 Webhook {} running workflow {} inline", trigger_id, workflow.id);
        self.engine.execute_workflow(&workflow, payload, None).await
    }

    async fn resolve_webhook(&self, trigger_id: &str) -> Result<Workflow, EngineError> {
        let workflow = self
            .store
            .get_workflow(trigger_id)
            .await
            .map_err(EngineError::store)?
            .ok_or_else(|| EngineError::TriggerNotFound(trigger_id.to_string()))?;

        if workflow.trigger.trigger_type != TriggerType::Webhook {
            tracing::debug!("🚫 Workflow {} is not webhook-triggered", trigger_id);
            return Err(EngineError::TriggerNotFound(trigger_id.to_string()));
        }
        Ok(workflow)
    }

    fn build_job(
        &self,
        normalized: &str,
        workflow_id: &str,
        cron_expression: &str,
        workflow: Arc<Workflow>,
    ) -> Result<Job, EngineError> {
        let workflow_id_owned = workflow_id.to_string();
        let expression = cron_expression.to_string();
        let engine = Arc::clone(&self.engine);

        Job::new_async(normalized, move |_uuid, _l| {
            let workflow_id = workflow_id_owned.clone();
            let expression = expression.clone();
            let workflow = Arc::clone(&workflow);
            let engine = Arc::clone(&engine);

            Box::pin(async move {
                tracing::debug!("🔔 Cron trigger activated for workflow {}", workflow_id);
                let trigger = json!({
                    "type": "cron",
                    "cronExpression": expression,
                    "firedAt": Utc::now(),
                });

                match engine.execute_workflow(&workflow, trigger, None).await {
                    Ok(run) => tracing::info!(
                        "✅ Cron-triggered workflow completed: {} ({} steps, skipped: {})",
                        workflow_id,
                        run.steps.len(),
                        run.skipped
                    ),
                    Err(e) => tracing::error!(
                        "❌ Cron-triggered workflow failed: {} - Error: {}",
                        workflow_id,
                        e
                    ),
                }
            })
        })
        .map_err(|e| EngineError::InvalidCronExpression {
            expression: cron_expression.to_string(),
            reason: e.to_string(),
        })
    }

    async fn remove_job(&self, workflow_id: &str, job_id: Uuid) {
        let scheduler = self.scheduler.read().await;
        if let Err(e) = scheduler.remove(&job_id).await {
            tracing::warn!("⚠️ Failed to remove cron job for {} from scheduler: {}", workflow_id, e);
        } else {
            tracing::debug!("🛑 Removed cron job from scheduler: {}", workflow_id);
        }
    }
}

fn scheduler_error(err: impl std::fmt::Display) -> EngineError {
    EngineError::Scheduler(err.to_string())
}

fn webhook_payload(request: &WebhookRequest) -> Result<Value, EngineError> {
    let mut payload =
        serde_json::to_value(request).map_err(|e| EngineError::InvalidInput(e.to_string()))?;
    if let Some(fields) = payload.as_object_mut() {
        fields.insert("receivedAt".to_string(), json!(Utc::now()));
    }
    Ok(payload)
}

/// Convert a 5-field expression to the seconds-first form the job scheduler runs
///
/// 6 and 7 field expressions are passed through untouched. In a 5-field expression
/// the day-of-week field uses standard numbering (0 or 7 = Sunday) and is rewritten
/// for the seconds-first dialect, which counts 1-7 from Sunday.
pub fn normalize_cron(expression: &str) -> Result<String, EngineError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => {
            let day_of_week = convert_day_of_week(fields[4]).map_err(|reason| {
                EngineError::InvalidCronExpression {
                    expression: expression.to_string(),
                    reason,
                }
            })?;
            Ok(format!("0 {} {}", fields[..4].join(" "), day_of_week))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(EngineError::InvalidCronExpression {
            expression: expression.to_string(),
            reason: format!("expected 5, 6 or 7 fields, found {}", n),
        }),
    }
}

/// Rewrite numeric day-of-week items (`0`, `1-5`, `1-7/2`, lists) as explicit
/// 1-based days; `*`, `?` and names are kept as written
fn convert_day_of_week(field: &str) -> Result<String, String> {
    let mut kept = Vec::new();
    let mut days = BTreeSet::new();

    for item in field.split(',') {
        let numeric = !item.is_empty()
            && item.bytes().all(|b| b.is_ascii_digit() || b == b'-' || b == b'/');
        if !numeric {
            kept.push(item.to_string());
            continue;
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (
                range,
                step.parse::<usize>()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| format!("invalid day-of-week step in '{}'", item))?,
            ),
            None => (item, 1),
        };
        let (start, end) = match range.split_once('-') {
            Some((start, end)) => (parse_weekday(start)?, parse_weekday(end)?),
            None if item.contains('/') => (parse_weekday(range)?, 6),
            None => {
                let day = parse_weekday(range)?;
                (day, day)
            }
        };
        if start > end {
            return Err(format!("day-of-week range '{}' runs backwards", item));
        }
        days.extend((start..=end).step_by(step).map(|day| day % 7 + 1));
    }

    kept.extend(days.iter().map(u8::to_string));
    Ok(kept.join(","))
}

fn parse_weekday(raw: &str) -> Result<u8, String> {
    raw.parse::<u8>()
        .ok()
        .filter(|day| *day <= 7)
        .ok_or_else(|| format!("day of week '{}' is outside 0-7", raw))
}

fn parse_schedule(expression: &str, normalized: &str) -> Result<Schedule, EngineError> {
    Schedule::from_str(normalized).map_err(|e| EngineError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Next `count` fire times of `expression`, starting from now
pub fn next_fire_times(expression: &str, count: usize) -> Result<Vec<DateTime<Utc>>, EngineError> {
    let normalized = normalize_cron(expression)?;
    let schedule = parse_schedule(expression, &normalized)?;
    Ok(schedule.upcoming(Utc).take(count).collect())
}

/// Friendly schedule description turned into a 5-field cron expression
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "frequency", rename_all = "camelCase")]
pub enum CronSpec {
    EveryMinutes { interval: u32 },
    Hourly { minute: u32 },
    Daily { hour: u32, minute: u32 },
    Weekly { weekday: Weekday, hour: u32, minute: u32 },
    Monthly { day: u32, hour: u32, minute: u32 },
}

pub fn generate_cron_expression(spec: &CronSpec) -> Result<String, EngineError> {
    let check = |field: &str, value: u32, min: u32, max: u32| {
        if (min..=max).contains(&value) {
            Ok(value)
        } else {
            Err(EngineError::InvalidCronExpression {
                expression: format!("{:?}", spec),
                reason: format!("{} must be between {} and {}, got {}", field, min, max, value),
            })
        }
    };

    let expression = match spec {
        CronSpec::EveryMinutes { interval } => {
            format!("*/{} * * * *", check("interval", *interval, 1, 59)?)
        }
        CronSpec::Hourly { minute } => format!("{} * * * *", check("minute", *minute, 0, 59)?),
        CronSpec::Daily { hour, minute } => format!(
            "{} {} * * *",
            check("minute", *minute, 0, 59)?,
            check("hour", *hour, 0, 23)?
        ),
        CronSpec::Weekly { weekday, hour, minute } => format!(
            "{} {} * * {}",
            check("minute", *minute, 0, 59)?,
            check("hour", *hour, 0, 23)?,
            weekday.to_string().to_uppercase()
        ),
        CronSpec::Monthly { day, hour, minute } => format!(
            "{} {} {} * *",
            check("minute", *minute, 0, 59)?,
            check("hour", *hour, 0, 23)?,
            check("day", *day, 1, 31)?
        ),
    };
    Ok(expression)
}
