/// Bounded-concurrency task queue
///
/// At-least-once work queue for webhook and workflow tasks. A single processor
/// loop pops ready tasks FIFO and dispatches each on its own tokio task, keeping
/// at most `max_concurrent_tasks` outstanding. Failed tasks whose error is
/// retryable are re-queued at the tail with exponential backoff until
/// `max_retries` is spent.
///
/// State is in-memory only: queued and running work is lost on restart.

use crate::{
    config::QueueConfig,
    error::{EngineError, FailureInfo},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    pin::Pin,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{broadcast, Mutex, Notify},
    time::Instant,
};
use uuid::Uuid;

/// Upper bound on a single retry delay
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Webhook,
    Workflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// Unit of queued work and its bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub workflow_id: String,
    pub payload: Value,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Last failure; kept across retries so callers can see why a task is re-queued
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureInfo>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Earliest instant a re-queued task may run again
    #[serde(skip)]
    available_at: Option<Instant>,
}

impl Task {
    fn is_ready(&self, now: Instant) -> bool {
        match self.available_at {
            Some(at) => at <= now,
            None => true,
        }
    }
}

/// Request to enqueue work
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub workflow_id: String,
    #[serde(default)]
    pub payload: Value,
    /// Overrides the queue-wide retry limit
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl NewTask {
    pub fn new(task_type: TaskType, workflow_id: impl Into<String>, payload: Value) -> Self {
        Self {
            task_type,
            workflow_id: workflow_id.into(),
            payload,
            max_retries: None,
        }
    }
}

/// Status transition broadcast to subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub task_id: String,
    pub status: TaskStatus,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureInfo>,
    pub at: DateTime<Utc>,
}

impl TaskEvent {
    fn of(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            status: task.status,
            retry_count: task.retry_count,
            error: task.error.clone(),
            at: Utc::now(),
        }
    }
}

/// Task record plus queue position for queued tasks
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusReport {
    #[serde(flatten)]
    pub task: Task,
    /// 1-based position among queued tasks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_start: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub max_concurrent_tasks: usize,
    /// Whether the processor loop is currently active
    pub processing: bool,
    /// False once `shutdown` has been called
    pub accepting: bool,
    pub average_duration_ms: u64,
}

/// Executes the work a task stands for
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<Value, EngineError>;
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Task>,
    running: HashMap<String, Task>,
    finished: HashMap<String, Task>,
    /// Cleared by `shutdown`
    enabled: bool,
    /// Processor loop is alive
    loop_active: bool,
    total_duration: Duration,
    duration_samples: u32,
}

impl QueueState {
    fn average_duration(&self) -> Duration {
        if self.duration_samples == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.duration_samples
        }
    }

    /// Claim the processor loop; true when the caller must spawn it
    fn claim_loop(&mut self) -> bool {
        if self.enabled && !self.loop_active && !self.queue.is_empty() {
            self.loop_active = true;
            true
        } else {
            false
        }
    }

    fn finish(&mut self, task: Task, history_limit: usize) {
        self.finished.insert(task.id.clone(), task);
        while self.finished.len() > history_limit {
            let oldest = self
                .finished
                .values()
                .min_by_key(|t| t.completed_at)
                .map(|t| t.id.clone());
            match oldest {
                Some(id) => {
                    self.finished.remove(&id);
                    tracing::debug!("🧹 Evicted finished task {} from history", id);
                }
                None => break,
            }
        }
    }
}

struct QueueInner {
    config: QueueConfig,
    handler: Arc<dyn TaskHandler>,
    state: Mutex<QueueState>,
    /// Wakes the processor when a slot frees or new work arrives
    wakeup: Notify,
    events: broadcast::Sender<TaskEvent>,
}

impl QueueInner {
    fn emit(&self, task: &Task) {
        // No subscribers is fine
        let _ = self.events.send(TaskEvent::of(task));
    }
}

enum Next {
    Dispatch(Task),
    Wait(Duration),
}

/// Cheaply cloneable handle to the queue
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new(config: QueueConfig, handler: Arc<dyn TaskHandler>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(QueueInner {
                config,
                handler,
                state: Mutex::new(QueueState {
                    enabled: true,
                    ..Default::default()
                }),
                wakeup: Notify::new(),
                events,
            }),
        }
    }

    /// Enqueue a task and return its id without waiting for it to run
    pub async fn add_task(&self, new_task: NewTask) -> String {
        let task = Task {
            id: Uuid::new_v4().to_string(),
            task_type: new_task.task_type,
            workflow_id: new_task.workflow_id,
            payload: new_task.payload,
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: new_task.max_retries.unwrap_or(self.inner.config.max_retries),
            available_at: None,
        };
        let id = task.id.clone();
        self.inner.emit(&task);

        let spawn_loop = {
            let mut state = self.inner.state.lock().await;
            state.queue.push_back(task);
            if !state.enabled {
                tracing::warn!("⚠️ Task {} queued after shutdown; it will not be processed", id);
            }
            state.claim_loop()
        };

        tracing::info!("📥 Queued task {}", id);
        if spawn_loop {
            tokio::spawn(process_loop(Arc::clone(&self.inner)));
        } else {
            self.inner.wakeup.notify_one();
        }
        id
    }

    /// Look up a task in the running set, the finished history or the queue
    pub async fn get_task_status(&self, task_id: &str) -> Result<TaskStatusReport, EngineError> {
        let state = self.inner.state.lock().await;

        if let Some(task) = state.running.get(task_id).or_else(|| state.finished.get(task_id)) {
            return Ok(TaskStatusReport {
                task: task.clone(),
                position: None,
                estimated_start: None,
            });
        }

        let (index, task) = state
            .queue
            .iter()
            .enumerate()
            .find(|(_, t)| t.id == task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;

        let position = index + 1;
        let wait = state.average_duration().saturating_mul(position as u32);
        let estimated_start = Utc::now()
            + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero());

        Ok(TaskStatusReport {
            task: task.clone(),
            position: Some(position),
            estimated_start: Some(estimated_start),
        })
    }

    pub async fn get_queue_stats(&self) -> QueueStats {
        let state = self.inner.state.lock().await;
        let (completed, failed) = state.finished.values().fold((0, 0), |(c, f), t| match t.status {
            TaskStatus::Failed => (c, f + 1),
            _ => (c + 1, f),
        });

        QueueStats {
            queued: state.queue.len(),
            running: state.running.len(),
            completed,
            failed,
            max_concurrent_tasks: self.inner.config.max_concurrent_tasks,
            processing: state.loop_active,
            accepting: state.enabled,
            average_duration_ms: state.average_duration().as_millis() as u64,
        }
    }

    /// Receive every task status transition from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    /// Stop dispatching and wait for running tasks to drain
    ///
    /// Queued tasks stay queued; running tasks are never cancelled.
    pub async fn shutdown(&self) {
        tracing::info!("🛑 Shutting down task queue");
        {
            let mut state = self.inner.state.lock().await;
            state.enabled = false;
        }
        self.inner.wakeup.notify_one();

        loop {
            let running = self.inner.state.lock().await.running.len();
            if running == 0 {
                break;
            }
            tracing::debug!("⏳ Waiting for {} running tasks to finish", running);
            tokio::time::sleep(self.inner.config.poll_interval).await;
        }
        tracing::info!("✅ Task queue drained");
    }
}

/// Delay before a task's next attempt: `base × 2^(retry_count-1)`, capped
pub fn retry_delay(base: Duration, retry_count: u32) -> Duration {
    if base.is_zero() {
        return Duration::ZERO;
    }
    let factor = 2u32.saturating_pow(retry_count.saturating_sub(1));
    base.saturating_mul(factor).min(MAX_RETRY_BACKOFF)
}

/// Dispatch loop; boxed because it and `execute_task` spawn each other
fn process_loop(inner: Arc<QueueInner>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        tracing::debug!("▶️ Task processor started");

        loop {
            let next = {
                let mut state = inner.state.lock().await;
                if !state.enabled || state.queue.is_empty() {
                    state.loop_active = false;
                    break;
                }

                if state.running.len() >= inner.config.max_concurrent_tasks {
                    Next::Wait(inner.config.poll_interval)
                } else {
                    let now = Instant::now();
                    match state.queue.iter().position(|t| t.is_ready(now)) {
                        Some(index) => match state.queue.remove(index) {
                            Some(mut task) => {
                                task.status = TaskStatus::Running;
                                task.started_at = Some(Utc::now());
                                task.available_at = None;
                                state.running.insert(task.id.clone(), task.clone());
                                Next::Dispatch(task)
                            }
                            None => continue,
                        },
                        None => {
                            // Everything queued is backing off
                            let soonest = state
                                .queue
                                .iter()
                                .filter_map(|t| t.available_at)
                                .min()
                                .map(|at| at.saturating_duration_since(now))
                                .unwrap_or(inner.config.poll_interval);
                            Next::Wait(soonest.min(inner.config.poll_interval))
                        }
                    }
                }
            };

            match next {
                Next::Dispatch(task) => {
                    tracing::info!(
                        "⚡ Dispatching task {} (attempt {})",
                        task.id,
                        task.retry_count + 1
                    );
                    inner.emit(&task);
                    tokio::spawn(execute_task(Arc::clone(&inner), task));
                }
                Next::Wait(delay) => {
                    tokio::select! {
                        _ = inner.wakeup.notified() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        tracing::debug!("⏸️ Task processor idle");
    })
}

async fn execute_task(inner: Arc<QueueInner>, task: Task) {
    let started = Instant::now();
    let task_id = task.id.clone();

    // Run the handler on its own task so a panic still settles the record
    let handler = Arc::clone(&inner.handler);
    let outcome = match tokio::spawn(async move { handler.handle(&task).await }).await {
        Ok(outcome) => outcome,
        Err(e) => Err(EngineError::Scheduler(format!("task handler panicked: {}", e))),
    };
    let elapsed = started.elapsed();

    let (settled, spawn_loop) = {
        let mut state = inner.state.lock().await;
        let Some(mut task) = state.running.remove(&task_id) else {
            tracing::warn!("⚠️ Task {} finished but was not in the running set", task_id);
            return;
        };
        state.total_duration += elapsed;
        state.duration_samples += 1;

        match outcome {
            Ok(result) => {
                tracing::info!("✅ Task {} completed in {:?}", task_id, elapsed);
                task.status = TaskStatus::Completed;
                task.result = Some(result);
                task.error = None;
                task.completed_at = Some(Utc::now());
                state.finish(task.clone(), inner.config.history_limit);
            }
            Err(err) if err.is_retryable() && task.retry_count < task.max_retries => {
                task.retry_count += 1;
                let delay = retry_delay(inner.config.retry_backoff, task.retry_count);
                tracing::warn!(
                    "🔁 Task {} failed ({}), retry {}/{} in {:?}",
                    task_id,
                    err,
                    task.retry_count,
                    task.max_retries,
                    delay
                );
                task.status = TaskStatus::Queued;
                task.error = Some(FailureInfo::from(&err));
                task.started_at = None;
                task.available_at = (!delay.is_zero()).then(|| Instant::now() + delay);
                state.queue.push_back(task.clone());
            }
            Err(err) => {
                tracing::error!(
                    "❌ Task {} failed after {} retries: {}",
                    task_id,
                    task.retry_count,
                    err
                );
                task.status = TaskStatus::Failed;
                task.error = Some(FailureInfo::from(&err));
                task.completed_at = Some(Utc::now());
                state.finish(task.clone(), inner.config.history_limit);
            }
        }

        let spawn_loop = state.claim_loop();
        (task, spawn_loop)
    };

    inner.emit(&settled);
    if spawn_loop {
        tokio::spawn(process_loop(Arc::clone(&inner)));
    } else {
        inner.wakeup.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn config(max_concurrent_tasks: usize) -> QueueConfig {
        QueueConfig {
            max_concurrent_tasks,
            poll_interval: Duration::from_millis(10),
            max_retries: 3,
            retry_backoff: Duration::ZERO,
            history_limit: 100,
        }
    }

    fn workflow_task() -> NewTask {
        NewTask::new(TaskType::Workflow, "wf", json!({}))
    }

    /// Wait until every task in `ids` reaches a terminal status
    async fn settle_all(events: &mut broadcast::Receiver<TaskEvent>, ids: &[String]) {
        let mut pending: std::collections::HashSet<&str> = ids.iter().map(String::as_str).collect();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !pending.is_empty() {
                let event = events.recv().await.unwrap();
                if matches!(event.status, TaskStatus::Completed | TaskStatus::Failed) {
                    pending.remove(event.task_id.as_str());
                }
            }
        })
        .await
        .expect("tasks did not settle");
    }

    struct Failing {
        calls: AtomicU32,
        retryable: bool,
    }

    #[async_trait]
    impl TaskHandler for Failing {
        async fn handle(&self, _task: &Task) -> Result<Value, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.retryable {
                Err(EngineError::ComponentError("boom".into()))
            } else {
                Err(EngineError::WorkflowNotFound("wf".into()))
            }
        }
    }

    struct Sleeping {
        delay: Duration,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Sleeping {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TaskHandler for Sleeping {
        async fn handle(&self, task: &Task) -> Result<Value, EngineError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(json!({"task": task.id}))
        }
    }

    #[tokio::test]
    async fn retryable_failure_walks_every_transition() {
        let handler = Arc::new(Failing {
            calls: AtomicU32::new(0),
            retryable: true,
        });
        let queue = TaskQueue::new(config(5), handler.clone());
        let mut events = queue.subscribe();

        let id = queue.add_task(workflow_task()).await;
        let mut transitions = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                if event.task_id != id {
                    continue;
                }
                let done = event.status == TaskStatus::Failed;
                transitions.push((event.status, event.retry_count));
                if done {
                    break;
                }
            }
        })
        .await
        .expect("task did not settle");

        use TaskStatus::{Failed, Queued, Running};
        assert_eq!(
            transitions,
            vec![
                (Queued, 0),
                (Running, 0),
                (Queued, 1),
                (Running, 1),
                (Queued, 2),
                (Running, 2),
                (Queued, 3),
                (Running, 3),
                (Failed, 3),
            ]
        );

        let report = queue.get_task_status(&id).await.unwrap();
        assert_eq!(report.task.status, TaskStatus::Failed);
        assert_eq!(report.task.retry_count, 3);
        assert_eq!(report.task.error.unwrap().kind, "ComponentError");
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn processor_future_is_send() {
        let queue = TaskQueue::new(config(1), Arc::new(Sleeping::new(Duration::ZERO)));
        let processor = process_loop(Arc::clone(&queue.inner));
        assert_send(&processor);
        let task = Task {
            id: "t".to_string(),
            task_type: TaskType::Workflow,
            workflow_id: "wf".to_string(),
            payload: Value::Null,
            status: TaskStatus::Running,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: 0,
            available_at: None,
        };
        assert_send(&execute_task(Arc::clone(&queue.inner), task));
    }

    #[tokio::test]
    async fn not_found_failures_are_not_retried() {
        let handler = Arc::new(Failing {
            calls: AtomicU32::new(0),
            retryable: false,
        });
        let queue = TaskQueue::new(config(5), handler.clone());
        let mut events = queue.subscribe();

        let id = queue.add_task(workflow_task()).await;
        settle_all(&mut events, &[id.clone()]).await;

        let report = queue.get_task_status(&id).await.unwrap();
        assert_eq!(report.task.status, TaskStatus::Failed);
        assert_eq!(report.task.retry_count, 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn add_task_returns_while_work_is_pending() {
        let handler = Arc::new(Sleeping::new(Duration::from_millis(300)));
        let queue = TaskQueue::new(config(1), handler);

        let started = std::time::Instant::now();
        let first = queue.add_task(workflow_task()).await;
        let second = queue.add_task(workflow_task()).await;
        assert!(started.elapsed() < Duration::from_millis(100));

        let report = queue.get_task_status(&second).await.unwrap();
        assert_ne!(report.task.status, TaskStatus::Completed);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_limit() {
        let handler = Arc::new(Sleeping::new(Duration::from_millis(40)));
        let queue = TaskQueue::new(config(2), handler.clone());
        let mut events = queue.subscribe();

        let mut ids = Vec::new();
        for _ in 0..6 {
            ids.push(queue.add_task(workflow_task()).await);
        }
        settle_all(&mut events, &ids).await;

        assert!(handler.peak.load(Ordering::SeqCst) <= 2);
        let stats = queue.get_queue_stats().await;
        assert_eq!(stats.completed, 6);
        assert_eq!(stats.running, 0);
        assert!(stats.average_duration_ms >= 40);
    }

    #[tokio::test]
    async fn queued_tasks_report_position() {
        let handler = Arc::new(Sleeping::new(Duration::from_millis(500)));
        let queue = TaskQueue::new(config(1), handler);

        let _running = queue.add_task(workflow_task()).await;
        let second = queue.add_task(workflow_task()).await;
        let third = queue.add_task(workflow_task()).await;
        // Let the processor pick up the first task
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = queue.get_task_status(&second).await.unwrap();
        assert_eq!(report.position, Some(1));
        assert!(report.estimated_start.is_some());
        assert_eq!(queue.get_task_status(&third).await.unwrap().position, Some(2));
    }

    #[tokio::test]
    async fn finished_history_is_bounded() {
        let handler = Arc::new(Sleeping::new(Duration::from_millis(1)));
        let mut cfg = config(1);
        cfg.history_limit = 2;
        let queue = TaskQueue::new(cfg, handler);
        let mut events = queue.subscribe();

        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(queue.add_task(workflow_task()).await);
        }
        settle_all(&mut events, &ids).await;

        assert_eq!(queue.get_queue_stats().await.completed, 2);
        assert!(matches!(
            queue.get_task_status(&ids[0]).await,
            Err(EngineError::TaskNotFound(_))
        ));
        assert!(queue.get_task_status(&ids[3]).await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_drains_running_tasks() {
        let handler = Arc::new(Sleeping::new(Duration::from_millis(100)));
        let queue = TaskQueue::new(config(5), handler);

        let id = queue.add_task(workflow_task()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shutdown().await;

        let report = queue.get_task_status(&id).await.unwrap();
        assert_eq!(report.task.status, TaskStatus::Completed);
        assert!(!queue.get_queue_stats().await.accepting);
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let base = Duration::from_secs(1);
        assert_eq!(retry_delay(base, 1), Duration::from_secs(1));
        assert_eq!(retry_delay(base, 3), Duration::from_secs(4));
        assert_eq!(retry_delay(base, 20), MAX_RETRY_BACKOFF);
        assert_eq!(retry_delay(Duration::ZERO, 5), Duration::ZERO);
    }
}
