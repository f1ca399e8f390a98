//! End-to-end tests wiring the full service graph over an in-memory store
//! and real `sh` components.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use flowhost::config::{
    ComponentsConfig, Config, QueueConfig, SandboxConfig, ServerConfig, StorageConfig,
};
use flowhost::component::ComponentManifest;
use flowhost::runtime::{TaskStatus, WebhookRequest};
use flowhost::store::MemoryDocumentStore;
use flowhost::{AppContext, EngineError, ErrorKind, Workflow};
use serde_json::{json, Map, Value};

/// Echoes the whole request envelope back as the result.
const ECHO_COMPONENT: &str = r#"input=$(cat)
printf '::flowhost::{"result": %s}\n' "$input"
"#;

fn test_config(root: &Path, timeout: Duration) -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        storage: StorageConfig {
            database_path: root.join("unused.db"),
        },
        components: ComponentsConfig {
            local_dir: root.join("components"),
        },
        sandbox: SandboxConfig {
            timeout,
            temp_dir: root.join("staging"),
            script_workdir: root.join("scripts"),
            allowed_hosts: Vec::new(),
            script_memory_limit: 16 * 1024 * 1024,
        },
        queue: QueueConfig {
            max_concurrent_tasks: 2,
            poll_interval: Duration::from_millis(10),
            max_retries: 0,
            retry_backoff: Duration::ZERO,
            history_limit: 50,
        },
    }
}

/// Write `<root>/components/<name>/{manifest.json,main}`.
fn write_local_component(root: &Path, manifest: Value, code: &str) {
    let name = manifest["name"].as_str().expect("manifest name");
    let dir = root.join("components").join(name);
    std::fs::create_dir_all(&dir).expect("failed to create component dir");
    std::fs::write(dir.join("manifest.json"), manifest.to_string()).expect("failed to write manifest");
    std::fs::write(dir.join("main"), code).expect("failed to write code");
}

async fn build_context(root: &Path, timeout: Duration) -> AppContext {
    AppContext::build(test_config(root, timeout), Arc::new(MemoryDocumentStore::new()))
        .await
        .expect("failed to build app context")
}

fn inputs(value: Value) -> Map<String, Value> {
    value.as_object().cloned().expect("inputs must be an object")
}

#[tokio::test]
async fn test_local_component_round_trip() {
    let root = tempfile::tempdir().expect("failed to create temp dir");
    write_local_component(root.path(), json!({ "name": "echo" }), ECHO_COMPONENT);
    let context = build_context(root.path(), Duration::from_secs(10)).await;

    let result = context
        .execute_component("local", "echo", inputs(json!({ "greeting": "hello" })), None)
        .await
        .expect("component should succeed");

    assert_eq!(result["inputs"]["greeting"], json!("hello"));
    assert!(result["context"]["callId"].is_string());
}

#[tokio::test]
async fn test_component_error_message_is_surfaced() {
    let root = tempfile::tempdir().expect("failed to create temp dir");
    write_local_component(
        root.path(),
        json!({ "name": "grumpy" }),
        "cat > /dev/null\necho '::flowhost::{\"error\": {\"message\": \"not today\"}}'\n",
    );
    let context = build_context(root.path(), Duration::from_secs(10)).await;

    let err = context
        .execute_component("local", "grumpy", Map::new(), None)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Execution);
    assert!(err.to_string().contains("not today"));
}

#[tokio::test]
async fn test_timeout_kills_process_and_cleans_staging() {
    let root = tempfile::tempdir().expect("failed to create temp dir");
    write_local_component(root.path(), json!({ "name": "sleepy" }), "exec sleep 5\n");
    let context = build_context(root.path(), Duration::from_millis(300)).await;

    let started = std::time::Instant::now();
    let err = context
        .execute_component("local", "sleepy", Map::new(), None)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(4));

    let leftovers = std::fs::read_dir(root.path().join("staging"))
        .expect("staging dir should exist")
        .count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_refresh_picks_up_changed_local_code() {
    let root = tempfile::tempdir().expect("failed to create temp dir");
    write_local_component(
        root.path(),
        json!({ "name": "version" }),
        "cat > /dev/null\necho '::flowhost::{\"result\": 1}'\n",
    );
    let context = build_context(root.path(), Duration::from_secs(10)).await;

    let first = context
        .execute_component("local", "version", Map::new(), None)
        .await
        .expect("first call should succeed");
    assert_eq!(first, json!(1));

    std::fs::write(
        root.path().join("components/version/main"),
        "cat > /dev/null\necho '::flowhost::{\"result\": 2}'\n",
    )
    .expect("failed to rewrite code");

    // Still cached until refresh
    let cached = context
        .execute_component("local", "version", Map::new(), None)
        .await
        .expect("cached call should succeed");
    assert_eq!(cached, json!(1));

    context.registry.refresh().await.expect("refresh should succeed");
    let refreshed = context
        .execute_component("local", "version", Map::new(), None)
        .await
        .expect("refreshed call should succeed");
    assert_eq!(refreshed, json!(2));
}

#[tokio::test]
async fn test_user_component_save_replaces_code() {
    let root = tempfile::tempdir().expect("failed to create temp dir");
    let context = build_context(root.path(), Duration::from_secs(10)).await;
    let manifest = ComponentManifest::parse(r#"{"name": "mine", "version": "1.0.0"}"#, "test")
        .expect("manifest should parse");

    context
        .registry
        .save_user_component(&manifest, "cat > /dev/null\necho '::flowhost::{\"result\": \"a\"}'\n")
        .await
        .expect("save should succeed");
    let first = context
        .execute_component("user", "mine", Map::new(), None)
        .await
        .expect("first call should succeed");
    assert_eq!(first, json!("a"));

    context
        .registry
        .save_user_component(&manifest, "cat > /dev/null\necho '::flowhost::{\"result\": \"b\"}'\n")
        .await
        .expect("second save should succeed");
    let second = context
        .execute_component("user", "mine", Map::new(), None)
        .await
        .expect("second call should succeed");
    assert_eq!(second, json!("b"));

    assert!(context.registry.delete_user_component("mine").await.expect("delete"));
    let err = context
        .execute_component("user", "mine", Map::new(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_missing_component_never_spawns() {
    let root = tempfile::tempdir().expect("failed to create temp dir");
    let context = build_context(root.path(), Duration::from_secs(10)).await;

    let err = context
        .execute_component("local", "ghost", Map::new(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::ComponentNotFound { .. }));
    assert_eq!(context.registry.sandbox().spawned_count(), 0);
}

#[tokio::test]
async fn test_missing_required_input_never_spawns() {
    let root = tempfile::tempdir().expect("failed to create temp dir");
    write_local_component(
        root.path(),
        json!({
            "name": "fetch",
            "inputs": [
                { "id": "url", "required": true, "type": "string" },
                { "id": "retries", "default": 3 }
            ]
        }),
        ECHO_COMPONENT,
    );
    let context = build_context(root.path(), Duration::from_secs(10)).await;

    let err = context
        .execute_component("local", "fetch", Map::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::MissingRequiredInput(ref id) if id == "url"));
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(context.registry.sandbox().spawned_count(), 0);

    let result = context
        .execute_component("local", "fetch", inputs(json!({ "url": "http://example.test" })), None)
        .await
        .expect("call with url should succeed");
    assert_eq!(result["inputs"]["retries"], json!(3));
}

#[tokio::test]
async fn test_webhook_task_runs_workflow_to_completion() {
    let root = tempfile::tempdir().expect("failed to create temp dir");
    write_local_component(root.path(), json!({ "name": "echo" }), ECHO_COMPONENT);
    let context = build_context(root.path(), Duration::from_secs(10)).await;

    let workflow: Workflow = serde_json::from_value(json!({
        "id": "wf-hook",
        "name": "Hook",
        "trigger": { "type": "webhook" },
        "steps": [
            {
                "id": "greet",
                "component": { "namespace": "local", "name": "echo" },
                "inputs": { "message": "{{trigger.body.message}}", "method": "{{trigger.method}}" }
            }
        ]
    }))
    .expect("workflow should deserialize");
    context.save_workflow(&workflow).await.expect("save should succeed");

    let mut events = context.queue.subscribe();
    let task_id = context
        .scheduler
        .handle_webhook(
            "wf-hook",
            WebhookRequest {
                method: "POST".to_string(),
                body: json!({ "message": "hi" }),
                ..Default::default()
            },
        )
        .await
        .expect("webhook should enqueue");

    let settled = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if event.task_id == task_id
                && matches!(event.status, TaskStatus::Completed | TaskStatus::Failed)
            {
                return event.status;
            }
        }
    })
    .await
    .expect("task did not settle in time");
    assert_eq!(settled, TaskStatus::Completed);

    let report = context
        .queue
        .get_task_status(&task_id)
        .await
        .expect("task should be known");
    let run = report.task.result.expect("completed task has a result");
    assert_eq!(run["workflowId"], json!("wf-hook"));
    assert_eq!(run["output"]["inputs"]["message"], json!("hi"));
    assert_eq!(run["output"]["inputs"]["method"], json!("POST"));
    assert_eq!(run["output"]["context"]["taskId"], json!(task_id));

    context.shutdown().await;
}

#[tokio::test]
async fn test_webhook_for_non_webhook_workflow_is_not_found() {
    let root = tempfile::tempdir().expect("failed to create temp dir");
    let context = build_context(root.path(), Duration::from_secs(10)).await;

    let workflow: Workflow = serde_json::from_value(json!({
        "id": "wf-manual",
        "name": "Manual",
        "steps": []
    }))
    .expect("workflow should deserialize");
    context.save_workflow(&workflow).await.expect("save should succeed");

    let err = context
        .scheduler
        .handle_webhook("wf-manual", WebhookRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
