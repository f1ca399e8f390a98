/// Process-isolated component execution
///
/// Each call stages the component code in a temp file, spawns the component's
/// runtime interpreter on it and exchanges exactly one request and one response:
/// the JSON envelope `{"inputs", "context"}` goes in on stdin, and the child answers
/// with a single stdout line `::flowhost::{"result": ...}` or
/// `::flowhost::{"error": {"message": ...}}`. All other output is logged.

use super::CallContext;
use crate::error::EngineError;
use serde_json::{json, Map, Value};
use std::{
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
};

/// Line prefix marking the result message on a component's stdout
pub const RESULT_MARKER: &str = "::flowhost::";

/// Lines of stderr kept in a `ProcessFailure` message
const STDERR_TAIL_LINES: usize = 20;

/// One component invocation
#[derive(Debug)]
pub struct ProcessRequest<'a> {
    /// Human-readable label for logs and errors (e.g. "local/echo")
    pub label: &'a str,
    /// Interpreter the staged code file is passed to (e.g. "sh", "python3")
    pub runtime: &'a str,
    pub code: &'a str,
    pub inputs: &'a Map<String, Value>,
    pub context: &'a CallContext,
}

/// Spawns one OS process per call with a hard timeout
#[derive(Debug)]
pub struct ProcessSandbox {
    temp_dir: PathBuf,
    timeout: Duration,
    spawned: AtomicU64,
}

impl ProcessSandbox {
    pub fn new(temp_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            timeout,
            spawned: AtomicU64::new(0),
        }
    }

    /// Directory where code files are staged during a call
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of processes spawned since construction
    pub fn spawned_count(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Execute one component call and return its result value verbatim
    pub async fn run(&self, request: ProcessRequest<'_>) -> Result<Value, EngineError> {
        tracing::debug!("🧪 Staging component {} for process execution", request.label);

        tokio::fs::create_dir_all(&self.temp_dir).await?;
        // Removed on drop, so every early return below cleans up the staged code
        let staged = tempfile::Builder::new()
            .prefix("component-")
            .tempfile_in(&self.temp_dir)?;
        tokio::fs::write(staged.path(), request.code).await?;

        let envelope = serde_json::to_vec(&json!({
            "inputs": request.inputs,
            "context": request.context,
        }))
        .map_err(|e| EngineError::InvalidInput(format!("unserializable inputs: {}", e)))?;

        let mut command = Command::new(request.runtime);
        command
            .arg(staged.path())
            .current_dir(&self.temp_dir)
            .env_clear()
            .envs(request.context.env_vars())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }

        let mut child = command.spawn().map_err(|e| EngineError::ProcessFailure {
            code: None,
            message: format!("failed to spawn runtime '{}': {}", request.runtime, e),
        })?;
        self.spawned.fetch_add(1, Ordering::Relaxed);

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let start_time = std::time::Instant::now();
        let exchanged = tokio::time::timeout(
            self.timeout,
            exchange(&mut child, stdin, stdout, stderr, envelope),
        )
        .await;

        let (status, stdout, stderr) = match exchanged {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(
                    "⏱️ Component {} exceeded {:?}, killing process",
                    request.label,
                    self.timeout
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!("⚠️ Failed to kill component process {}: {}", request.label, e);
                }
                return Err(EngineError::Timeout {
                    what: format!("component {}", request.label),
                    after: self.timeout,
                });
            }
        };

        tracing::debug!(
            "🏁 Component {} exited with {} in {:?}",
            request.label,
            status,
            start_time.elapsed()
        );

        if let Err(e) = staged.close() {
            tracing::warn!("⚠️ Failed to remove staged code for {}: {}", request.label, e);
        }

        interpret_output(request.label, status, &stdout, &stderr)
    }
}

/// Feed stdin and drain stdout/stderr concurrently, then reap the child
async fn exchange(
    child: &mut Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    envelope: Vec<u8>,
) -> Result<(ExitStatus, String, String), EngineError> {
    let write = async move {
        if let Some(mut stdin) = stdin {
            stdin.write_all(&envelope).await?;
            stdin.shutdown().await?;
        }
        Ok::<_, std::io::Error>(())
    };
    let (written, stdout, stderr) = tokio::join!(write, drain(stdout), drain(stderr));

    // A component that never reads its stdin closes the pipe early
    if let Err(e) = written {
        if e.kind() != std::io::ErrorKind::BrokenPipe {
            return Err(e.into());
        }
    }

    let status = child.wait().await?;
    Ok((status, stdout?, stderr?))
}

async fn drain<R: tokio::io::AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<String> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Turn captured output into the call's single result
fn interpret_output(
    label: &str,
    status: ExitStatus,
    stdout: &str,
    stderr: &str,
) -> Result<Value, EngineError> {
    let mut messages = Vec::new();
    for line in stdout.lines() {
        match line.strip_prefix(RESULT_MARKER) {
            Some(payload) => messages.push(payload),
            None if !line.trim().is_empty() => tracing::debug!("📜 [{}] {}", label, line),
            None => {}
        }
    }
    for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
        tracing::debug!("📕 [{}] {}", label, line);
    }

    match messages.as_slice() {
        [] => {
            let message = if status.success() {
                "process exited without a result message".to_string()
            } else {
                stderr_tail(stderr)
            };
            Err(EngineError::ProcessFailure {
                code: status.code(),
                message,
            })
        }
        [payload] => parse_message(payload),
        many => Err(EngineError::ProtocolViolation(format!(
            "expected a single result message from {}, received {}",
            label,
            many.len()
        ))),
    }
}

fn parse_message(payload: &str) -> Result<Value, EngineError> {
    let message: Value = serde_json::from_str(payload.trim())
        .map_err(|e| EngineError::ProtocolViolation(format!("malformed result message: {}", e)))?;

    let Value::Object(mut fields) = message else {
        return Err(EngineError::ProtocolViolation(
            "result message must be a JSON object".to_string(),
        ));
    };

    if let Some(error) = fields.remove("error") {
        let text = match &error {
            Value::String(s) => s.clone(),
            other => other
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        };
        return Err(EngineError::ComponentError(text));
    }

    fields.remove("result").ok_or_else(|| {
        EngineError::ProtocolViolation("result message has neither 'result' nor 'error'".to_string())
    })
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    let tail = lines[start..].join("\n");
    if tail.is_empty() {
        "process exited with a failure status and no output".to_string()
    } else {
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn status(code: i32) -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(code << 8)
    }

    #[cfg(unix)]
    #[test]
    fn single_result_message_is_returned() {
        let out = "starting\n::flowhost::{\"result\": {\"ok\": true}}\n";
        let value = interpret_output("t", status(0), out, "").unwrap();
        assert_eq!(value, json!({"ok": true}));
    }

    #[cfg(unix)]
    #[test]
    fn result_message_wins_over_exit_code() {
        let out = "::flowhost::{\"result\": 7}\n";
        assert_eq!(interpret_output("t", status(3), out, "").unwrap(), json!(7));
    }

    #[cfg(unix)]
    #[test]
    fn two_messages_are_a_protocol_violation() {
        let out = "::flowhost::{\"result\": 1}\n::flowhost::{\"result\": 2}\n";
        let err = interpret_output("t", status(0), out, "").unwrap_err();
        assert!(matches!(err, EngineError::ProtocolViolation(_)));
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_without_message_is_process_failure() {
        let err = interpret_output("t", status(2), "", "boom\n").unwrap_err();
        match err {
            EngineError::ProcessFailure { code, message } => {
                assert_eq!(code, Some(2));
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn error_message_becomes_component_error() {
        let err = parse_message("{\"error\": {\"message\": \"bad input\"}}").unwrap_err();
        assert!(matches!(err, EngineError::ComponentError(m) if m == "bad input"));
        assert!(matches!(
            parse_message("not json").unwrap_err(),
            EngineError::ProtocolViolation(_)
        ));
    }
}
