/// In-process script sandbox using embedded Lua
///
/// Every run gets a brand new Lua VM with the dangerous standard library removed.
/// The only way out of the VM is the injected `ctx` capability table:
/// - `ctx.inputs`: the step inputs
/// - `ctx.log(msg)`, `ctx.warn(msg)`: host logging
/// - `ctx.fs.read/write/exists/list`: files under the script work directory
/// - `ctx.http.get(url)`, `ctx.http.post(url, body)`: outbound HTTP, host allowlisted
///
/// A VM is never reused: it is torn down on success, failure and timeout alike.
/// Once the deadline passes the timeout error can no longer be caught: every
/// protected call (`pcall`, `xpcall`, `coroutine.resume`, `coroutine.close`)
/// re-raises it, so the script unwinds to the top and the VM is released.

use crate::error::EngineError;
use mlua::{HookTriggers, Lua, LuaSerdeExt, VmState};
use serde_json::{json, Value};
use std::{
    path::{Component, Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Globals removed from every fresh VM
const BLOCKED_GLOBALS: &[&str] = &[
    "os",
    "io",
    "debug",
    "package",
    "require",
    "dofile",
    "loadfile",
    "load",
    "collectgarbage",
    "print",
];

/// Default heap ceiling for a single VM
pub const DEFAULT_SCRIPT_MEMORY_LIMIT: usize = 64 * 1024 * 1024;

const DEADLINE_MESSAGE: &str = "script deadline exceeded";

/// Replaces the error-catching builtins with versions that re-raise once the
/// deadline has passed. Runs before user code; the originals stay in locals.
const DEADLINE_GUARD: &str = r#"
local expired, error = ...
local raw_pcall, raw_xpcall = pcall, xpcall
local raw_resume, raw_close = coroutine.resume, coroutine.close

local function check(ok, ...)
    if not ok and expired() then
        error("script deadline exceeded", 0)
    end
    return ok, ...
end

pcall = function(...) return check(raw_pcall(...)) end
xpcall = function(...) return check(raw_xpcall(...)) end
coroutine.resume = function(...) return check(raw_resume(...)) end
coroutine.close = function(...) return check(raw_close(...)) end
"#;

/// VM instructions between deadline checks
const HOOK_INSTRUCTION_INTERVAL: u32 = 1_000;

/// Runs Lua scripts in disposable, capability-scoped VMs
#[derive(Debug, Clone)]
pub struct ScriptSandbox {
    timeout: Duration,
    memory_limit: usize,
    workdir: PathBuf,
    allowed_hosts: Arc<Vec<String>>,
    http: reqwest::Client,
    live_vms: Arc<AtomicUsize>,
}

/// Everything a VM is allowed to reach, moved onto the blocking worker
#[derive(Clone)]
struct Capabilities {
    workdir: PathBuf,
    allowed_hosts: Arc<Vec<String>>,
    http: reqwest::Client,
    runtime: tokio::runtime::Handle,
    deadline: Instant,
    timeout: Duration,
    memory_limit: usize,
}

impl ScriptSandbox {
    pub fn new(timeout: Duration, workdir: impl Into<PathBuf>, allowed_hosts: Vec<String>) -> Self {
        Self {
            timeout,
            memory_limit: DEFAULT_SCRIPT_MEMORY_LIMIT,
            workdir: workdir.into(),
            allowed_hosts: Arc::new(allowed_hosts),
            http: reqwest::Client::new(),
            live_vms: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Cap the heap of each VM, in bytes
    pub fn with_memory_limit(mut self, memory_limit: usize) -> Self {
        self.memory_limit = memory_limit;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// VMs not yet torn down, including ones still unwinding after a timeout
    pub fn live_vms(&self) -> usize {
        self.live_vms.load(Ordering::SeqCst)
    }

    /// Run a script body and return the value it returns
    ///
    /// The body is compiled as a chunk; anything it raises becomes a `ScriptError`.
    /// Exceeding the timeout yields `Timeout` and the VM is discarded.
    pub async fn run(&self, code: &str, inputs: Value) -> Result<Value, EngineError> {
        let start_time = Instant::now();
        let capabilities = Capabilities {
            workdir: self.workdir.clone(),
            allowed_hosts: Arc::clone(&self.allowed_hosts),
            http: self.http.clone(),
            runtime: tokio::runtime::Handle::current(),
            deadline: start_time + self.timeout,
            timeout: self.timeout,
            memory_limit: self.memory_limit,
        };

        tracing::debug!("🧠 Running script in fresh Lua sandbox ({} bytes)", code.len());
        let code = code.to_string();
        let live = LiveVm::enter(&self.live_vms);
        let worker = tokio::task::spawn_blocking(move || {
            let _live = live;
            run_isolated(&code, &inputs, capabilities)
        });

        let result = match tokio::time::timeout(self.timeout, worker).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(EngineError::ScriptError(format!(
                "script worker aborted: {}",
                join_error
            ))),
            // The worker's own hook trips on the same deadline and tears the VM down
            Err(_) => Err(self.timeout_error()),
        };

        match &result {
            Ok(_) => tracing::debug!("✅ Script completed in {:?}", start_time.elapsed()),
            Err(e) => tracing::warn!("❌ Script failed after {:?}: {}", start_time.elapsed(), e),
        }
        result
    }

    fn timeout_error(&self) -> EngineError {
        EngineError::Timeout {
            what: "script".to_string(),
            after: self.timeout,
        }
    }
}

/// Counts a VM as live until its worker returns
struct LiveVm(Arc<AtomicUsize>);

impl LiveVm {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for LiveVm {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Build a VM, evaluate, tear down. Runs on a blocking thread.
fn run_isolated(code: &str, inputs: &Value, capabilities: Capabilities) -> Result<Value, EngineError> {
    let (deadline, timeout) = (capabilities.deadline, capabilities.timeout);
    let context = match ScriptContext::create(inputs, capabilities) {
        Ok(context) => context,
        Err(e) => return Err(lua_error(e)),
    };

    let result = context.evaluate(code);
    context.teardown();

    result.map_err(|e| {
        if Instant::now() >= deadline {
            EngineError::Timeout {
                what: "script".to_string(),
                after: timeout,
            }
        } else {
            lua_error(e)
        }
    })
    .and_then(|value| value)
}

fn lua_error(err: mlua::Error) -> EngineError {
    EngineError::ScriptError(err.to_string())
}

/// One disposable VM plus its capability table
struct ScriptContext {
    lua: Lua,
}

impl ScriptContext {
    fn create(inputs: &Value, capabilities: Capabilities) -> mlua::Result<Self> {
        let lua = Lua::new();
        {
            let globals = lua.globals();
            for name in BLOCKED_GLOBALS {
                globals.set(*name, mlua::Nil)?;
            }

            let ctx = lua.create_table()?;
            ctx.set("inputs", lua.to_value(inputs)?)?;
            ctx.set(
                "log",
                lua.create_function(|_, message: String| {
                    tracing::info!("📝 [script] {}", message);
                    Ok(())
                })?,
            )?;
            ctx.set(
                "warn",
                lua.create_function(|_, message: String| {
                    tracing::warn!("⚠️ [script] {}", message);
                    Ok(())
                })?,
            )?;
            ctx.set("fs", Self::fs_table(&lua, &capabilities.workdir)?)?;
            ctx.set("http", Self::http_table(&lua, &capabilities)?)?;
            globals.set("ctx", ctx)?;
        }

        let deadline = capabilities.deadline;
        let expired = lua.create_function(move |_, ()| Ok(Instant::now() >= deadline))?;
        let raise = lua.globals().get::<mlua::Function>("error")?;
        lua.load(DEADLINE_GUARD)
            .set_name("deadline_guard")
            .call::<()>((expired, raise))?;

        // Global so coroutines created by the script inherit it
        lua.set_global_hook(
            HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
            move |_lua, _debug| {
                if Instant::now() >= deadline {
                    Err(mlua::Error::runtime(DEADLINE_MESSAGE))
                } else {
                    Ok(VmState::Continue)
                }
            },
        )?;
        lua.set_memory_limit(capabilities.memory_limit)?;

        Ok(Self { lua })
    }

    /// Restricted file surface rooted at the work directory
    fn fs_table(lua: &Lua, workdir: &Path) -> mlua::Result<mlua::Table> {
        let fs = lua.create_table()?;

        let root = workdir.to_path_buf();
        fs.set(
            "read",
            lua.create_function(move |_, path: String| {
                let full = confine(&root, &path).map_err(mlua::Error::runtime)?;
                std::fs::read_to_string(full).map_err(mlua::Error::external)
            })?,
        )?;

        let root = workdir.to_path_buf();
        fs.set(
            "write",
            lua.create_function(move |_, (path, content): (String, String)| {
                let full = confine(&root, &path).map_err(mlua::Error::runtime)?;
                if let Some(parent) = full.parent() {
                    std::fs::create_dir_all(parent).map_err(mlua::Error::external)?;
                }
                std::fs::write(full, content).map_err(mlua::Error::external)
            })?,
        )?;

        let root = workdir.to_path_buf();
        fs.set(
            "exists",
            lua.create_function(move |_, path: String| {
                let full = confine(&root, &path).map_err(mlua::Error::runtime)?;
                Ok(full.exists())
            })?,
        )?;

        let root = workdir.to_path_buf();
        fs.set(
            "list",
            lua.create_function(move |_, path: Option<String>| {
                let full = confine(&root, path.as_deref().unwrap_or("."))
                    .map_err(mlua::Error::runtime)?;
                let mut names = Vec::new();
                for entry in std::fs::read_dir(full).map_err(mlua::Error::external)? {
                    let entry = entry.map_err(mlua::Error::external)?;
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
                names.sort();
                Ok(names)
            })?,
        )?;

        Ok(fs)
    }

    /// Outbound HTTP bounded by the run deadline and host allowlist
    fn http_table(lua: &Lua, capabilities: &Capabilities) -> mlua::Result<mlua::Table> {
        let http = lua.create_table()?;

        let caps = capabilities.clone();
        http.set(
            "get",
            lua.create_function(move |lua, url: String| {
                let response = caps.request("GET", &url, None).map_err(mlua::Error::runtime)?;
                lua.to_value(&response)
            })?,
        )?;

        let caps = capabilities.clone();
        http.set(
            "post",
            lua.create_function(move |lua, (url, body): (String, mlua::Value)| {
                let body: Value = lua.from_value(body)?;
                let response = caps
                    .request("POST", &url, Some(body))
                    .map_err(mlua::Error::runtime)?;
                lua.to_value(&response)
            })?,
        )?;

        Ok(http)
    }

    /// Evaluate the script body; the outer error is a Lua failure, the inner a conversion failure
    fn evaluate(&self, code: &str) -> mlua::Result<Result<Value, EngineError>> {
        let function = self.lua.load(code).set_name("script").into_function()?;
        let returned: mlua::Value = function.call(())?;
        Ok(self
            .lua
            .from_value::<Value>(returned)
            .map_err(|e| EngineError::ScriptError(format!("unserializable script result: {}", e))))
    }

    /// Explicitly dispose of the VM
    fn teardown(self) {
        self.lua.remove_global_hook();
        self.lua.remove_hook();
        if let Err(e) = self.lua.gc_collect() {
            tracing::debug!("🧹 Lua collection during teardown failed: {}", e);
        }
        drop(self.lua);
    }
}

impl Capabilities {
    fn request(&self, method: &str, url: &str, body: Option<Value>) -> Result<Value, String> {
        let parsed = reqwest::Url::parse(url).map_err(|e| format!("invalid url '{}': {}", url, e))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(format!("scheme '{}' is not allowed", parsed.scheme()));
        }
        let host = parsed.host_str().unwrap_or_default();
        if !self.allowed_hosts.is_empty() && !self.allowed_hosts.iter().any(|h| h == host) {
            return Err(format!("host '{}' is not in the allowlist", host));
        }

        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(DEADLINE_MESSAGE.to_string());
        }

        let mut request = match method {
            "POST" => self.http.post(parsed),
            _ => self.http.get(parsed),
        }
        .timeout(remaining);
        if let Some(body) = body {
            request = request.json(&body);
        }

        tracing::debug!("🌍 Script HTTP request: {} {}", method, url);
        self.runtime.block_on(async move {
            let response = request.send().await.map_err(|e| format!("HTTP request failed: {}", e))?;
            let status = response.status().as_u16();
            let text = response
                .text()
                .await
                .map_err(|e| format!("Failed to read response body: {}", e))?;
            let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
            Ok(json!({ "status": status, "body": body }))
        })
    }
}

/// Resolve a script-supplied relative path under `root`, rejecting escapes
fn confine(root: &Path, relative: &str) -> Result<PathBuf, String> {
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        return Err(format!("absolute path '{}' is not allowed", relative));
    }
    for component in candidate.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(format!("path '{}' escapes the script workspace", relative)),
        }
    }
    Ok(root.join(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox(dir: &Path, timeout: Duration) -> ScriptSandbox {
        ScriptSandbox::new(timeout, dir, Vec::new())
    }

    #[tokio::test]
    async fn returns_script_value() {
        let dir = tempfile::tempdir().unwrap();
        let result = sandbox(dir.path(), Duration::from_secs(5))
            .run("return { total = ctx.inputs.a + ctx.inputs.b }", json!({"a": 2, "b": 3}))
            .await
            .unwrap();
        assert_eq!(result, json!({"total": 5}));
    }

    #[tokio::test]
    async fn raised_errors_become_script_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = sandbox(dir.path(), Duration::from_secs(5))
            .run("error('boom')", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ScriptError(ref m) if m.contains("boom")), "{err}");
    }

    #[tokio::test]
    async fn host_globals_are_not_reachable() {
        let dir = tempfile::tempdir().unwrap();
        let result = sandbox(dir.path(), Duration::from_secs(5))
            .run("return os == nil and io == nil and require == nil", json!({}))
            .await
            .unwrap();
        assert_eq!(result, json!(true));
    }

    #[tokio::test]
    async fn busy_loop_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let err = sandbox(dir.path(), Duration::from_millis(200))
            .run("while true do end", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }), "{err}");
    }

    async fn wait_for_teardown(sandbox: &ScriptSandbox) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while sandbox.live_vms() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("VM kept running past its deadline");
    }

    #[tokio::test]
    async fn deadline_survives_pcall() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path(), Duration::from_millis(200));
        let err = sb
            .run(
                "while true do pcall(function() while true do end end) end",
                json!({}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }), "{err}");
        wait_for_teardown(&sb).await;
    }

    #[tokio::test]
    async fn deadline_survives_xpcall_and_coroutines() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path(), Duration::from_millis(200));

        let xpcall_loop = "while true do xpcall(function() while true do end end, function(e) return e end) end";
        let err = sb.run(xpcall_loop, json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }), "{err}");

        let coroutine_loop = "while true do \
            local co = coroutine.create(function() while true do end end) \
            coroutine.resume(co) \
        end";
        let err = sb.run(coroutine_loop, json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }), "{err}");

        wait_for_teardown(&sb).await;
    }

    #[tokio::test]
    async fn pcall_still_catches_ordinary_errors() {
        let dir = tempfile::tempdir().unwrap();
        let result = sandbox(dir.path(), Duration::from_secs(5))
            .run(
                "local ok, err = pcall(error, 'nope', 0); return { ok = ok, err = err }",
                json!({}),
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"ok": false, "err": "nope"}));
    }

    #[tokio::test]
    async fn allocation_beyond_memory_limit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path(), Duration::from_secs(5)).with_memory_limit(8 * 1024 * 1024);
        let err = sb
            .run("local s = string.rep('x', 2^31); return #s", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ScriptError(_)), "{err}");

        // Small allocations are unaffected
        let result = sb.run("return #string.rep('x', 1024)", json!({})).await.unwrap();
        assert_eq!(result, json!(1024));
    }

    #[tokio::test]
    async fn print_is_not_available() {
        let dir = tempfile::tempdir().unwrap();
        let result = sandbox(dir.path(), Duration::from_secs(5))
            .run("return print == nil", json!({}))
            .await
            .unwrap();
        assert_eq!(result, json!(true));
    }

    #[tokio::test]
    async fn file_surface_is_confined_to_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path(), Duration::from_secs(5));

        let read_back = sb
            .run(
                "ctx.fs.write('out/note.txt', 'hello'); return ctx.fs.read('out/note.txt')",
                json!({}),
            )
            .await
            .unwrap();
        assert_eq!(read_back, json!("hello"));
        assert!(dir.path().join("out/note.txt").exists());

        let escaped = sb.run("return ctx.fs.read('../secret')", json!({})).await;
        assert!(matches!(escaped, Err(EngineError::ScriptError(_))));
    }

    #[tokio::test]
    async fn http_rejects_non_allowlisted_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let sb = ScriptSandbox::new(
            Duration::from_secs(5),
            dir.path(),
            vec!["api.internal".to_string()],
        );
        let err = sb
            .run("return ctx.http.get('http://example.com/')", json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("allowlist"), "{err}");
    }

    #[test]
    fn confine_rejects_parent_and_absolute_paths() {
        let root = Path::new("/work");
        assert!(confine(root, "a/b.txt").is_ok());
        assert!(confine(root, "../x").is_err());
        assert!(confine(root, "/etc/passwd").is_err());
    }
}
