/// Configuration management for the Flowhost engine
///
/// Handles server configuration, document store location, sandbox limits and
/// task queue tuning. Every field can be overridden through a `FLOWHOST_*`
/// environment variable for container deployments.

use crate::sandbox::script::DEFAULT_SCRIPT_MEMORY_LIMIT;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, str::FromStr, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Document store configuration
    pub storage: StorageConfig,
    /// Component loading configuration
    pub components: ComponentsConfig,
    /// Sandbox runtime limits
    pub sandbox: SandboxConfig,
    /// Task queue tuning
    pub queue: QueueConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Document store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file backing workflows and user components
    pub database_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentsConfig {
    /// Directory holding `local` namespace components, one subdirectory each
    pub local_dir: PathBuf,
}

/// Limits shared by the process and script sandboxes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Hard wall-clock limit per execution
    pub timeout: Duration,
    /// Where component code is staged for process execution
    pub temp_dir: PathBuf,
    /// Root of the file surface exposed to scripts
    pub script_workdir: PathBuf,
    /// Hosts scripts may reach over HTTP. Empty means any host.
    pub allowed_hosts: Vec<String>,
    /// Heap ceiling per script VM, in bytes
    pub script_memory_limit: usize,
}

/// Task queue tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_concurrent_tasks: usize,
    /// How long the processor waits before re-checking a full worker pool
    pub poll_interval: Duration,
    pub max_retries: u32,
    /// Base delay for exponential retry backoff; zero re-queues immediately
    pub retry_backoff: Duration,
    /// Finished task records kept for status queries
    pub history_limit: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("flowhost");
        Self {
            timeout: Duration::from_secs(30),
            temp_dir: base.join("staging"),
            script_workdir: base.join("scripts"),
            allowed_hosts: Vec::new(),
            script_memory_limit: DEFAULT_SCRIPT_MEMORY_LIMIT,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            poll_interval: Duration::from_secs(1),
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            history_limit: 100,
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        let sandbox_defaults = SandboxConfig::default();
        let queue_defaults = QueueConfig::default();

        Self {
            server: ServerConfig {
                host: env_or("FLOWHOST_HOST", "0.0.0.0".to_string()),
                port: env_or("FLOWHOST_PORT", 3004),
            },
            storage: StorageConfig {
                database_path: env_or("FLOWHOST_DATABASE", PathBuf::from("data/flowhost.db")),
            },
            components: ComponentsConfig {
                local_dir: env_or("FLOWHOST_COMPONENTS_DIR", PathBuf::from("components")),
            },
            sandbox: SandboxConfig {
                timeout: Duration::from_millis(env_or(
                    "FLOWHOST_SANDBOX_TIMEOUT_MS",
                    sandbox_defaults.timeout.as_millis() as u64,
                )),
                temp_dir: env_or("FLOWHOST_SANDBOX_TEMP_DIR", sandbox_defaults.temp_dir),
                script_workdir: env_or("FLOWHOST_SCRIPT_WORKDIR", sandbox_defaults.script_workdir),
                allowed_hosts: std::env::var("FLOWHOST_ALLOWED_HOSTS")
                    .map(|hosts| {
                        hosts
                            .split(',')
                            .map(|h| h.trim().to_string())
                            .filter(|h| !h.is_empty())
                            .collect()
                    })
                    .unwrap_or_default(),
                script_memory_limit: env_or(
                    "FLOWHOST_SCRIPT_MEMORY_LIMIT",
                    sandbox_defaults.script_memory_limit,
                ),
            },
            queue: QueueConfig {
                max_concurrent_tasks: env_or(
                    "FLOWHOST_MAX_CONCURRENT_TASKS",
                    queue_defaults.max_concurrent_tasks,
                ),
                poll_interval: Duration::from_millis(env_or(
                    "FLOWHOST_QUEUE_POLL_MS",
                    queue_defaults.poll_interval.as_millis() as u64,
                )),
                max_retries: env_or("FLOWHOST_MAX_RETRIES", queue_defaults.max_retries),
                retry_backoff: Duration::from_millis(env_or(
                    "FLOWHOST_RETRY_BACKOFF_MS",
                    queue_defaults.retry_backoff.as_millis() as u64,
                )),
                history_limit: env_or("FLOWHOST_TASK_HISTORY", queue_defaults.history_limit),
            },
        }
    }
}

/// Read and parse an environment variable, falling back on absence or parse failure
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("⚠️ Ignoring unparseable value for {}: {}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let queue = QueueConfig::default();
        assert_eq!(queue.max_concurrent_tasks, 5);
        assert_eq!(queue.max_retries, 3);
        assert_eq!(queue.history_limit, 100);
        assert_eq!(SandboxConfig::default().timeout, Duration::from_secs(30));
    }

    #[test]
    fn env_or_falls_back_on_garbage() {
        std::env::set_var("FLOWHOST_TEST_GARBAGE_PORT", "not-a-port");
        assert_eq!(env_or::<u16>("FLOWHOST_TEST_GARBAGE_PORT", 3004), 3004);
        std::env::set_var("FLOWHOST_TEST_GOOD_PORT", "8080");
        assert_eq!(env_or::<u16>("FLOWHOST_TEST_GOOD_PORT", 3004), 8080);
    }
}
