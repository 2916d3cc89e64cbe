//! TOML configuration for taskpilot.
//!
//! Layered model: compiled-in defaults, overridden by a config file found via
//! the `TASKPILOT_CONFIG` environment variable or the standard system path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the taskpilot process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PilotConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub tail: TailConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PilotConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded taskpilot configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `TASKPILOT_CONFIG` environment variable.
    /// 2. `/etc/taskpilot/taskpilot.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("TASKPILOT_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "TASKPILOT_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new("/etc/taskpilot/taskpilot.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port for the HTTP API.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Where jobs, workspaces and run logs live on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Root of per-job workspaces (`<root>/<job_id>`).
    pub workspace_root: PathBuf,
    /// Root of run logs (`<root>/<job_id>/<step_id>/<run_id>/<entry>.log`).
    pub log_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/taskpilot.db"),
            workspace_root: PathBuf::from("data/workspaces"),
            log_root: PathBuf::from("data/logs"),
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// How step processes are launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Program used for manual and imported jobs (resolved via `$PATH`).
    pub playbook_program: String,
    /// Flags always passed ahead of the job's own CLI arguments.
    pub default_flags: Vec<String>,
    /// Shell used to run the script of templated jobs.
    pub script_shell: String,
    /// Program used to fetch imported jobs.
    pub git_program: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            playbook_program: "ansible-playbook".to_string(),
            default_flags: vec!["-v".to_string()],
            script_shell: "bash".to_string(),
            git_program: "git".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Job execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// History rows kept per job when the job does not set its own limit.
    pub default_history_keep: u32,
    /// Stop launching steps after the first failure.
    pub fail_fast: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_history_keep: 3,
            fail_fast: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tail
// ---------------------------------------------------------------------------

/// Timing of the live log tailer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TailConfig {
    /// File growth poll interval (milliseconds).
    pub poll_interval_ms: u64,
    /// Persisted step status is checked every N polls.
    pub status_check_every: u32,
    /// A heartbeat is emitted every N polls.
    pub heartbeat_every: u32,
    /// Attempts to wait for a step to be assigned a log path.
    pub log_path_retries: u32,
    /// Attempts to wait for the log file of a running step to appear.
    pub file_wait_retries: u32,
    /// Attempts to wait for the log file of an already finished step.
    pub finished_file_wait_retries: u32,
    /// Pause between open attempts (milliseconds).
    pub open_interval_ms: u64,
    /// Delay before the final drain once the step finished (milliseconds).
    pub drain_grace_ms: u64,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            status_check_every: 10,
            heartbeat_every: 25,
            log_path_retries: 5,
            file_wait_retries: 30,
            finished_file_wait_retries: 3,
            open_interval_ms: 1000,
            drain_grace_ms: 300,
        }
    }
}

impl TailConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn open_interval(&self) -> Duration {
        Duration::from_millis(self.open_interval_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Recurrence scheduler switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Load and fire recurring jobs when serving.
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Diagnostic logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = PilotConfig::default();

        assert_eq!(cfg.server.bind, "0.0.0.0:8080");
        assert_eq!(cfg.storage.db_path, PathBuf::from("data/taskpilot.db"));
        assert_eq!(cfg.runner.playbook_program, "ansible-playbook");
        assert_eq!(cfg.runner.default_flags, vec!["-v".to_string()]);
        assert_eq!(cfg.executor.default_history_keep, 3);
        assert!(!cfg.executor.fail_fast);
        assert_eq!(cfg.tail.poll_interval(), Duration::from_millis(200));
        assert_eq!(cfg.tail.status_check_every, 10);
        assert_eq!(cfg.tail.heartbeat_every, 25);
        assert_eq!(cfg.tail.drain_grace(), Duration::from_millis(300));
        assert!(cfg.scheduler.enabled);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[executor]
fail_fast = true

[tail]
poll_interval_ms = 50
"#;

        let cfg: PilotConfig = toml::from_str(toml_str).unwrap();

        assert!(cfg.executor.fail_fast);
        assert_eq!(cfg.executor.default_history_keep, 3);
        assert_eq!(cfg.tail.poll_interval_ms, 50);
        assert_eq!(cfg.tail.heartbeat_every, 25);
        assert_eq!(cfg.server.bind, "0.0.0.0:8080");
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: PilotConfig = toml::from_str("").unwrap();
        let defaults = PilotConfig::default();

        assert_eq!(cfg.storage.log_root, defaults.storage.log_root);
        assert_eq!(cfg.tail.open_interval_ms, defaults.tail.open_interval_ms);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("taskpilot.toml");
        std::fs::write(
            &path,
            r#"
[storage]
db_path = "/var/lib/taskpilot/jobs.db"

[runner]
playbook_program = "/opt/ansible/bin/ansible-playbook"
default_flags = []
"#,
        )
        .unwrap();

        let cfg = PilotConfig::load(&path).unwrap();
        assert_eq!(cfg.storage.db_path, PathBuf::from("/var/lib/taskpilot/jobs.db"));
        assert_eq!(cfg.runner.playbook_program, "/opt/ansible/bin/ansible-playbook");
        assert!(cfg.runner.default_flags.is_empty());
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = PilotConfig::load(Path::new("/nonexistent/path/taskpilot.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let tail = TailConfig {
            poll_interval_ms: 0,
            ..TailConfig::default()
        };
        assert_eq!(tail.poll_interval(), Duration::from_millis(1));
    }
}
