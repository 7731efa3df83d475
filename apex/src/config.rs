//! Configuration types and fallback-chain loading.

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub scheduler: SchedulerWindowConfig,
    pub usage: UsageConfig,
    pub git: GitConfig,
    pub container: ContainerConfig,
    pub storage: StorageConfig,
    pub workspace: WorkspaceSettingsConfig,
}

impl Config {
    /// Load configuration with fallback chain: explicit path, then
    /// project-local `.apex.yml`, then the user config dir, then defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".apex.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("apex").join("apex.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Daemon runner tuning: poll interval and worker pool size, both clamped by
/// the runner at startup (not here -- the config can hold an out-of-range
/// value, clamping happens once, where the effective config is assembled).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,

    #[serde(rename = "max-concurrent-tasks")]
    pub max_concurrent_tasks: u32,

    #[serde(rename = "shutdown-grace-ms")]
    pub shutdown_grace_ms: u64,

    #[serde(rename = "log-level")]
    pub log_level: String,

    #[serde(rename = "stale-threshold-ms")]
    pub stale_threshold_ms: u64,

    /// Bound on the health monitor's restart-history ring. A negative value
    /// in a hand-edited config file does not deserialize into `u32`; callers
    /// of [`crate::health::HealthMonitor::new`] clamp negative values to 0
    /// at the call site.
    #[serde(rename = "max-restart-history")]
    pub max_restart_history: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            max_concurrent_tasks: 4,
            shutdown_grace_ms: 10_000,
            log_level: "info".to_string(),
            stale_threshold_ms: 15 * 60_000,
            max_restart_history: 50,
        }
    }
}

/// Day/night window configuration for the daemon scheduler.
///
/// Day and night are each a single `[start, end)` range in local-time hours.
/// `start >= end` wraps past midnight (e.g. `night-start-hour = 22`,
/// `night-end-hour = 6` covers 22:00 through 06:00).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerWindowConfig {
    pub enabled: bool,

    #[serde(rename = "day-start-hour")]
    pub day_start_hour: u32,

    #[serde(rename = "day-end-hour")]
    pub day_end_hour: u32,

    #[serde(rename = "night-start-hour")]
    pub night_start_hour: u32,

    #[serde(rename = "night-end-hour")]
    pub night_end_hour: u32,

    #[serde(rename = "day-capacity-threshold")]
    pub day_capacity_threshold: f64,

    #[serde(rename = "night-capacity-threshold")]
    pub night_capacity_threshold: f64,

    /// Per-task limit overrides while in day mode; falls back to
    /// `usage.default-task-limit-usd`/unbounded tokens when absent.
    #[serde(rename = "day-limits")]
    pub day_limits: Option<TaskLimits>,

    #[serde(rename = "night-limits")]
    pub night_limits: Option<TaskLimits>,
}

impl Default for SchedulerWindowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            day_start_hour: 8,
            day_end_hour: 20,
            night_start_hour: 22,
            night_end_hour: 6,
            day_capacity_threshold: 0.8,
            night_capacity_threshold: 0.95,
            day_limits: None,
            night_limits: None,
        }
    }
}

/// Per-task usage ceiling override for a time-of-day mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskLimits {
    #[serde(rename = "max-tokens-per-task")]
    pub max_tokens_per_task: Option<u64>,

    #[serde(rename = "max-cost-per-task-usd")]
    pub max_cost_per_task_usd: Option<f64>,
}

impl Default for TaskLimits {
    fn default() -> Self {
        Self {
            max_tokens_per_task: None,
            max_cost_per_task_usd: None,
        }
    }
}

/// Usage manager defaults: daily budget and a fallback per-task limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    #[serde(rename = "daily-budget-usd")]
    pub daily_budget_usd: f64,

    #[serde(rename = "default-task-limit-usd")]
    pub default_task_limit_usd: f64,

    #[serde(rename = "default-max-tokens-per-task")]
    pub default_max_tokens_per_task: u64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            daily_budget_usd: 50.0,
            default_task_limit_usd: 5.0,
            default_max_tokens_per_task: 2_000_000,
        }
    }
}

/// Worktree provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub worktree: WorktreeConfig,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            worktree: WorktreeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorktreeConfig {
    pub enabled: bool,

    #[serde(rename = "base-dir")]
    pub base_dir: Option<PathBuf>,

    #[serde(rename = "max-active")]
    pub max_active: u32,

    #[serde(rename = "preserve-on-failure")]
    pub preserve_on_failure: bool,

    /// A `task-<id>` worktree whose directory mtime is older than this is
    /// classified `stale` rather than `active` by `cleanupOrphaned`.
    #[serde(rename = "prune-stale-after-days")]
    pub prune_stale_after_days: u32,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_dir: None,
            max_active: 20,
            preserve_on_failure: false,
            prune_stale_after_days: 7,
        }
    }
}

/// Closed option struct for container creation (replaces the dynamic option
/// bag a duck-typed provider interface would otherwise accept).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub enabled: bool,

    pub image: String,

    /// CPU share, 0.1 to 64 cores.
    pub cpu: f64,

    /// CPU shares for relative weighting, 2 to 262144.
    #[serde(rename = "cpu-shares")]
    pub cpu_shares: u32,

    #[serde(rename = "memory-mb")]
    pub memory_mb: u32,

    #[serde(rename = "pids-limit")]
    pub pids_limit: u32,

    #[serde(rename = "install-timeout-secs")]
    pub install_timeout_secs: u64,

    #[serde(rename = "install-retries")]
    pub install_retries: u32,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: "apex-task-runner:latest".to_string(),
            cpu: 2.0,
            cpu_shares: 1024,
            memory_mb: 2048,
            pids_limit: 512,
            install_timeout_secs: 300,
            install_retries: 2,
        }
    }
}

impl ContainerConfig {
    /// Validate the closed option set per the field ranges the system design
    /// calls for. Called once at container-provider construction.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.1..=64.0).contains(&self.cpu) {
            return Err(format!("cpu must be within [0.1, 64], got {}", self.cpu));
        }
        if !(2..=262_144).contains(&self.cpu_shares) {
            return Err(format!("cpu-shares must be within [2, 262144], got {}", self.cpu_shares));
        }
        if self.pids_limit < 1 {
            return Err("pids-limit must be >= 1".to_string());
        }
        if self.install_timeout_secs == 0 {
            return Err("install-timeout-secs must be > 0".to_string());
        }
        Ok(())
    }
}

/// Orchestrator-wide workspace housekeeping, orthogonal to which provider a
/// task uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceSettingsConfig {
    /// Delete a task's workspace once it reaches a terminal state, subject
    /// to `shouldPreserveOnFailure` on the failure path.
    #[serde(rename = "cleanup-on-complete")]
    pub cleanup_on_complete: bool,
}

impl Default for WorkspaceSettingsConfig {
    fn default() -> Self {
        Self {
            cleanup_on_complete: true,
        }
    }
}

/// Storage configuration: where the durable database lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "project-path")]
    pub project_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            project_path: PathBuf::from("."),
        }
    }
}

impl StorageConfig {
    pub fn db_path(&self) -> PathBuf {
        self.project_path.join(".apex").join("apex.db")
    }

    pub fn log_path(&self) -> PathBuf {
        self.project_path.join(".apex").join("daemon.log")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.project_path.join(".apex").join("apex.pid")
    }

    pub fn worktree_base_dir(&self) -> PathBuf {
        self.project_path
            .parent()
            .map(|p| p.join(".apex-worktrees"))
            .unwrap_or_else(|| PathBuf::from(".apex-worktrees"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = Config::default();
        assert_eq!(config.daemon.poll_interval_ms, 5_000);
        assert_eq!(config.daemon.max_concurrent_tasks, 4);
        assert!(config.scheduler.enabled);
        assert_eq!(config.usage.daily_budget_usd, 50.0);
    }

    #[test]
    fn deserialize_partial_config_uses_defaults() {
        let yaml = r#"
daemon:
  poll-interval-ms: 1000
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.daemon.poll_interval_ms, 1000);
        assert_eq!(config.daemon.max_concurrent_tasks, 4);
        assert_eq!(config.scheduler.day_start_hour, 8);
    }

    #[test]
    fn container_config_validates_cpu_range() {
        let mut c = ContainerConfig::default();
        c.cpu = 0.0;
        assert!(c.validate().is_err());
        c.cpu = 2.0;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn storage_paths_are_rooted_at_project_path() {
        let storage = StorageConfig {
            project_path: PathBuf::from("/srv/proj"),
        };
        assert_eq!(storage.db_path(), PathBuf::from("/srv/proj/.apex/apex.db"));
        assert_eq!(storage.log_path(), PathBuf::from("/srv/proj/.apex/daemon.log"));
        assert_eq!(storage.worktree_base_dir(), PathBuf::from("/srv/.apex-worktrees"));
    }
}
