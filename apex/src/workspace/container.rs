//! Container workspace provider: isolates a task inside a docker or podman
//! container instead of a git worktree. Runtime detection and creation both
//! shell out to the container CLI; there is no client library dependency.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use apex_store::{Store, WorkspaceInfoRow};

use crate::config::ContainerConfig;

use super::{WorkspaceError, WorkspaceInfo, WorkspaceProvider, WorkspaceStatus};

const TASK_PREFIX: &str = "task-";
const LABEL: &str = "apex.managed=true";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    Docker,
    Podman,
}

impl ContainerRuntime {
    fn binary(self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerStats {
    #[serde(rename = "CPUPerc")]
    pub cpu_percent: String,
    #[serde(rename = "MemUsage")]
    pub mem_usage: String,
}

pub struct ContainerProvider {
    config: ContainerConfig,
    base_dir: PathBuf,
    store: Arc<Store>,
    detected: Mutex<Option<Option<ContainerRuntime>>>,
}

impl ContainerProvider {
    pub fn new(config: ContainerConfig, base_dir: PathBuf, store: Arc<Store>) -> Result<Self, WorkspaceError> {
        config.validate().map_err(WorkspaceError::CreateFailed)?;
        Ok(Self {
            config,
            base_dir,
            store,
            detected: Mutex::new(None),
        })
    }

    fn container_name(task_id: &str) -> String {
        format!("apex-{task_id}")
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        self.base_dir.join(format!("{TASK_PREFIX}{task_id}"))
    }

    fn task_id_from_dir(name: &str) -> Option<String> {
        name.strip_prefix(TASK_PREFIX).map(|s| s.to_string())
    }

    /// Detect docker or podman, preferring docker, and cache the result
    /// until [`Self::clear_cache`] is called. Detection failure both runs
    /// are cached too, so repeated `create` calls on a runtime-less host
    /// don't re-shell every time.
    pub async fn detect(&self) -> Option<ContainerRuntime> {
        if let Some(cached) = *self.detected.lock().unwrap() {
            return cached;
        }
        let runtime = Self::probe(ContainerRuntime::Docker)
            .await
            .or(Self::probe(ContainerRuntime::Podman).await);
        *self.detected.lock().unwrap() = Some(runtime);
        runtime
    }

    async fn probe(runtime: ContainerRuntime) -> Option<ContainerRuntime> {
        Command::new(runtime.binary())
            .arg("--version")
            .output()
            .await
            .ok()
            .filter(|o| o.status.success())
            .map(|_| runtime)
    }

    /// Idempotent: concurrent detect() calls racing a clear_cache() always
    /// settle on a consistent cached value, never a half-written one.
    pub fn clear_cache(&self) {
        *self.detected.lock().unwrap() = None;
    }

    async fn require_runtime(&self) -> Result<ContainerRuntime, WorkspaceError> {
        if !self.config.enabled {
            return Err(WorkspaceError::Disabled);
        }
        self.detect().await.ok_or(WorkspaceError::NoRuntime)
    }

    async fn inspect_running(&self, runtime: ContainerRuntime, name: &str) -> Option<bool> {
        let output = Command::new(runtime.binary())
            .args(["inspect", "--format", "{{.State.Running}}", name])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Some(stdout.trim() == "true")
    }

    /// Parse single-line `docker stats --no-stream --format '{{json .}}'`
    /// output. Malformed input yields `None` rather than an error -- a
    /// transient stats read failure should never fail the caller.
    pub async fn get_stats(&self, task_id: &str) -> Option<ContainerStats> {
        let runtime = self.detect().await?;
        let name = Self::container_name(task_id);
        let output = Command::new(runtime.binary())
            .args(["stats", "--no-stream", "--format", "{{json .}}", &name])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let line = String::from_utf8_lossy(&output.stdout);
        let line = line.lines().next()?;
        serde_json::from_str(line).ok()
    }

    /// Validate a detected runtime's version string against an inclusive
    /// `[min, max]` range. Components are compared as integers; a
    /// non-numeric suffix (`"24.0.5+dfsg1"`) is truncated to its leading
    /// digits before comparison. Absent bounds are unconstrained.
    pub fn version_compatible(version: &str, min_version: Option<&str>, max_version: Option<&str>) -> bool {
        let v = parse_version(version);
        if let Some(min) = min_version {
            if compare_versions(&v, &parse_version(min)) == std::cmp::Ordering::Less {
                return false;
            }
        }
        if let Some(max) = max_version {
            if compare_versions(&v, &parse_version(max)) == std::cmp::Ordering::Greater {
                return false;
            }
        }
        true
    }

    async fn runtime_version(&self, runtime: ContainerRuntime) -> Option<String> {
        let output = Command::new(runtime.binary()).arg("--version").output().await.ok()?;
        let text = String::from_utf8_lossy(&output.stdout).to_string();
        // e.g. "Docker version 24.0.5, build ced0996" -> "24.0.5"
        text.split_whitespace()
            .find(|tok| tok.chars().next().is_some_and(|c| c.is_ascii_digit()))
            .map(|tok| tok.trim_end_matches(',').to_string())
    }

    pub async fn runtime_is_compatible(&self, min_version: Option<&str>, max_version: Option<&str>) -> Option<bool> {
        let runtime = self.detect().await?;
        let version = self.runtime_version(runtime).await?;
        Some(Self::version_compatible(&version, min_version, max_version))
    }
}

fn parse_version(v: &str) -> Vec<u64> {
    v.split('.')
        .map(|component| {
            component
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
        })
        .map(|digits| digits.parse::<u64>().unwrap_or(0))
        .collect()
}

fn compare_versions(a: &[u64], b: &[u64]) -> std::cmp::Ordering {
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

#[async_trait]
impl WorkspaceProvider for ContainerProvider {
    async fn create(&self, task_id: &str, _branch: Option<&str>) -> Result<WorkspaceInfo, WorkspaceError> {
        debug!(%task_id, "ContainerProvider::create: called");
        let runtime = self.require_runtime().await?;

        let path = self.path_for(task_id);
        if path.exists() {
            return Err(WorkspaceError::AlreadyExists(task_id.to_string()));
        }
        tokio::fs::create_dir_all(&path).await?;

        let name = Self::container_name(task_id);
        let bind = format!("{}:/workspace", path.to_string_lossy());
        let create_output = Command::new(runtime.binary())
            .args([
                "create",
                "--name",
                &name,
                "--label",
                LABEL,
                "--label",
                &format!("apex.task={task_id}"),
                "--cpus",
                &self.config.cpu.to_string(),
                "--cpu-shares",
                &self.config.cpu_shares.to_string(),
                "--memory",
                &format!("{}m", self.config.memory_mb),
                "--pids-limit",
                &self.config.pids_limit.to_string(),
                "-v",
                &bind,
                &self.config.image,
            ])
            .output()
            .await
            .map_err(|e| WorkspaceError::CreateFailed(e.to_string()))?;

        if !create_output.status.success() {
            let stderr = String::from_utf8_lossy(&create_output.stderr).to_string();
            let _ = tokio::fs::remove_dir_all(&path).await;
            return Err(WorkspaceError::CreateFailed(stderr));
        }

        let start_output = Command::new(runtime.binary())
            .args(["start", &name])
            .output()
            .await
            .map_err(|e| WorkspaceError::CreateFailed(e.to_string()))?;

        if !start_output.status.success() {
            let stderr = String::from_utf8_lossy(&start_output.stderr).to_string();
            warn!(%task_id, error = %stderr, "container start failed, rolling back create");
            let _ = Command::new(runtime.binary()).args(["rm", "--force", &name]).output().await;
            let _ = tokio::fs::remove_dir_all(&path).await;
            return Err(WorkspaceError::CreateFailed(stderr));
        }

        info!(%task_id, container = %name, "container workspace created");

        let now = Utc::now().to_rfc3339();
        self.store.set_workspace_info(&WorkspaceInfoRow {
            task_id: task_id.to_string(),
            kind: "container".to_string(),
            path: path.to_string_lossy().to_string(),
            branch: Some(name.clone()),
            created_at: now.clone(),
            last_used_at: now,
        })?;

        Ok(WorkspaceInfo {
            task_id: task_id.to_string(),
            kind: "container".to_string(),
            path,
            branch: Some(name),
            status: WorkspaceStatus::Active,
        })
    }

    async fn get(&self, task_id: &str) -> Result<Option<WorkspaceInfo>, WorkspaceError> {
        let Some(row) = self.store.get_workspace_info(task_id)? else {
            return Ok(None);
        };
        let status = match self.detect().await {
            Some(runtime) => match self.inspect_running(runtime, &Self::container_name(task_id)).await {
                Some(true) => WorkspaceStatus::Active,
                Some(false) => WorkspaceStatus::Stale,
                None => WorkspaceStatus::Prunable,
            },
            None => WorkspaceStatus::Prunable,
        };
        Ok(Some(WorkspaceInfo {
            task_id: row.task_id,
            kind: row.kind,
            path: PathBuf::from(row.path),
            branch: row.branch,
            status,
        }))
    }

    async fn switch_to(&self, task_id: &str) -> Result<PathBuf, WorkspaceError> {
        let mut row = self
            .store
            .get_workspace_info(task_id)?
            .ok_or_else(|| WorkspaceError::NotFound(task_id.to_string()))?;
        row.last_used_at = Utc::now().to_rfc3339();
        let path = PathBuf::from(&row.path);
        self.store.set_workspace_info(&row)?;
        Ok(path)
    }

    async fn delete(&self, task_id: &str) -> Result<bool, WorkspaceError> {
        debug!(%task_id, "ContainerProvider::delete: called");
        let Some(row) = self.store.get_workspace_info(task_id)? else {
            return Ok(false);
        };

        if let Some(runtime) = self.detect().await {
            let name = row.branch.clone().unwrap_or_else(|| Self::container_name(task_id));
            let _ = Command::new(runtime.binary())
                .args(["stop", "--time", "5", &name])
                .output()
                .await;
            let _ = Command::new(runtime.binary()).args(["rm", "--force", &name]).output().await;
        }

        let path = PathBuf::from(&row.path);
        if path.exists() {
            tokio::fs::remove_dir_all(&path).await?;
        }
        self.store.delete_workspace_info(task_id)?;
        info!(%task_id, "container workspace deleted");
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<WorkspaceInfo>, WorkspaceError> {
        let mut out = Vec::new();
        if !self.base_dir.exists() {
            return Ok(out);
        }
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(task_id) = Self::task_id_from_dir(name) else {
                continue;
            };
            if let Some(info) = self.get(&task_id).await? {
                out.push(info);
            }
        }
        Ok(out)
    }

    async fn cleanup_orphaned(&self) -> Result<Vec<String>, WorkspaceError> {
        let entries = self.list().await?;
        let mut removed = Vec::new();
        for info in entries {
            if info.status == WorkspaceStatus::Active {
                continue;
            }
            match self.delete(&info.task_id).await {
                Ok(_) => removed.push(info.task_id),
                Err(e) => warn!(task_id = %info.task_id, error = %e, "cleanup_orphaned: failed to remove"),
            }
        }
        Ok(removed)
    }
}
