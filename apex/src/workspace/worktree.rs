//! Git worktree workspace provider: shells out to the VCS CLI to create an
//! isolated working copy per task under a shared worktree base directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, info, warn};

use apex_store::{Store, WorkspaceInfoRow};

use super::{WorkspaceError, WorkspaceInfo, WorkspaceProvider, WorkspaceStatus};

const TASK_PREFIX: &str = "task-";

pub struct WorktreeProvider {
    base_dir: PathBuf,
    repo_root: PathBuf,
    max_active: u32,
    prune_stale_after_days: u32,
    store: Arc<Store>,
}

impl WorktreeProvider {
    pub fn new(base_dir: PathBuf, repo_root: PathBuf, max_active: u32, prune_stale_after_days: u32, store: Arc<Store>) -> Self {
        Self {
            base_dir,
            repo_root,
            max_active,
            prune_stale_after_days,
            store,
        }
    }

    fn dir_name(task_id: &str) -> String {
        format!("{TASK_PREFIX}{task_id}")
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        self.base_dir.join(Self::dir_name(task_id))
    }

    /// Final path segment matching `task-<id>` yields `<id>`; anything else
    /// is not one of ours.
    fn task_id_from_path(path: &Path) -> Option<String> {
        let name = path.file_name()?.to_str()?;
        name.strip_prefix(TASK_PREFIX).map(|s| s.to_string())
    }

    async fn classify(&self, path: &Path, is_task_dir: bool) -> WorkspaceStatus {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(_) => return WorkspaceStatus::Prunable,
        };
        if !is_task_dir {
            return WorkspaceStatus::Prunable;
        }
        let modified = match metadata.modified() {
            Ok(m) => m,
            Err(_) => return WorkspaceStatus::Active,
        };
        let age = std::time::SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();
        let stale_after = std::time::Duration::from_secs(u64::from(self.prune_stale_after_days) * 24 * 3600);
        if age > stale_after {
            WorkspaceStatus::Stale
        } else {
            WorkspaceStatus::Active
        }
    }

    async fn active_count(&self) -> Result<u32, WorkspaceError> {
        let entries = self.scan().await?;
        Ok(entries
            .iter()
            .filter(|(_, _, status)| *status == WorkspaceStatus::Active)
            .count() as u32)
    }

    /// Scan the base directory: `(task_id_if_ours, path, status)` per entry.
    async fn scan(&self) -> Result<Vec<(Option<String>, PathBuf, WorkspaceStatus)>, WorkspaceError> {
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
            let task_id = Self::task_id_from_path(&path);
            let status = self.classify(&path, task_id.is_some()).await;
            out.push((task_id, path, status));
        }
        Ok(out)
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output, WorkspaceError> {
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .await
            .map_err(|e| WorkspaceError::CreateFailed(e.to_string()))
    }
}

#[async_trait]
impl WorkspaceProvider for WorktreeProvider {
    async fn create(&self, task_id: &str, branch: Option<&str>) -> Result<WorkspaceInfo, WorkspaceError> {
        debug!(%task_id, "WorktreeProvider::create: called");
        let path = self.path_for(task_id);
        if path.exists() {
            return Err(WorkspaceError::AlreadyExists(task_id.to_string()));
        }

        let active = self.active_count().await?;
        if active >= self.max_active {
            return Err(WorkspaceError::CapacityExceeded(self.max_active));
        }

        tokio::fs::create_dir_all(&self.base_dir).await?;

        let branch_name = branch.map(str::to_string).unwrap_or_else(|| format!("apex/{task_id}"));
        let path_str = path.to_string_lossy().to_string();
        let output = self
            .git(&["worktree", "add", &path_str, "-b", &branch_name, "HEAD"])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorkspaceError::CreateFailed(stderr.to_string()));
        }
        info!(%task_id, ?path, branch = %branch_name, "worktree created");

        let now = Utc::now().to_rfc3339();
        self.store.set_workspace_info(&WorkspaceInfoRow {
            task_id: task_id.to_string(),
            kind: "worktree".to_string(),
            path: path_str,
            branch: Some(branch_name.clone()),
            created_at: now.clone(),
            last_used_at: now,
        })?;

        Ok(WorkspaceInfo {
            task_id: task_id.to_string(),
            kind: "worktree".to_string(),
            path,
            branch: Some(branch_name),
            status: WorkspaceStatus::Active,
        })
    }

    async fn get(&self, task_id: &str) -> Result<Option<WorkspaceInfo>, WorkspaceError> {
        let Some(row) = self.store.get_workspace_info(task_id)? else {
            return Ok(None);
        };
        let path = PathBuf::from(&row.path);
        let status = self.classify(&path, true).await;
        Ok(Some(WorkspaceInfo {
            task_id: row.task_id,
            kind: row.kind,
            path,
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
        debug!(%task_id, "WorktreeProvider::delete: called");
        let path = self.path_for(task_id);
        if !path.exists() {
            self.store.delete_workspace_info(task_id)?;
            return Ok(false);
        }

        let path_str = path.to_string_lossy().to_string();
        let output = self.git(&["worktree", "remove", &path_str, "--force"]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("is not a working tree") {
                warn!(%task_id, error = %stderr, "git worktree remove failed, attempting manual cleanup");
                if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                    return Err(WorkspaceError::DeleteFailed(format!("{stderr}; manual cleanup failed: {e}")));
                }
                let _ = self.git(&["worktree", "prune"]).await;
            }
        }

        self.store.delete_workspace_info(task_id)?;
        info!(%task_id, "worktree deleted");
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<WorkspaceInfo>, WorkspaceError> {
        let entries = self.scan().await?;
        let mut out = Vec::new();
        for (task_id, path, status) in entries {
            let Some(task_id) = task_id else { continue };
            let branch = self.store.get_workspace_info(&task_id)?.and_then(|r| r.branch);
            out.push(WorkspaceInfo {
                task_id,
                kind: "worktree".to_string(),
                path,
                branch,
                status,
            });
        }
        Ok(out)
    }

    async fn cleanup_orphaned(&self) -> Result<Vec<String>, WorkspaceError> {
        let entries = self.scan().await?;
        let mut removed = Vec::new();
        for (task_id, path, status) in entries {
            if status == WorkspaceStatus::Active {
                continue;
            }
            if let Some(task_id) = task_id {
                debug!(%task_id, ?status, "cleanup_orphaned: removing");
                match self.delete(&task_id).await {
                    Ok(_) => removed.push(task_id),
                    Err(e) => warn!(%task_id, error = %e, "cleanup_orphaned: failed to remove"),
                }
            } else if status == WorkspaceStatus::Prunable {
                // Not one of ours and not accessible/tracked; leave the main
                // working tree and anything else untouched, only remove
                // directories that look like abandoned worktree checkouts.
                let _ = tokio::fs::remove_dir_all(&path).await;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn setup_git_repo(dir: &Path) {
        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
            vec!["commit", "--allow-empty", "-m", "initial"],
        ] {
            Command::new("git").args(&args).current_dir(dir).output().await.unwrap();
        }
    }

    fn provider(base: PathBuf, repo: PathBuf, store: Arc<Store>) -> WorktreeProvider {
        WorktreeProvider::new(base, repo, 20, 7, store)
    }

    #[tokio::test]
    async fn create_is_idempotent_and_rejects_reuse() {
        let repo = tempdir().unwrap();
        let base = tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        let store = Arc::new(Store::open_in_memory().unwrap());
        let p = provider(base.path().to_path_buf(), repo.path().to_path_buf(), store);

        let info = p.create("abc123-task-demo", None).await.unwrap();
        assert!(info.path.exists());

        let err = p.create("abc123-task-demo", None).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn delete_reports_false_when_absent() {
        let repo = tempdir().unwrap();
        let base = tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        let store = Arc::new(Store::open_in_memory().unwrap());
        let p = provider(base.path().to_path_buf(), repo.path().to_path_buf(), store);

        assert!(!p.delete("nonexistent").await.unwrap());
    }

    #[tokio::test]
    async fn create_rejects_once_at_capacity() {
        let repo = tempdir().unwrap();
        let base = tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        let store = Arc::new(Store::open_in_memory().unwrap());
        let p = WorktreeProvider::new(base.path().to_path_buf(), repo.path().to_path_buf(), 1, 7, store);

        p.create("task-one", None).await.unwrap();
        let err = p.create("task-two", None).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::CapacityExceeded(1)));
    }

    #[tokio::test]
    async fn list_reports_created_worktrees() {
        let repo = tempdir().unwrap();
        let base = tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        let store = Arc::new(Store::open_in_memory().unwrap());
        let p = provider(base.path().to_path_buf(), repo.path().to_path_buf(), store);

        p.create("task-a", None).await.unwrap();
        p.create("task-b", None).await.unwrap();

        let list = p.list().await.unwrap();
        assert_eq!(list.len(), 2);
    }

    #[tokio::test]
    async fn cleanup_orphaned_leaves_active_worktrees() {
        let repo = tempdir().unwrap();
        let base = tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        let store = Arc::new(Store::open_in_memory().unwrap());
        let p = provider(base.path().to_path_buf(), repo.path().to_path_buf(), store);

        p.create("task-keep", None).await.unwrap();
        let removed = p.cleanup_orphaned().await.unwrap();
        assert!(removed.is_empty());
        assert!(p.get("task-keep").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn switch_to_updates_last_used_and_returns_path() {
        let repo = tempdir().unwrap();
        let base = tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        let store = Arc::new(Store::open_in_memory().unwrap());
        let p = provider(base.path().to_path_buf(), repo.path().to_path_buf(), store);

        let info = p.create("task-sw", None).await.unwrap();
        let path = p.switch_to("task-sw").await.unwrap();
        assert_eq!(path, info.path);
    }
}
