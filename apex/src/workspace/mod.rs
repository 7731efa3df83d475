//! Workspace providers: isolate a task's working copy, either as a git
//! worktree or a container. Both implement the same [`WorkspaceProvider`]
//! trait so the orchestrator never branches on which strategy a task uses.

pub mod container;
pub mod worktree;

use async_trait::async_trait;
use std::path::PathBuf;

pub use container::{ContainerProvider, ContainerRuntime};
pub use worktree::WorktreeProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceStatus {
    Active,
    Stale,
    Prunable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceInfo {
    pub task_id: String,
    pub kind: String,
    pub path: PathBuf,
    pub branch: Option<String>,
    pub status: WorkspaceStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("workspace already exists for task {0}")]
    AlreadyExists(String),

    #[error("workspace not found for task {0}")]
    NotFound(String),

    #[error("active workspace count at capacity ({0})")]
    CapacityExceeded(u32),

    #[error("failed to create workspace: {0}")]
    CreateFailed(String),

    #[error("failed to delete workspace: {0}")]
    DeleteFailed(String),

    #[error("workspace provider disabled")]
    Disabled,

    #[error("container runtime unavailable")]
    NoRuntime,

    #[error(transparent)]
    Store(#[from] apex_store::StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Common interface over a worktree or container backed workspace.
///
/// `create` is idempotent per `task_id`: a second call against an existing
/// workspace returns [`WorkspaceError::AlreadyExists`] rather than silently
/// reusing or overwriting it. `delete` is not idempotent in the same sense --
/// it reports whether anything was actually removed.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    async fn create(&self, task_id: &str, branch: Option<&str>) -> Result<WorkspaceInfo, WorkspaceError>;

    async fn get(&self, task_id: &str) -> Result<Option<WorkspaceInfo>, WorkspaceError>;

    /// Update the last-used timestamp and return the workspace path.
    async fn switch_to(&self, task_id: &str) -> Result<PathBuf, WorkspaceError>;

    async fn delete(&self, task_id: &str) -> Result<bool, WorkspaceError>;

    async fn list(&self) -> Result<Vec<WorkspaceInfo>, WorkspaceError>;

    /// Remove workspaces classified `stale` or `prunable`. Never touches the
    /// main working tree. Returns the task ids removed.
    async fn cleanup_orphaned(&self) -> Result<Vec<String>, WorkspaceError>;
}
