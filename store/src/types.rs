//! Persisted record types.
//!
//! These mirror the data model: a `Task` is the atomic unit of work, with
//! append-only `LogEntry`/`Artifact` bags, `Gate` approval checkpoints,
//! `Checkpoint` conversation snapshots and `IterationEntry` refinement
//! records hanging off it by id.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// `{urgent, high, normal, low}`, ordered so `Ord` sorts urgent first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "urgent" => Ok(Self::Urgent),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            _ => Err(format!("unknown priority: {s}")),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Autonomy {
    Full,
    #[default]
    Supervised,
    Manual,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in-progress" => Ok(Self::InProgress),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    UsageLimit,
    Budget,
    Capacity,
    Manual,
    UserRequest,
    SystemShutdown,
    Error,
}

impl PauseReason {
    /// Reasons `getPausedTasksForResume` considers auto-resumable.
    pub fn is_auto_resumable(&self) -> bool {
        matches!(self, Self::UsageLimit | Self::Budget | Self::Capacity)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStrategy {
    #[default]
    Sequential,
    Parallel,
}

/// Cumulative token/cost usage. `total_tokens` is always the sum of the two
/// token fields; there is no independent "total" to drift out of sync.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost: f64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, input_tokens: u64, output_tokens: u64, cost: f64) {
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.estimated_cost += cost;
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub last_checkpoint_at: Option<String>,
    pub context_summary: Option<String>,
    pub conversation_ref: Option<String>,
}

/// The atomic unit of work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_path: String,
    pub workflow: String,
    pub parent_id: Option<String>,
    pub subtask_ids: Vec<String>,
    pub subtask_strategy: SubtaskStrategy,

    pub description: String,
    pub acceptance_criteria: Option<String>,
    pub autonomy: Autonomy,
    pub priority: Priority,
    pub effort: Option<String>,

    pub status: TaskStatus,
    pub stage: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub resume_attempts: u32,
    pub branch: Option<String>,
    pub pr_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    pub trashed_at: Option<String>,

    pub paused_at: Option<String>,
    pub resume_after: Option<String>,
    pub pause_reason: Option<PauseReason>,

    pub usage: Usage,
    pub workspace_config: serde_json::Value,
    pub session_data: SessionData,

    pub depends_on: Vec<String>,
    /// Derived, recomputed on every read; never written directly. Subset of
    /// `depends_on` whose referent is not `completed`/`cancelled`.
    #[serde(default)]
    pub blocked_by: Vec<String>,
    pub error: Option<String>,

    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub iteration_history: Vec<IterationEntry>,
}

impl Task {
    /// `blockedBy` is derived, never stored directly: the subset of
    /// `dependsOn` whose referent is not `completed`/`cancelled`, as observed
    /// via the (id -> status) map the caller supplies.
    pub fn blocked_by(&self, statuses: &HashMap<String, TaskStatus>) -> Vec<String> {
        self.depends_on
            .iter()
            .filter(|dep| {
                !matches!(
                    statuses.get(*dep),
                    Some(TaskStatus::Completed) | Some(TaskStatus::Cancelled)
                )
            })
            .cloned()
            .collect()
    }

    pub fn new(project_path: impl Into<String>, workflow: impl Into<String>, description: impl Into<String>) -> Self {
        let now = now_iso();
        Self {
            id: crate::id::generate_task_id(),
            project_path: project_path.into(),
            workflow: workflow.into(),
            parent_id: None,
            subtask_ids: Vec::new(),
            subtask_strategy: SubtaskStrategy::default(),
            description: description.into(),
            acceptance_criteria: None,
            autonomy: Autonomy::default(),
            priority: Priority::default(),
            effort: None,
            status: TaskStatus::default(),
            stage: None,
            retry_count: 0,
            max_retries: 3,
            resume_attempts: 0,
            branch: None,
            pr_url: None,
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
            trashed_at: None,
            paused_at: None,
            resume_after: None,
            pause_reason: None,
            usage: Usage::default(),
            workspace_config: serde_json::Value::Null,
            session_data: SessionData::default(),
            depends_on: Vec::new(),
            blocked_by: Vec::new(),
            error: None,
            logs: Vec::new(),
            artifacts: Vec::new(),
            iteration_history: Vec::new(),
        }
    }
}

/// Partial update for [`crate::Store::update_task`].
///
/// Every field is an `Option<Option<T>>` where the outer `None` means "not
/// present in the patch, leave unchanged" and `Some(None)` means "present and
/// explicitly cleared to null" -- needed so a resume can clear `pause_reason`
/// and friends back to null (and kept uniform across the struct for
/// consistency).
#[derive(Clone, Debug, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub stage: Option<Option<String>>,
    pub retry_count: Option<u32>,
    pub resume_attempts: Option<u32>,
    pub branch: Option<Option<String>>,
    pub pr_url: Option<Option<String>>,
    pub completed_at: Option<Option<String>>,
    pub trashed_at: Option<Option<String>>,
    pub paused_at: Option<Option<String>>,
    pub resume_after: Option<Option<String>>,
    pub pause_reason: Option<Option<PauseReason>>,
    pub usage: Option<Usage>,
    pub workspace_config: Option<serde_json::Value>,
    pub session_data: Option<SessionData>,
    pub depends_on: Option<Vec<String>>,
    pub error: Option<Option<String>>,
    pub subtask_ids: Option<Vec<String>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub task_id: String,
    pub timestamp: String,
    pub level: LogLevel,
    pub stage: Option<String>,
    pub agent: Option<String>,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub task_id: String,
    pub name: String,
    pub artifact_type: String,
    pub path: Option<String>,
    pub content: Option<String>,
    pub created_at: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Gate {
    pub task_id: String,
    pub name: String,
    pub status: GateStatus,
    pub required_at: String,
    pub responded_at: Option<String>,
    pub approver: Option<String>,
    pub comment: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: String,
    pub checkpoint_id: String,
    pub stage: String,
    pub stage_index: u32,
    pub conversation_state: serde_json::Value,
    pub metadata: serde_json::Value,
    pub created_at: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationEntry {
    pub id: String,
    pub task_id: String,
    pub feedback: String,
    pub stage: Option<String>,
    pub before_state: serde_json::Value,
    pub after_state: Option<serde_json::Value>,
    pub modified_files: Vec<String>,
    pub diff_summary: Option<String>,
    pub created_at: String,
}

/// Cached taskId <-> workspace-path mapping. The VCS/container engine is the
/// source of truth; this row is a cache the providers refresh.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceInfoRow {
    pub task_id: String,
    pub kind: String,
    pub path: String,
    pub branch: Option<String>,
    pub created_at: String,
    pub last_used_at: String,
}

/// Filter for [`crate::Store::list_tasks`].
#[derive(Clone, Debug, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub limit: Option<u32>,
    pub order_by_priority: bool,
    pub include_trashed: bool,
}
