//! The lifecycle engine: drives a task through its workflow's stages,
//! checkpointing at each boundary, and owns the cross-cutting task
//! operations (trash, merge, PR-merge cleanup) that don't belong to the
//! Store or a workspace provider alone.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use apex_store::{
    Artifact, Autonomy, Checkpoint, Gate, GateStatus, LogEntry, LogLevel, PauseReason, Priority, Store, StoreError, Task,
    TaskPatch, TaskStatus,
};

use crate::agent::{AgentContext, AgentError, AgentRuntime};
use crate::config::TaskLimits;
use crate::domain::WorkflowRegistry;
use crate::events::EventBus;
use crate::scheduler::DaemonScheduler;
use crate::usage::{LimitSignal, UsageManager};
use crate::vcs::{self, VcsError};
use crate::workspace::{WorkspaceError, WorkspaceProvider};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("task {0} is not in a resumable state")]
    NotResumable(String),

    #[error("task {0} has no branch to merge")]
    NoBranch(String),

    #[error("task id must not be empty")]
    EmptyTaskId,

    #[error("worktree management is not enabled")]
    WorktreeDisabled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Vcs(#[from] VcsError),
}

#[derive(Debug, Clone, Default)]
pub struct CreateTaskRequest {
    pub project_path: String,
    pub workflow: String,
    pub description: String,
    pub acceptance_criteria: Option<String>,
    pub autonomy: Autonomy,
    pub priority: Priority,
    pub effort: Option<String>,
    pub depends_on: Vec<String>,
    pub parent_id: Option<String>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    pub squash: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MergeResult {
    pub success: bool,
    pub changed_files: Vec<String>,
    pub error: Option<String>,
    pub conflicted: bool,
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Which workspace strategy the orchestrator was wired up with. Determines
/// the `shouldPreserveOnFailure` fallback when a task carries no per-task
/// override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceStrategy {
    None,
    Worktree,
    Container,
}

pub struct Orchestrator {
    store: Arc<Store>,
    events: Arc<EventBus>,
    workflows: WorkflowRegistry,
    agent: Arc<dyn AgentRuntime>,
    usage: Arc<UsageManager>,
    workspace: Option<Arc<dyn WorkspaceProvider>>,
    workspace_strategy: WorkspaceStrategy,
    repo_root: PathBuf,
    worktree_preserve_on_failure: bool,
    cleanup_on_complete: bool,
    scheduler: Option<Arc<DaemonScheduler>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        events: Arc<EventBus>,
        workflows: WorkflowRegistry,
        agent: Arc<dyn AgentRuntime>,
        usage: Arc<UsageManager>,
        workspace: Option<Arc<dyn WorkspaceProvider>>,
        workspace_strategy: WorkspaceStrategy,
        repo_root: PathBuf,
        worktree_preserve_on_failure: bool,
        cleanup_on_complete: bool,
    ) -> Self {
        Self {
            store,
            events,
            workflows,
            agent,
            usage,
            workspace,
            workspace_strategy,
            repo_root,
            worktree_preserve_on_failure,
            cleanup_on_complete,
            scheduler: None,
        }
    }

    /// Attach the daemon scheduler so `execute_task` can evaluate usage
    /// against the current day/night window's effective task limits instead
    /// of always falling back to the configured default.
    pub fn with_scheduler(mut self, scheduler: Arc<DaemonScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    fn current_task_limits(&self) -> TaskLimits {
        match &self.scheduler {
            Some(scheduler) => {
                let mode = scheduler.current_time_window(chrono::Local::now()).mode;
                scheduler.effective_task_limits(mode)
            }
            None => TaskLimits::default(),
        }
    }

    pub fn create_task(&self, req: CreateTaskRequest) -> Result<Task, OrchestratorError> {
        if !self.workflows.get(&req.workflow).is_some() {
            return Err(OrchestratorError::UnknownWorkflow(req.workflow));
        }
        let mut task = Task::new(req.project_path, req.workflow, req.description);
        task.acceptance_criteria = req.acceptance_criteria;
        task.autonomy = req.autonomy;
        task.priority = req.priority;
        task.effort = req.effort;
        task.depends_on = req.depends_on;
        task.parent_id = req.parent_id;
        if let Some(max_retries) = req.max_retries {
            task.max_retries = max_retries;
        }

        self.store.create_task(&task)?;
        self.events.emitter_for(&task.id).task_created();
        Ok(task)
    }

    /// Drive `task_id` through its workflow, one stage at a time, from its
    /// recorded stage (or the beginning, for a fresh task) onward.
    pub async fn execute_task(&self, task_id: &str) -> Result<(), OrchestratorError> {
        debug!(%task_id, "Orchestrator::execute_task: called");
        let mut task = self.get_task(task_id)?;
        let workflow = self
            .workflows
            .get(&task.workflow)
            .ok_or_else(|| OrchestratorError::UnknownWorkflow(task.workflow.clone()))?
            .clone();

        let start_index = task
            .stage
            .as_deref()
            .and_then(|s| workflow.stage_index(s))
            .unwrap_or(0);

        if task.status != TaskStatus::InProgress {
            self.store.update_task(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::InProgress),
                    stage: Some(workflow.stages.get(start_index).map(|s| s.name.clone())),
                    ..Default::default()
                },
            )?;
            self.usage.task_started();
            self.events
                .emitter_for(task_id)
                .task_started(workflow.stages.get(start_index).map(|s| s.name.clone()));
            task = self.get_task(task_id)?;
        }

        for (index, stage) in workflow.stages.iter().enumerate().skip(start_index) {
            let checkpoint = self.store.get_latest_checkpoint(task_id)?;
            let ctx = AgentContext {
                task: task.clone(),
                stage: stage.clone(),
                stage_index: index,
                checkpoint,
                context_summary: task.session_data.context_summary.clone(),
            };

            let outcome = match self.agent.run_stage(ctx).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.handle_stage_failure(&mut task, e.to_string()).await?;
                    return Ok(());
                }
            };

            for mut log in outcome.logs {
                log.task_id = task_id.to_string();
                self.store.add_log(&log)?;
            }
            for mut artifact in outcome.artifacts {
                artifact.task_id = task_id.to_string();
                self.store.add_artifact(&artifact)?;
            }

            task.usage.add(outcome.input_tokens, outcome.output_tokens, outcome.cost);
            self.store.update_task(
                task_id,
                TaskPatch {
                    usage: Some(task.usage),
                    ..Default::default()
                },
            )?;
            let limit_signals = self.usage.record_usage(
                task_id,
                outcome.input_tokens,
                outcome.output_tokens,
                outcome.cost,
                &self.current_task_limits(),
            );

            let checkpoint_id = format!("{task_id}-ck-{index}");
            self.store.save_checkpoint(&Checkpoint {
                task_id: task_id.to_string(),
                checkpoint_id,
                stage: stage.name.clone(),
                stage_index: index as u32,
                conversation_state: outcome.conversation_state,
                metadata: serde_json::json!({}),
                created_at: now_iso(),
            })?;

            if !outcome.success {
                self.handle_stage_failure(&mut task, outcome.error.unwrap_or_else(|| "stage failed".to_string()))
                    .await?;
                return Ok(());
            }

            if task.autonomy == Autonomy::Manual && index == 0 {
                self.pause_task(task_id, "manual autonomy halts after planning", None, PauseReason::Manual)?;
                return Ok(());
            }

            if task.autonomy == Autonomy::Supervised {
                if let Some(gate_name) = outcome.gate_name {
                    let already_approved = self
                        .store
                        .get_all_gates(task_id)?
                        .into_iter()
                        .any(|g| g.name == gate_name && g.status == GateStatus::Approved);

                    if !already_approved {
                        self.store.set_gate(&Gate {
                            task_id: task_id.to_string(),
                            name: gate_name.clone(),
                            status: GateStatus::Pending,
                            required_at: now_iso(),
                            responded_at: None,
                            approver: None,
                            comment: None,
                        })?;
                        self.pause_task(task_id, &format!("awaiting gate approval: {gate_name}"), None, PauseReason::Manual)?;
                        return Ok(());
                    }
                }
            }

            if limit_signals.contains(&LimitSignal::Budget) {
                self.pause_task(task_id, "daily usage budget exhausted", None, PauseReason::Budget)?;
                return Ok(());
            }
            if limit_signals.contains(&LimitSignal::TaskLimit) {
                self.pause_task(task_id, "task usage limit reached", None, PauseReason::UsageLimit)?;
                return Ok(());
            }

            let next_stage = workflow.stages.get(index + 1).map(|s| s.name.clone());
            self.store.update_task(
                task_id,
                TaskPatch {
                    stage: Some(next_stage),
                    ..Default::default()
                },
            )?;
            task = self.get_task(task_id)?;
        }

        self.store.update_task(
            task_id,
            TaskPatch {
                status: Some(TaskStatus::Completed),
                completed_at: Some(Some(now_iso())),
                ..Default::default()
            },
        )?;
        self.usage.task_finished(true);
        self.events.emitter_for(task_id).task_completed();
        Ok(())
    }

    fn pause_task(
        &self,
        task_id: &str,
        reason: &str,
        resume_after: Option<String>,
        pause_reason: PauseReason,
    ) -> Result<(), OrchestratorError> {
        self.store.update_task(
            task_id,
            TaskPatch {
                status: Some(TaskStatus::Paused),
                paused_at: Some(Some(now_iso())),
                pause_reason: Some(Some(pause_reason)),
                resume_after: Some(resume_after.clone()),
                ..Default::default()
            },
        )?;
        self.events.emitter_for(task_id).task_paused(reason, resume_after);
        Ok(())
    }

    async fn handle_stage_failure(&self, task: &mut Task, error: String) -> Result<(), OrchestratorError> {
        warn!(task_id = %task.id, %error, "Orchestrator: stage failed");
        task.retry_count += 1;
        let retryable = task.retry_count < task.max_retries;

        self.store.update_task(
            &task.id,
            TaskPatch {
                status: Some(if retryable { TaskStatus::Pending } else { TaskStatus::Failed }),
                retry_count: Some(task.retry_count),
                error: Some(Some(error.clone())),
                completed_at: if retryable { None } else { Some(Some(now_iso())) },
                ..Default::default()
            },
        )?;
        self.usage.task_finished(false);
        self.events.emitter_for(&task.id).task_failed(error.clone());

        let refreshed = self.get_task(&task.id)?;
        self.maybe_cleanup_workspace_on_failure(&refreshed).await;
        Ok(())
    }

    fn should_preserve_on_failure(&self, task: &Task) -> bool {
        if let Some(explicit) = task.workspace_config.get("preserveOnFailure").and_then(|v| v.as_bool()) {
            return explicit;
        }
        match self.workspace_strategy {
            WorkspaceStrategy::Worktree => self.worktree_preserve_on_failure,
            WorkspaceStrategy::Container | WorkspaceStrategy::None => false,
        }
    }

    async fn maybe_cleanup_workspace_on_failure(&self, task: &Task) {
        if self.should_preserve_on_failure(task) {
            return;
        }
        if !self.cleanup_on_complete {
            return;
        }
        let Some(provider) = &self.workspace else { return };
        if let Err(e) = provider.delete(&task.id).await {
            error!(task_id = %task.id, error = %e, "workspace cleanup after failure errored");
            let _ = self.store.add_log(&LogEntry {
                task_id: task.id.clone(),
                timestamp: now_iso(),
                level: LogLevel::Error,
                stage: task.stage.clone(),
                agent: None,
                message: format!("workspace cleanup failed: {e}"),
                metadata: serde_json::Value::Null,
            });
        }
    }

    /// Reconstitute a paused task's context from its latest checkpoint and
    /// re-enter `execute_task` at the recorded stage.
    pub async fn resume_paused_task(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let task = self.get_task(task_id)?;
        if task.status != TaskStatus::Paused {
            return Err(OrchestratorError::NotResumable(task_id.to_string()));
        }

        let checkpoint = self.store.get_latest_checkpoint(task_id)?;
        let summary = checkpoint
            .as_ref()
            .map(|c| format!("resumed from stage '{}' (checkpoint {})", c.stage, c.checkpoint_id));

        self.store.update_task(
            task_id,
            TaskPatch {
                status: Some(TaskStatus::InProgress),
                paused_at: Some(None),
                resume_after: Some(None),
                pause_reason: Some(None),
                resume_attempts: Some(task.resume_attempts + 1),
                session_data: Some(apex_store::SessionData {
                    last_checkpoint_at: checkpoint.as_ref().map(|c| c.created_at.clone()),
                    context_summary: summary.clone(),
                    conversation_ref: checkpoint.map(|c| c.checkpoint_id),
                }),
                ..Default::default()
            },
        )?;
        self.events.emitter_for(task_id).task_session_resumed("paused", summary);

        self.execute_task(task_id).await
    }

    pub async fn check_pr_merged(&self, task_id: &str) -> Result<bool, OrchestratorError> {
        let task = self.get_task(task_id)?;
        Ok(vcs::check_pr_merged(&self.repo_root, task.pr_url.as_deref()).await)
    }

    /// Delete a task's worktree once its PR has merged. Returns `false`
    /// (never an error) for every condition short of an actual deletion
    /// failure: missing task, unmerged PR, missing workspace record.
    pub async fn cleanup_merged_worktree(&self, task_id: &str) -> Result<bool, OrchestratorError> {
        if task_id.is_empty() {
            return Err(OrchestratorError::EmptyTaskId);
        }
        let Some(provider) = &self.workspace else {
            return Err(OrchestratorError::WorktreeDisabled);
        };
        if self.workspace_strategy != WorkspaceStrategy::Worktree {
            return Err(OrchestratorError::WorktreeDisabled);
        }

        let task = match self.store.get_task(task_id)? {
            Some(t) => t,
            None => {
                warn!(%task_id, "cleanup_merged_worktree: task not found");
                return Ok(false);
            }
        };

        if !self.check_pr_merged(task_id).await? {
            info!(%task_id, "cleanup_merged_worktree: PR not merged yet");
            return Ok(false);
        }

        let Some(info) = provider.get(task_id).await? else {
            warn!(%task_id, "cleanup_merged_worktree: no workspace on record");
            return Ok(false);
        };

        match provider.delete(task_id).await {
            Ok(true) => {
                info!(%task_id, path = ?info.path, "worktree cleaned up after merge");
                self.events
                    .emitter_for(task_id)
                    .worktree_merge_cleaned(info.path.display().to_string(), task.pr_url.as_deref());
                Ok(true)
            }
            Ok(false) => {
                warn!(%task_id, "cleanup_merged_worktree: delete reported nothing removed");
                Ok(false)
            }
            Err(e) => {
                error!(%task_id, error = %e, "cleanup_merged_worktree: delete failed");
                let _ = task;
                Ok(false)
            }
        }
    }

    pub fn trash_task(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let _task = self.get_task(task_id)?;
        self.store.update_task(
            task_id,
            TaskPatch {
                status: Some(TaskStatus::Cancelled),
                trashed_at: Some(Some(now_iso())),
                ..Default::default()
            },
        )?;
        self.events.emitter_for(task_id).task_trashed();
        Ok(())
    }

    pub async fn merge_task_branch(&self, task_id: &str, options: MergeOptions) -> Result<MergeResult, OrchestratorError> {
        let task = self.get_task(task_id)?;
        let branch = task.branch.clone().ok_or_else(|| OrchestratorError::NoBranch(task_id.to_string()))?;

        let outcome = vcs::merge_branch(&self.repo_root, &branch, options.squash).await?;
        if outcome.conflicted {
            let _ = self.store.add_log(&LogEntry {
                task_id: task_id.to_string(),
                timestamp: now_iso(),
                level: LogLevel::Error,
                stage: task.stage.clone(),
                agent: None,
                message: format!("merge of branch {branch} has conflicts"),
                metadata: serde_json::Value::Null,
            });
        }

        Ok(MergeResult {
            success: outcome.success,
            changed_files: outcome.changed_files,
            error: outcome.error,
            conflicted: outcome.conflicted,
        })
    }

    fn get_task(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        self.store
            .get_task(task_id)?
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentOutcome, NoopAgentRuntime};
    use crate::config::UsageConfig;
    use async_trait::async_trait;

    struct FailingAgent;

    #[async_trait]
    impl AgentRuntime for FailingAgent {
        async fn run_stage(&self, _ctx: AgentContext) -> Result<AgentOutcome, AgentError> {
            Ok(AgentOutcome {
                success: false,
                error: Some("boom".to_string()),
                ..Default::default()
            })
        }
    }

    fn orchestrator(agent: Arc<dyn AgentRuntime>) -> (Orchestrator, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let events = Arc::new(EventBus::with_default_capacity());
        let usage = Arc::new(UsageManager::new(UsageConfig {
            daily_budget_usd: 100.0,
            default_task_limit_usd: 10.0,
            default_max_tokens_per_task: 100_000,
        }));
        let orch = Orchestrator::new(
            store.clone(),
            events,
            WorkflowRegistry::with_defaults(),
            agent,
            usage,
            None,
            WorkspaceStrategy::None,
            PathBuf::from("."),
            false,
            true,
        );
        (orch, store)
    }

    #[tokio::test]
    async fn execute_task_runs_all_stages_to_completion() {
        let (orch, store) = orchestrator(Arc::new(NoopAgentRuntime));
        let task = orch
            .create_task(CreateTaskRequest {
                project_path: "/proj".to_string(),
                workflow: "default".to_string(),
                description: "do it".to_string(),
                autonomy: Autonomy::Full,
                ..Default::default()
            })
            .unwrap();

        orch.execute_task(&task.id).await.unwrap();

        let reloaded = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(reloaded.status, TaskStatus::Completed);
        assert!(reloaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn manual_autonomy_halts_after_first_stage() {
        let (orch, store) = orchestrator(Arc::new(NoopAgentRuntime));
        let task = orch
            .create_task(CreateTaskRequest {
                project_path: "/proj".to_string(),
                workflow: "default".to_string(),
                description: "do it".to_string(),
                autonomy: Autonomy::Manual,
                ..Default::default()
            })
            .unwrap();

        orch.execute_task(&task.id).await.unwrap();

        let reloaded = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(reloaded.status, TaskStatus::Paused);
    }

    #[tokio::test]
    async fn failed_stage_requeues_while_retries_remain() {
        let (orch, store) = orchestrator(Arc::new(FailingAgent));
        let mut task = orch
            .create_task(CreateTaskRequest {
                project_path: "/proj".to_string(),
                workflow: "default".to_string(),
                description: "do it".to_string(),
                autonomy: Autonomy::Full,
                max_retries: Some(3),
                ..Default::default()
            })
            .unwrap();
        task.max_retries = 3;

        orch.execute_task(&task.id).await.unwrap();

        let reloaded = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(reloaded.status, TaskStatus::Pending);
        assert_eq!(reloaded.retry_count, 1);
    }

    #[tokio::test]
    async fn failed_stage_terminates_once_retries_exhausted() {
        let (orch, store) = orchestrator(Arc::new(FailingAgent));
        let task = orch
            .create_task(CreateTaskRequest {
                project_path: "/proj".to_string(),
                workflow: "default".to_string(),
                description: "do it".to_string(),
                autonomy: Autonomy::Full,
                max_retries: Some(1),
                ..Default::default()
            })
            .unwrap();

        orch.execute_task(&task.id).await.unwrap();

        let reloaded = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(reloaded.status, TaskStatus::Failed);
    }

    struct ExpensiveAgent;

    #[async_trait]
    impl AgentRuntime for ExpensiveAgent {
        async fn run_stage(&self, ctx: AgentContext) -> Result<AgentOutcome, AgentError> {
            Ok(AgentOutcome {
                conversation_state: serde_json::json!({ "stage": ctx.stage.name }),
                input_tokens: 10,
                output_tokens: 10,
                cost: 1_000.0,
                success: true,
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn stage_crossing_daily_budget_pauses_task_with_budget_reason() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let events = Arc::new(EventBus::with_default_capacity());
        let usage = Arc::new(UsageManager::new(UsageConfig {
            daily_budget_usd: 1.0,
            default_task_limit_usd: 10_000.0,
            default_max_tokens_per_task: 10_000_000,
        }));
        let orch = Orchestrator::new(
            store.clone(),
            events,
            WorkflowRegistry::with_defaults(),
            Arc::new(ExpensiveAgent),
            usage,
            None,
            WorkspaceStrategy::None,
            PathBuf::from("."),
            false,
            true,
        );
        let task = orch
            .create_task(CreateTaskRequest {
                project_path: "/proj".to_string(),
                workflow: "default".to_string(),
                description: "do it".to_string(),
                autonomy: Autonomy::Full,
                ..Default::default()
            })
            .unwrap();

        orch.execute_task(&task.id).await.unwrap();

        let reloaded = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(reloaded.status, TaskStatus::Paused);
        assert_eq!(reloaded.pause_reason, Some(PauseReason::Budget));
    }

    #[tokio::test]
    async fn trash_task_sets_cancelled_and_trashed_at() {
        let (orch, store) = orchestrator(Arc::new(NoopAgentRuntime));
        let task = orch
            .create_task(CreateTaskRequest {
                project_path: "/proj".to_string(),
                workflow: "default".to_string(),
                description: "do it".to_string(),
                ..Default::default()
            })
            .unwrap();

        orch.trash_task(&task.id).unwrap();

        let reloaded = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(reloaded.status, TaskStatus::Cancelled);
        assert!(reloaded.trashed_at.is_some());
    }

    #[tokio::test]
    async fn cleanup_merged_worktree_rejects_empty_task_id() {
        let (orch, _store) = orchestrator(Arc::new(NoopAgentRuntime));
        let err = orch.cleanup_merged_worktree("").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::EmptyTaskId));
    }

    #[tokio::test]
    async fn cleanup_merged_worktree_requires_worktree_strategy() {
        let (orch, _store) = orchestrator(Arc::new(NoopAgentRuntime));
        let err = orch.cleanup_merged_worktree("task-x").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::WorktreeDisabled));
    }

    #[tokio::test]
    async fn merge_task_branch_fails_without_a_branch() {
        let (orch, _store) = orchestrator(Arc::new(NoopAgentRuntime));
        let task = orch
            .create_task(CreateTaskRequest {
                project_path: "/proj".to_string(),
                workflow: "default".to_string(),
                description: "do it".to_string(),
                ..Default::default()
            })
            .unwrap();

        let err = orch.merge_task_branch(&task.id, MergeOptions::default()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NoBranch(_)));
    }
}
