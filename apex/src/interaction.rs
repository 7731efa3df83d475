//! Interaction Manager: mid-flight task iteration driven by human feedback,
//! with before/after snapshots and diffs recorded against the store's
//! iteration history.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use apex_store::{IterationEntry, Store, StoreError, TaskStatus};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::Snapshot;
use crate::events::EventBus;

#[derive(Debug, thiserror::Error)]
pub enum InteractionError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task {0} is not in-progress")]
    NotInProgress(String),

    #[error("iteration not found: {0}")]
    IterationNotFound(String),

    #[error("iteration {0} has not been completed yet")]
    NotCompleted(String),

    #[error("unknown interaction command: {0}")]
    UnknownCommand(String),

    #[error("invalid params for {command}: {reason}")]
    InvalidParams { command: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileDiff {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationDiff {
    pub files_changed: FileDiff,
    pub token_usage_delta: i64,
    pub cost_delta: f64,
    pub stage_change: Option<(Option<String>, Option<String>)>,
    pub status_change: Option<(String, String)>,
    pub summary: String,
}

/// Tracks a monotonic per-task sequence counter so concurrent `iterateTask`
/// calls on the same task never collide on an iteration id, seeded from the
/// store's existing history on first use.
pub struct InteractionManager {
    store: std::sync::Arc<Store>,
    events: std::sync::Arc<EventBus>,
    sequences: Mutex<HashMap<String, usize>>,
}

impl InteractionManager {
    pub fn new(store: std::sync::Arc<Store>, events: std::sync::Arc<EventBus>) -> Self {
        Self {
            store,
            events,
            sequences: Mutex::new(HashMap::new()),
        }
    }

    fn next_sequence(&self, task_id: &str) -> Result<usize, InteractionError> {
        let mut seqs = self.sequences.lock().unwrap();
        let next = match seqs.get(task_id) {
            Some(n) => *n + 1,
            None => self.store.get_iteration_history(task_id)?.len(),
        };
        seqs.insert(task_id.to_string(), next);
        Ok(next)
    }

    pub fn iterate_task(
        &self,
        task_id: &str,
        feedback: &str,
        context: Option<serde_json::Value>,
    ) -> Result<String, InteractionError> {
        debug!(%task_id, "InteractionManager::iterate_task: called");
        let task = self
            .store
            .get_task(task_id)?
            .ok_or_else(|| InteractionError::TaskNotFound(task_id.to_string()))?;
        if task.status != TaskStatus::InProgress {
            return Err(InteractionError::NotInProgress(task_id.to_string()));
        }

        let sequence = self.next_sequence(task_id)?;
        let iteration_id = apex_store::generate_iteration_id(task_id, sequence);
        let before_state = serde_json::to_value(Snapshot::capture(&task)).unwrap_or(serde_json::Value::Null);

        let mut before_with_context = before_state.clone();
        if let (Some(ctx), serde_json::Value::Object(ref mut map)) = (&context, &mut before_with_context) {
            map.insert("context".to_string(), ctx.clone());
        }

        let entry = IterationEntry {
            id: iteration_id.clone(),
            task_id: task_id.to_string(),
            feedback: feedback.to_string(),
            stage: task.stage.clone(),
            before_state: before_with_context,
            after_state: None,
            modified_files: Vec::new(),
            diff_summary: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.store.add_iteration_entry(&entry)?;

        self.events
            .emitter_for(task_id)
            .task_iterate(iteration_id.clone(), feedback, context);
        Ok(iteration_id)
    }

    pub fn complete_iteration(&self, task_id: &str, iteration_id: &str) -> Result<(), InteractionError> {
        debug!(%task_id, %iteration_id, "InteractionManager::complete_iteration: called");
        let task = self
            .store
            .get_task(task_id)?
            .ok_or_else(|| InteractionError::TaskNotFound(task_id.to_string()))?;

        let history = self.store.get_iteration_history(task_id)?;
        let entry = history
            .iter()
            .find(|e| e.id == iteration_id)
            .ok_or_else(|| InteractionError::IterationNotFound(iteration_id.to_string()))?;

        let before: Snapshot = serde_json::from_value(entry.before_state.clone()).unwrap_or(Snapshot::capture(&task));
        let after = Snapshot::capture(&task);
        let after_value = serde_json::to_value(&after).unwrap_or(serde_json::Value::Null);

        let modified_files = union_sorted(&before.files.modified, &after.files.modified);
        let diff_summary = format!(
            "{} file(s) touched, {} token(s), ${:.4} cost",
            modified_files.len(),
            after.usage.total_tokens().saturating_sub(before.usage.total_tokens()),
            after.usage.estimated_cost - before.usage.estimated_cost
        );

        self.store
            .update_iteration_entry(iteration_id, &after_value, &diff_summary, &modified_files)?;
        Ok(())
    }

    /// Diff the specified iteration's before/after snapshots, or the latest
    /// iteration's if none is given. `after` falls back to the task's live
    /// state when the iteration hasn't been completed yet.
    pub fn get_iteration_diff(&self, task_id: &str, iteration_id: Option<&str>) -> Result<IterationDiff, InteractionError> {
        let task = self
            .store
            .get_task(task_id)?
            .ok_or_else(|| InteractionError::TaskNotFound(task_id.to_string()))?;
        let history = self.store.get_iteration_history(task_id)?;

        let entry = match iteration_id {
            Some(id) => history
                .iter()
                .find(|e| e.id == id)
                .ok_or_else(|| InteractionError::IterationNotFound(id.to_string()))?,
            None => history
                .last()
                .ok_or_else(|| InteractionError::IterationNotFound(task_id.to_string()))?,
        };

        let before: Snapshot = serde_json::from_value(entry.before_state.clone()).unwrap_or(Snapshot::capture(&task));
        let after: Snapshot = match &entry.after_state {
            Some(v) => serde_json::from_value(v.clone()).unwrap_or_else(|_| Snapshot::capture(&task)),
            None => Snapshot::capture(&task),
        };

        let added = subtract(&after.files.modified, &before.files.modified);
        let removed = subtract(&before.files.modified, &after.files.modified);
        let modified = subtract(&entry.modified_files, &added);

        let stage_change = if before.stage != after.stage {
            Some((before.stage.clone(), after.stage.clone()))
        } else {
            None
        };
        let status_change = if before.status != after.status {
            Some((before.status.clone(), after.status.clone()))
        } else {
            None
        };

        let token_usage_delta = after.usage.total_tokens() as i64 - before.usage.total_tokens() as i64;
        let cost_delta = after.usage.estimated_cost - before.usage.estimated_cost;

        let mut summary = format!(
            "{} file(s) added, {} modified, {} removed, {} token(s), ${:.4} cost",
            added.len(),
            modified.len(),
            removed.len(),
            token_usage_delta,
            cost_delta
        );
        if let Some((from, to)) = &stage_change {
            summary.push_str(&format!("; stage {from:?} -> {to:?}"));
        }
        if let Some((from, to)) = &status_change {
            summary.push_str(&format!("; status {from} -> {to}"));
        }

        Ok(IterationDiff {
            files_changed: FileDiff { added, modified, removed },
            token_usage_delta,
            cost_delta,
            stage_change,
            status_change,
            summary,
        })
    }

    /// Dispatch a client-submitted interaction command, logging it to the
    /// store and emitting `interaction:received`/`interaction:processed`
    /// around the dispatch regardless of outcome.
    pub fn submit_interaction(
        &self,
        task_id: &str,
        command: &str,
        params: &serde_json::Value,
        requested_by: Option<&str>,
    ) -> Result<serde_json::Value, InteractionError> {
        self.events.emitter_for(task_id).interaction_received(command, requested_by.map(str::to_string));

        let result = self.dispatch(task_id, command, params);

        let (success, result_json, error_msg) = match &result {
            Ok(value) => (true, Some(value.clone()), None),
            Err(e) => (false, None, Some(e.to_string())),
        };
        let _ = self.store.add_interaction(
            task_id,
            command,
            params,
            requested_by,
            result_json.as_ref(),
            error_msg.as_deref(),
        );
        self.events.emitter_for(task_id).interaction_processed(command, success);

        result
    }

    fn dispatch(&self, task_id: &str, command: &str, params: &serde_json::Value) -> Result<serde_json::Value, InteractionError> {
        match command {
            "iterate" => {
                let feedback = params
                    .get("feedback")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| InteractionError::InvalidParams {
                        command: command.to_string(),
                        reason: "missing feedback".to_string(),
                    })?;
                let context = params.get("context").cloned();
                let iteration_id = self.iterate_task(task_id, feedback, context)?;
                Ok(serde_json::json!({ "iterationId": iteration_id }))
            }
            "iteration-diff" => {
                let iteration_id = params.get("iterationId").and_then(|v| v.as_str());
                let diff = self.get_iteration_diff(task_id, iteration_id)?;
                Ok(serde_json::to_value(diff).unwrap_or(serde_json::Value::Null))
            }
            other => Err(InteractionError::UnknownCommand(other.to_string())),
        }
    }
}

fn subtract(a: &[String], b: &[String]) -> Vec<String> {
    let b_set: HashSet<&String> = b.iter().collect();
    a.iter().filter(|x| !b_set.contains(x)).cloned().collect()
}

fn union_sorted(a: &[String], b: &[String]) -> Vec<String> {
    let mut set: HashSet<String> = a.iter().cloned().collect();
    set.extend(b.iter().cloned());
    let mut out: Vec<String> = set.into_iter().collect();
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use apex_store::Task;
    use std::sync::Arc;

    fn setup() -> (InteractionManager, Arc<Store>, Task) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let events = Arc::new(EventBus::with_default_capacity());
        let mut task = Task::new("/proj", "default", "do the thing");
        task.status = TaskStatus::InProgress;
        store.create_task(&task).unwrap();
        (InteractionManager::new(store.clone(), events), store, task)
    }

    #[test]
    fn iterate_task_rejects_non_in_progress_task() {
        let (manager, store, mut task) = setup();
        task.status = TaskStatus::Pending;
        store
            .update_task(
                &task.id,
                apex_store::TaskPatch {
                    status: Some(TaskStatus::Pending),
                    ..Default::default()
                },
            )
            .unwrap();

        let err = manager.iterate_task(&task.id, "feedback", None).unwrap_err();
        assert!(matches!(err, InteractionError::NotInProgress(_)));
    }

    #[test]
    fn concurrent_iterations_get_distinct_ids() {
        let (manager, _store, task) = setup();
        let a = manager.iterate_task(&task.id, "fb1", None).unwrap();
        let b = manager.iterate_task(&task.id, "fb2", None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn complete_iteration_records_after_state_and_summary() {
        let (manager, store, task) = setup();
        let iteration_id = manager.iterate_task(&task.id, "fb", None).unwrap();
        manager.complete_iteration(&task.id, &iteration_id).unwrap();

        let history = store.get_iteration_history(&task.id).unwrap();
        let entry = history.iter().find(|e| e.id == iteration_id).unwrap();
        assert!(entry.after_state.is_some());
        assert!(entry.diff_summary.is_some());
    }

    #[test]
    fn iteration_diff_reports_no_changes_when_nothing_happened() {
        let (manager, _store, task) = setup();
        let iteration_id = manager.iterate_task(&task.id, "fb", None).unwrap();
        manager.complete_iteration(&task.id, &iteration_id).unwrap();

        let diff = manager.get_iteration_diff(&task.id, Some(&iteration_id)).unwrap();
        assert!(diff.files_changed.added.is_empty());
        assert!(diff.stage_change.is_none());
        assert!(diff.status_change.is_none());
    }

    #[test]
    fn submit_interaction_dispatches_iterate_command() {
        let (manager, _store, task) = setup();
        let params = serde_json::json!({ "feedback": "please fix x" });
        let result = manager.submit_interaction(&task.id, "iterate", &params, Some("alice")).unwrap();
        assert!(result.get("iterationId").is_some());
    }

    #[test]
    fn submit_interaction_rejects_unknown_command() {
        let (manager, _store, task) = setup();
        let err = manager
            .submit_interaction(&task.id, "bogus", &serde_json::json!({}), None)
            .unwrap_err();
        assert!(matches!(err, InteractionError::UnknownCommand(_)));
    }
}
