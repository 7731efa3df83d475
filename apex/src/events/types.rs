//! Closed event schema for the orchestrator's activity stream.
//!
//! Every event the orchestrator and runner can emit is a variant here; there
//! is no open-ended payload type. Consumers match exhaustively instead of
//! inspecting a `type` string.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum TaskEvent {
    #[serde(rename = "task:created")]
    TaskCreated { task_id: String },

    #[serde(rename = "task:started")]
    TaskStarted { task_id: String, stage: Option<String> },

    #[serde(rename = "task:completed")]
    TaskCompleted { task_id: String },

    #[serde(rename = "task:failed")]
    TaskFailed { task_id: String, error: String },

    #[serde(rename = "task:paused")]
    TaskPaused {
        task_id: String,
        reason: String,
        resume_after: Option<String>,
    },

    #[serde(rename = "task:resumed")]
    TaskResumed { task_id: String },

    #[serde(rename = "task:session-resumed")]
    TaskSessionResumed {
        task_id: String,
        previous_status: String,
        summary: Option<String>,
    },

    #[serde(rename = "tasks:auto-resumed")]
    TasksAutoResumed {
        resumed_count: usize,
        errors: Vec<String>,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "task:trashed")]
    TaskTrashed { task_id: String },

    #[serde(rename = "task:iterate")]
    TaskIterate {
        task_id: String,
        iteration_id: String,
        instructions: String,
        context: Option<serde_json::Value>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "interaction:received")]
    InteractionReceived {
        task_id: String,
        command: String,
        requested_by: Option<String>,
    },

    #[serde(rename = "interaction:processed")]
    InteractionProcessed {
        task_id: String,
        command: String,
        success: bool,
    },

    #[serde(rename = "worktree:merge-cleaned")]
    WorktreeMergeCleaned {
        task_id: String,
        path: String,
        pr_url: String,
    },

    #[serde(rename = "orphan:detected")]
    OrphanDetected {
        tasks: Vec<String>,
        reason: String,
        staleness_threshold_ms: u64,
        detected_at: DateTime<Utc>,
    },

    #[serde(rename = "orphan:recovered")]
    OrphanRecovered {
        task_id: String,
        previous_status: String,
        new_status: String,
        action: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl TaskEvent {
    /// The event name as it appears over the wire (matches the `#[serde(rename)]`).
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskCreated { .. } => "task:created",
            Self::TaskStarted { .. } => "task:started",
            Self::TaskCompleted { .. } => "task:completed",
            Self::TaskFailed { .. } => "task:failed",
            Self::TaskPaused { .. } => "task:paused",
            Self::TaskResumed { .. } => "task:resumed",
            Self::TaskSessionResumed { .. } => "task:session-resumed",
            Self::TasksAutoResumed { .. } => "tasks:auto-resumed",
            Self::TaskTrashed { .. } => "task:trashed",
            Self::TaskIterate { .. } => "task:iterate",
            Self::InteractionReceived { .. } => "interaction:received",
            Self::InteractionProcessed { .. } => "interaction:processed",
            Self::WorktreeMergeCleaned { .. } => "worktree:merge-cleaned",
            Self::OrphanDetected { .. } => "orphan:detected",
            Self::OrphanRecovered { .. } => "orphan:recovered",
        }
    }

    /// `task_id` for the events that carry a single one; `None` for batch
    /// events (`tasks:auto-resumed`, `orphan:detected`) which carry many.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskCreated { task_id }
            | Self::TaskStarted { task_id, .. }
            | Self::TaskCompleted { task_id }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskPaused { task_id, .. }
            | Self::TaskResumed { task_id }
            | Self::TaskSessionResumed { task_id, .. }
            | Self::TaskTrashed { task_id }
            | Self::TaskIterate { task_id, .. }
            | Self::InteractionReceived { task_id, .. }
            | Self::InteractionProcessed { task_id, .. }
            | Self::WorktreeMergeCleaned { task_id, .. }
            | Self::OrphanRecovered { task_id, .. } => Some(task_id),
            Self::TasksAutoResumed { .. } | Self::OrphanDetected { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_name_matches_wire_name() {
        let e = TaskEvent::TaskCreated {
            task_id: "t1".into(),
        };
        assert_eq!(e.name(), "task:created");
    }

    #[test]
    fn batch_events_have_no_single_task_id() {
        let e = TaskEvent::TasksAutoResumed {
            resumed_count: 2,
            errors: vec![],
            reason: "capacity_dropped".into(),
            timestamp: Utc::now(),
        };
        assert_eq!(e.task_id(), None);
    }

    #[test]
    fn single_task_events_expose_task_id() {
        let e = TaskEvent::TaskFailed {
            task_id: "t1".into(),
            error: "boom".into(),
        };
        assert_eq!(e.task_id(), Some("t1"));
    }
}
