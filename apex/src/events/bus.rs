//! Central pub/sub bus for the 15 named task/orphan/interaction events.
//!
//! Backed by a fixed-capacity `tokio::sync::broadcast` channel: publishing
//! never blocks on a slow subscriber, and a subscriber that falls behind gets
//! a `Lagged` error rather than stalling the orchestrator.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;

use super::types::TaskEvent;

/// Default channel capacity (events).
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Central event bus for orchestrator activity.
pub struct EventBus {
    tx: broadcast::Sender<TaskEvent>,
    #[allow(dead_code)]
    channel_capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            channel_capacity: capacity,
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Fire-and-forget: dropped silently if there are no subscribers.
    pub fn emit(&self, event: TaskEvent) {
        debug!(event = event.name(), task_id = event.task_id(), "EventBus::emit");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// Build an emitter bound to a single task id, for orchestrator code that
    /// only ever touches one task at a time.
    pub fn emitter_for(&self, task_id: impl Into<String>) -> EventEmitter {
        EventEmitter {
            tx: self.tx.clone(),
            task_id: task_id.into(),
        }
    }

    /// A raw handle for code (the runner, batch recovery) that emits events
    /// across many tasks rather than one.
    pub fn handle(&self) -> EventEmitter {
        EventEmitter {
            tx: self.tx.clone(),
            task_id: String::new(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Cheap-to-clone handle for emitting events, with one typed convenience
/// method per event name.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<TaskEvent>,
    task_id: String,
}

impl EventEmitter {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn emit(&self, event: TaskEvent) {
        debug!(event = event.name(), "EventEmitter::emit");
        let _ = self.tx.send(event);
    }

    pub fn task_created(&self) {
        self.emit(TaskEvent::TaskCreated {
            task_id: self.task_id.clone(),
        });
    }

    pub fn task_started(&self, stage: Option<String>) {
        self.emit(TaskEvent::TaskStarted {
            task_id: self.task_id.clone(),
            stage,
        });
    }

    pub fn task_completed(&self) {
        self.emit(TaskEvent::TaskCompleted {
            task_id: self.task_id.clone(),
        });
    }

    pub fn task_failed(&self, error: impl Into<String>) {
        self.emit(TaskEvent::TaskFailed {
            task_id: self.task_id.clone(),
            error: error.into(),
        });
    }

    pub fn task_paused(&self, reason: impl Into<String>, resume_after: Option<String>) {
        self.emit(TaskEvent::TaskPaused {
            task_id: self.task_id.clone(),
            reason: reason.into(),
            resume_after,
        });
    }

    pub fn task_resumed(&self) {
        self.emit(TaskEvent::TaskResumed {
            task_id: self.task_id.clone(),
        });
    }

    pub fn task_session_resumed(&self, previous_status: impl Into<String>, summary: Option<String>) {
        self.emit(TaskEvent::TaskSessionResumed {
            task_id: self.task_id.clone(),
            previous_status: previous_status.into(),
            summary,
        });
    }

    /// Batch event: not bound to `self.task_id`, since it summarizes many tasks.
    pub fn tasks_auto_resumed(&self, resumed_count: usize, errors: Vec<String>, reason: impl Into<String>) {
        self.emit(TaskEvent::TasksAutoResumed {
            resumed_count,
            errors,
            reason: reason.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn task_trashed(&self) {
        self.emit(TaskEvent::TaskTrashed {
            task_id: self.task_id.clone(),
        });
    }

    pub fn task_iterate(
        &self,
        iteration_id: impl Into<String>,
        instructions: impl Into<String>,
        context: Option<serde_json::Value>,
    ) {
        self.emit(TaskEvent::TaskIterate {
            task_id: self.task_id.clone(),
            iteration_id: iteration_id.into(),
            instructions: instructions.into(),
            context,
            timestamp: Utc::now(),
        });
    }

    pub fn interaction_received(&self, command: impl Into<String>, requested_by: Option<String>) {
        self.emit(TaskEvent::InteractionReceived {
            task_id: self.task_id.clone(),
            command: command.into(),
            requested_by,
        });
    }

    pub fn interaction_processed(&self, command: impl Into<String>, success: bool) {
        self.emit(TaskEvent::InteractionProcessed {
            task_id: self.task_id.clone(),
            command: command.into(),
            success,
        });
    }

    pub fn worktree_merge_cleaned(&self, path: impl Into<String>, pr_url: Option<&str>) {
        self.emit(TaskEvent::WorktreeMergeCleaned {
            task_id: self.task_id.clone(),
            path: path.into(),
            pr_url: pr_url.unwrap_or("unknown").to_string(),
        });
    }

    pub fn orphan_detected(&self, tasks: Vec<String>, staleness_threshold_ms: u64) {
        self.emit(TaskEvent::OrphanDetected {
            tasks,
            reason: "startup_check".to_string(),
            staleness_threshold_ms,
            detected_at: Utc::now(),
        });
    }

    pub fn orphan_recovered(&self, task_id: impl Into<String>, message: impl Into<String>) {
        self.emit(TaskEvent::OrphanRecovered {
            task_id: task_id.into(),
            previous_status: "in-progress".to_string(),
            new_status: "pending".to_string(),
            action: "reset_pending".to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        });
    }
}

pub fn create_event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::with_default_capacity())
}
