//! Usage Manager: per-task and daily cumulative token/cost accounting.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{Local, NaiveDate};

use crate::config::{TaskLimits, UsageConfig};

/// Why a usage update crossed a limit; the capacity monitor and orchestrator
/// react to this signal without re-deriving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitSignal {
    TaskLimit,
    Budget,
}

/// Daily aggregate, keyed by calendar day in local time.
#[derive(Debug, Clone, Default)]
pub struct DailyUsage {
    pub tokens: u64,
    pub cost: f64,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
}

struct Inner {
    day: NaiveDate,
    daily: DailyUsage,
    per_task: HashMap<String, (u64, f64)>,
    active_tasks: u32,
}

/// Tracks usage across all tasks, resetting the daily aggregate at local
/// midnight. Every update re-evaluates against the configured limits and
/// returns any [`LimitSignal`]s that now apply.
pub struct UsageManager {
    config: UsageConfig,
    inner: Mutex<Inner>,
}

impl UsageManager {
    pub fn new(config: UsageConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                day: Local::now().date_naive(),
                daily: DailyUsage::default(),
                per_task: HashMap::new(),
                active_tasks: 0,
            }),
        }
    }

    fn roll_day_if_needed(&self, inner: &mut Inner) {
        let today = Local::now().date_naive();
        if today != inner.day {
            inner.day = today;
            inner.daily = DailyUsage::default();
        }
    }

    pub fn task_started(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.active_tasks += 1;
    }

    pub fn task_finished(&self, completed: bool) {
        let mut inner = self.inner.lock().unwrap();
        self.roll_day_if_needed(&mut inner);
        inner.active_tasks = inner.active_tasks.saturating_sub(1);
        if completed {
            inner.daily.tasks_completed += 1;
        } else {
            inner.daily.tasks_failed += 1;
        }
    }

    /// Record a usage delta for `task_id` and re-evaluate against limits.
    /// `limits` is the effective per-task ceiling (day/night override or the
    /// configured default).
    pub fn record_usage(
        &self,
        task_id: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
        limits: &TaskLimits,
    ) -> Vec<LimitSignal> {
        let mut inner = self.inner.lock().unwrap();
        self.roll_day_if_needed(&mut inner);

        let entry = inner.per_task.entry(task_id.to_string()).or_insert((0, 0.0));
        entry.0 += input_tokens + output_tokens;
        entry.1 += cost;
        let (task_tokens, task_cost) = *entry;

        inner.daily.tokens += input_tokens + output_tokens;
        inner.daily.cost += cost;
        let daily_cost = inner.daily.cost;

        let mut signals = Vec::new();

        let max_cost = limits.max_cost_per_task_usd.unwrap_or(self.config.default_task_limit_usd);
        let max_tokens = limits
            .max_tokens_per_task
            .unwrap_or(self.config.default_max_tokens_per_task);
        if task_cost >= max_cost || task_tokens >= max_tokens {
            signals.push(LimitSignal::TaskLimit);
        }

        if daily_cost >= self.config.daily_budget_usd {
            signals.push(LimitSignal::Budget);
        }

        signals
    }

    pub fn daily_usage(&self) -> DailyUsage {
        let mut inner = self.inner.lock().unwrap();
        self.roll_day_if_needed(&mut inner);
        inner.daily.clone()
    }

    pub fn active_tasks(&self) -> u32 {
        self.inner.lock().unwrap().active_tasks
    }

    pub fn daily_budget(&self) -> f64 {
        self.config.daily_budget_usd
    }

    pub fn task_usage(&self, task_id: &str) -> (u64, f64) {
        self.inner
            .lock()
            .unwrap()
            .per_task
            .get(task_id)
            .copied()
            .unwrap_or((0, 0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> UsageConfig {
        UsageConfig {
            daily_budget_usd: 10.0,
            default_task_limit_usd: 2.0,
            default_max_tokens_per_task: 1_000,
        }
    }

    #[test]
    fn usage_accumulates_per_task_and_daily() {
        let manager = UsageManager::new(config());
        manager.record_usage("t1", 100, 50, 0.5, &TaskLimits::default());
        manager.record_usage("t1", 200, 100, 0.5, &TaskLimits::default());

        let (tokens, cost) = manager.task_usage("t1");
        assert_eq!(tokens, 450);
        assert_eq!(cost, 1.0);

        let daily = manager.daily_usage();
        assert_eq!(daily.tokens, 450);
        assert_eq!(daily.cost, 1.0);
    }

    #[test]
    fn task_cost_limit_signals_task_limit() {
        let manager = UsageManager::new(config());
        let signals = manager.record_usage("t1", 0, 0, 2.5, &TaskLimits::default());
        assert!(signals.contains(&LimitSignal::TaskLimit));
    }

    #[test]
    fn daily_budget_exhaustion_signals_budget() {
        let manager = UsageManager::new(config());
        let signals = manager.record_usage("t1", 0, 0, 11.0, &TaskLimits::default());
        assert!(signals.contains(&LimitSignal::Budget));
    }

    #[test]
    fn per_task_override_replaces_default_limit() {
        let manager = UsageManager::new(config());
        let limits = TaskLimits {
            max_cost_per_task_usd: Some(100.0),
            max_tokens_per_task: None,
        };
        let signals = manager.record_usage("t1", 0, 0, 2.5, &limits);
        assert!(!signals.contains(&LimitSignal::TaskLimit));
    }

    #[test]
    fn task_started_and_finished_track_active_count() {
        let manager = UsageManager::new(config());
        manager.task_started();
        manager.task_started();
        assert_eq!(manager.active_tasks(), 2);
        manager.task_finished(true);
        assert_eq!(manager.active_tasks(), 1);
        assert_eq!(manager.daily_usage().tasks_completed, 1);
    }
}
