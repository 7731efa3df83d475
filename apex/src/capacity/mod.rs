//! Capacity Monitor: watches usage pressure and signals the runner when it
//! eases enough to resume paused tasks.
//!
//! This is distinct from the task-scoped [`crate::events::EventBus`]:
//! `capacity-restored` is a daemon-wide signal that drives the runner's
//! batch-resume handler, not a per-task lifecycle event.

use std::sync::Mutex;

use chrono::NaiveDate;
use tokio::sync::broadcast;

use crate::scheduler::TimeWindowMode;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityRestoredReason {
    CapacityDropped,
    BudgetReset,
    ModeSwitch,
    ManualOverride,
}

impl CapacityRestoredReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CapacityDropped => "capacity_dropped",
            Self::BudgetReset => "budget_reset",
            Self::ModeSwitch => "mode_switch",
            Self::ManualOverride => "manual_override",
        }
    }
}

struct Observed {
    day: NaiveDate,
    mode: TimeWindowMode,
    was_above_threshold: bool,
}

pub struct CapacityMonitor {
    tx: broadcast::Sender<CapacityRestoredReason>,
    state: Mutex<Option<Observed>>,
}

impl CapacityMonitor {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            tx,
            state: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CapacityRestoredReason> {
        self.tx.subscribe()
    }

    /// Feed a fresh `(percentage, threshold, day, mode)` sample. Emits
    /// `capacity-restored` exactly when this sample represents an
    /// improvement over the last one observed: the percentage dropped below
    /// threshold, the calendar day rolled over, or the time-window mode
    /// switched.
    pub fn observe(&self, percentage: f64, threshold: f64, day: NaiveDate, mode: TimeWindowMode) {
        let now_above = percentage >= threshold;
        let mut state = self.state.lock().unwrap();

        let reason = match state.as_ref() {
            None => None,
            Some(prev) if day != prev.day => Some(CapacityRestoredReason::BudgetReset),
            Some(prev) if mode != prev.mode => Some(CapacityRestoredReason::ModeSwitch),
            Some(prev) if prev.was_above_threshold && !now_above => Some(CapacityRestoredReason::CapacityDropped),
            Some(_) => None,
        };

        *state = Some(Observed {
            day,
            mode,
            was_above_threshold: now_above,
        });
        drop(state);

        if let Some(reason) = reason {
            let _ = self.tx.send(reason);
        }
    }

    pub fn trigger_manual_override(&self) {
        let _ = self.tx.send(CapacityRestoredReason::ManualOverride);
    }
}

impl Default for CapacityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate as Nd;

    fn day(offset: i64) -> NaiveDate {
        Nd::from_ymd_opt(2026, 1, 1).unwrap() + chrono::Duration::days(offset)
    }

    #[tokio::test]
    async fn capacity_dropped_emits_when_percentage_falls_below_threshold() {
        let monitor = CapacityMonitor::new();
        let mut rx = monitor.subscribe();

        monitor.observe(0.95, 0.90, day(0), TimeWindowMode::Day);
        monitor.observe(0.50, 0.90, day(0), TimeWindowMode::Day);

        assert_eq!(rx.recv().await.unwrap(), CapacityRestoredReason::CapacityDropped);
    }

    #[tokio::test]
    async fn budget_reset_emits_on_new_calendar_day() {
        let monitor = CapacityMonitor::new();
        let mut rx = monitor.subscribe();

        monitor.observe(0.95, 0.90, day(0), TimeWindowMode::Day);
        monitor.observe(0.95, 0.90, day(1), TimeWindowMode::Day);

        assert_eq!(rx.recv().await.unwrap(), CapacityRestoredReason::BudgetReset);
    }

    #[tokio::test]
    async fn mode_switch_emits_on_day_night_transition() {
        let monitor = CapacityMonitor::new();
        let mut rx = monitor.subscribe();

        monitor.observe(0.95, 0.90, day(0), TimeWindowMode::Day);
        monitor.observe(0.95, 0.96, day(0), TimeWindowMode::Night);

        assert_eq!(rx.recv().await.unwrap(), CapacityRestoredReason::ModeSwitch);
    }

    #[tokio::test]
    async fn staying_above_threshold_does_not_emit() {
        let monitor = CapacityMonitor::new();
        let mut rx = monitor.subscribe();

        monitor.observe(0.95, 0.90, day(0), TimeWindowMode::Day);
        monitor.observe(0.96, 0.90, day(0), TimeWindowMode::Day);

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn manual_override_always_emits() {
        let monitor = CapacityMonitor::new();
        let mut rx = monitor.subscribe();
        monitor.trigger_manual_override();
        assert_eq!(rx.recv().await.unwrap(), CapacityRestoredReason::ManualOverride);
    }
}
