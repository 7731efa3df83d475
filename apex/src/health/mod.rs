//! Health Monitor: uptime, health-check counters, and a bounded restart
//! history the watchdog attribution logic reads back from.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A single recorded restart, newest entries pushed to the back of the ring
/// and trimmed from the front once `maxRestartHistorySize` is exceeded.
#[derive(Debug, Clone, Serialize)]
pub struct RestartRecord {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub exit_code: Option<i32>,
    pub triggered_by_watchdog: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub uptime_secs: u64,
    pub health_checks_passed: u64,
    pub health_checks_failed: u64,
    pub last_health_check: Option<DateTime<Utc>>,
    /// Most recent restart first.
    pub restart_history: Vec<RestartRecord>,
}

struct Inner {
    passed: u64,
    failed: u64,
    last_check: Option<DateTime<Utc>>,
    restarts: VecDeque<RestartRecord>,
}

pub struct HealthMonitor {
    started_at: Instant,
    max_restart_history: usize,
    inner: Mutex<Inner>,
}

impl HealthMonitor {
    /// `max_restart_history` negative inputs are not representable in
    /// `usize`; callers clamp to 0 before construction.
    pub fn new(max_restart_history: usize) -> Self {
        Self {
            started_at: Instant::now(),
            max_restart_history,
            inner: Mutex::new(Inner {
                passed: 0,
                failed: 0,
                last_check: None,
                restarts: VecDeque::new(),
            }),
        }
    }

    pub fn record_health_check(&self, passed: bool) {
        let mut inner = self.inner.lock().unwrap();
        if passed {
            inner.passed += 1;
        } else {
            inner.failed += 1;
        }
        inner.last_check = Some(Utc::now());
    }

    pub fn record_restart(&self, reason: impl Into<String>, exit_code: Option<i32>, by_watchdog: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.restarts.push_back(RestartRecord {
            timestamp: Utc::now(),
            reason: reason.into(),
            exit_code,
            triggered_by_watchdog: by_watchdog,
        });
        while inner.restarts.len() > self.max_restart_history {
            inner.restarts.pop_front();
        }
    }

    /// True iff the *current* (post-trim) ring holds any watchdog-triggered
    /// entry. Never consults history already trimmed out of the ring.
    pub fn has_watchdog_restarts(&self) -> bool {
        self.inner.lock().unwrap().restarts.iter().any(|r| r.triggered_by_watchdog)
    }

    /// Resets only the restart ring; uptime and health-check counters are
    /// untouched.
    pub fn clear_restart_history(&self) {
        self.inner.lock().unwrap().restarts.clear();
    }

    pub fn get_health_report(&self) -> HealthReport {
        let inner = self.inner.lock().unwrap();
        let restart_history = inner.restarts.iter().rev().cloned().collect();
        HealthReport {
            uptime_secs: self.started_at.elapsed().as_secs(),
            health_checks_passed: inner.passed,
            health_checks_failed: inner.failed,
            last_health_check: inner.last_check,
            restart_history,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_ring_trims_to_capacity_newest_first() {
        let monitor = HealthMonitor::new(3);
        for i in 0..5 {
            monitor.record_restart(format!("reason-{i}"), None, false);
        }

        let report = monitor.get_health_report();
        assert_eq!(report.restart_history.len(), 3);
        assert_eq!(report.restart_history[0].reason, "reason-4");
        assert_eq!(report.restart_history[2].reason, "reason-2");
    }

    #[test]
    fn has_watchdog_restarts_ignores_trimmed_entries() {
        let monitor = HealthMonitor::new(2);
        monitor.record_restart("watchdog-trip", None, true);
        monitor.record_restart("manual-1", None, false);
        monitor.record_restart("manual-2", None, false);

        assert!(!monitor.has_watchdog_restarts());
    }

    #[test]
    fn has_watchdog_restarts_true_when_current_ring_holds_one() {
        let monitor = HealthMonitor::new(5);
        monitor.record_restart("manual", None, false);
        monitor.record_restart("watchdog-trip", None, true);

        assert!(monitor.has_watchdog_restarts());
    }

    #[test]
    fn clear_restart_history_preserves_counters() {
        let monitor = HealthMonitor::new(5);
        monitor.record_health_check(true);
        monitor.record_health_check(false);
        monitor.record_restart("manual", None, false);

        monitor.clear_restart_history();

        let report = monitor.get_health_report();
        assert!(report.restart_history.is_empty());
        assert_eq!(report.health_checks_passed, 1);
        assert_eq!(report.health_checks_failed, 1);
    }

    #[test]
    fn zero_capacity_ring_keeps_nothing() {
        let monitor = HealthMonitor::new(0);
        monitor.record_restart("manual", None, true);
        assert!(monitor.get_health_report().restart_history.is_empty());
        assert!(!monitor.has_watchdog_restarts());
    }
}
