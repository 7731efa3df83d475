//! Daemon Scheduler: day/night time windows, capacity thresholds, and the
//! pause/resume recommendation the runner's poll loop gates dispatch on.

use chrono::{DateTime, Local, NaiveDate, TimeZone, Timelike};

use crate::config::{SchedulerWindowConfig, TaskLimits};

/// Hours-to-night-mode at or below which a pause recommendation gets a
/// "night mode starts soon" hint.
const NIGHT_HINT_WINDOW_HOURS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeWindowMode {
    Day,
    Night,
    OffHours,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeWindow {
    pub mode: TimeWindowMode,
    pub is_active: bool,
    pub start_hour: u32,
    pub end_hour: u32,
    pub next_transition: DateTime<Local>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapacityInfo {
    pub current_percentage: f64,
    pub threshold: f64,
    pub should_pause: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PauseDecision {
    pub should_pause: bool,
    pub reason: Option<String>,
    pub time_window: TimeWindow,
    pub capacity: CapacityInfo,
    pub next_reset_time: DateTime<Local>,
    pub recommendations: Vec<String>,
}

/// Daily cost/budget snapshot the scheduler reasons about; fed by the usage
/// manager, kept separate so the scheduler has no direct dependency on it.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageSnapshot {
    pub daily_cost: f64,
    pub daily_budget: f64,
}

#[derive(Clone)]
pub struct DaemonScheduler {
    config: SchedulerWindowConfig,
}

impl DaemonScheduler {
    pub fn new(config: SchedulerWindowConfig) -> Self {
        Self { config }
    }

    /// `[start, end)` in local hours, wrapping past midnight when `start >= end`.
    fn in_range(hour: u32, start: u32, end: u32) -> bool {
        if start == end {
            return false;
        }
        if start < end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }

    fn next_boundary(now: DateTime<Local>, boundary_hour: u32) -> DateTime<Local> {
        let today_boundary = now
            .date_naive()
            .and_hms_opt(boundary_hour, 0, 0)
            .and_then(|ndt| Local.from_local_datetime(&ndt).single());
        match today_boundary {
            Some(dt) if dt > now => dt,
            Some(dt) => dt + chrono::Duration::days(1),
            None => now + chrono::Duration::hours(1),
        }
    }

    pub fn current_time_window(&self, now: DateTime<Local>) -> TimeWindow {
        if !self.config.enabled {
            return TimeWindow {
                mode: TimeWindowMode::OffHours,
                is_active: false,
                start_hour: 0,
                end_hour: 0,
                next_transition: now,
            };
        }

        let hour = now.hour();
        if Self::in_range(hour, self.config.day_start_hour, self.config.day_end_hour) {
            return TimeWindow {
                mode: TimeWindowMode::Day,
                is_active: true,
                start_hour: self.config.day_start_hour,
                end_hour: self.config.day_end_hour,
                next_transition: Self::next_boundary(now, self.config.day_end_hour),
            };
        }
        if Self::in_range(hour, self.config.night_start_hour, self.config.night_end_hour) {
            return TimeWindow {
                mode: TimeWindowMode::Night,
                is_active: true,
                start_hour: self.config.night_start_hour,
                end_hour: self.config.night_end_hour,
                next_transition: Self::next_boundary(now, self.config.night_end_hour),
            };
        }

        TimeWindow {
            mode: TimeWindowMode::OffHours,
            is_active: false,
            start_hour: self.config.day_start_hour,
            end_hour: self.config.day_start_hour,
            next_transition: Self::next_boundary(now, self.config.day_start_hour),
        }
    }

    pub fn capacity_info(&self, window: &TimeWindow, usage: UsageSnapshot) -> CapacityInfo {
        let current_percentage = if usage.daily_budget <= 0.0 {
            0.0
        } else {
            usage.daily_cost / usage.daily_budget
        };

        let threshold = match window.mode {
            TimeWindowMode::Day => self.config.day_capacity_threshold,
            TimeWindowMode::Night => self.config.night_capacity_threshold,
            TimeWindowMode::OffHours => self.config.day_capacity_threshold,
        };

        CapacityInfo {
            current_percentage,
            threshold,
            should_pause: current_percentage >= threshold,
        }
    }

    /// Effective per-task usage ceiling for the current window: day/night
    /// override if configured, otherwise the caller falls back to the usage
    /// manager's own defaults (an absent override is `TaskLimits::default()`,
    /// all fields `None`).
    pub fn effective_task_limits(&self, mode: TimeWindowMode) -> TaskLimits {
        match mode {
            TimeWindowMode::Day => self.config.day_limits.clone().unwrap_or_default(),
            TimeWindowMode::Night => self.config.night_limits.clone().unwrap_or_default(),
            TimeWindowMode::OffHours => TaskLimits::default(),
        }
    }

    pub fn next_reset_time(&self, now: DateTime<Local>) -> DateTime<Local> {
        let tomorrow: NaiveDate = now.date_naive().succ_opt().unwrap_or(now.date_naive());
        let midnight = tomorrow.and_hms_opt(0, 0, 0).unwrap();
        Local
            .from_local_datetime(&midnight)
            .single()
            .unwrap_or_else(|| now + chrono::Duration::days(1))
    }

    pub fn should_pause_tasks(&self, now: DateTime<Local>, usage: UsageSnapshot) -> PauseDecision {
        let window = self.current_time_window(now);
        let next_reset_time = self.next_reset_time(now);

        if !window.is_active {
            let capacity = self.capacity_info(&window, usage);
            return PauseDecision {
                should_pause: true,
                reason: Some("Outside active time window".to_string()),
                time_window: window,
                capacity,
                next_reset_time,
                recommendations: vec![
                    "wait for the next active time window".to_string(),
                    "enable time-based usage to extend coverage".to_string(),
                ],
            };
        }

        let capacity = self.capacity_info(&window, usage);
        if capacity.should_pause {
            let mut recommendations = vec!["consider increasing the daily budget".to_string()];
            if window.mode == TimeWindowMode::Day {
                let hours_to_night = hours_until(now.hour(), self.config.night_start_hour);
                if hours_to_night <= NIGHT_HINT_WINDOW_HOURS {
                    recommendations.push(format!("night mode starts in {hours_to_night} hour(s)"));
                    recommendations.push("tasks will resume with higher limits during night mode".to_string());
                }
            }
            return PauseDecision {
                should_pause: true,
                reason: Some(format!(
                    "Capacity threshold exceeded ({:.0}%)",
                    capacity.current_percentage * 100.0
                )),
                time_window: window,
                capacity,
                next_reset_time,
                recommendations,
            };
        }

        PauseDecision {
            should_pause: false,
            reason: None,
            time_window: window,
            capacity,
            next_reset_time,
            recommendations: Vec::new(),
        }
    }
}

fn hours_until(from_hour: u32, to_hour: u32) -> u32 {
    if to_hour >= from_hour {
        to_hour - from_hour
    } else {
        24 - from_hour + to_hour
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(hour: u32) -> DateTime<Local> {
        let today = Local::now().date_naive();
        Local.from_local_datetime(&today.and_hms_opt(hour, 0, 0).unwrap()).unwrap()
    }

    fn scheduler() -> DaemonScheduler {
        DaemonScheduler::new(SchedulerWindowConfig {
            enabled: true,
            day_start_hour: 9,
            day_end_hour: 17,
            night_start_hour: 22,
            night_end_hour: 6,
            day_capacity_threshold: 0.90,
            night_capacity_threshold: 0.96,
            day_limits: None,
            night_limits: None,
        })
    }

    #[test]
    fn day_window_is_checked_before_night() {
        let s = scheduler();
        assert_eq!(s.current_time_window(at(10)).mode, TimeWindowMode::Day);
        assert_eq!(s.current_time_window(at(23)).mode, TimeWindowMode::Night);
        assert_eq!(s.current_time_window(at(3)).mode, TimeWindowMode::Night);
        assert_eq!(s.current_time_window(at(20)).mode, TimeWindowMode::OffHours);
    }

    #[test]
    fn disabled_scheduler_is_always_off_hours() {
        let mut config = SchedulerWindowConfig::default();
        config.enabled = false;
        let s = DaemonScheduler::new(config);
        let window = s.current_time_window(at(10));
        assert_eq!(window.mode, TimeWindowMode::OffHours);
        assert!(!window.is_active);
    }

    #[test]
    fn budget_of_zero_yields_zero_percentage_and_no_pause() {
        let s = scheduler();
        let window = s.current_time_window(at(10));
        let info = s.capacity_info(
            &window,
            UsageSnapshot {
                daily_cost: 5.0,
                daily_budget: 0.0,
            },
        );
        assert_eq!(info.current_percentage, 0.0);
        assert!(!info.should_pause);
    }

    #[test]
    fn time_window_pause_scenario() {
        let s = scheduler();
        let usage = UsageSnapshot {
            daily_cost: 95.0,
            daily_budget: 100.0,
        };
        let decision = s.should_pause_tasks(at(14), usage);
        assert!(decision.should_pause);
        assert!(decision.reason.unwrap().contains("Capacity threshold exceeded"));

        let decision = s.should_pause_tasks(at(23), usage);
        assert!(!decision.should_pause);
    }

    #[test]
    fn outside_window_pauses_regardless_of_capacity() {
        let s = scheduler();
        let decision = s.should_pause_tasks(
            at(20),
            UsageSnapshot {
                daily_cost: 0.0,
                daily_budget: 100.0,
            },
        );
        assert!(decision.should_pause);
        assert_eq!(decision.reason.as_deref(), Some("Outside active time window"));
    }
}
