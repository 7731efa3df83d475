//! Daemon log file sink.
//!
//! The daemon writes a single append-only log at `<projectPath>/.apex/daemon.log`,
//! one line per message: `[<ISO8601-millis-Z>] [<LEVEL>] <message>`. `apexd logs`
//! reads this file directly (tailed over IPC by the running daemon, or from disk
//! when the daemon is down); there is no JSONL event history or replay.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::bus::EventBus;
use super::types::TaskEvent;

/// Severity of a single daemon log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Left-padded to 5 characters, matching the fixed-width column in the
    /// log format (`INFO ` and `WARN ` carry a trailing space).
    fn padded(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO ",
            Self::Warn => "WARN ",
            Self::Error => "ERROR",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unrecognized log level: {other}")),
        }
    }
}

/// Appends formatted lines to the daemon log file.
///
/// Messages below `min_level` are dropped, except lifecycle messages
/// (start, stop, orphan recovery), which are always written at `Info`
/// regardless of the configured filter.
pub struct DaemonLogger {
    path: PathBuf,
    writer: BufWriter<File>,
    min_level: LogLevel,
}

impl DaemonLogger {
    pub fn open(path: impl AsRef<Path>, min_level: LogLevel) -> eyre::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            min_level,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn format_line(level: LogLevel, message: &str) -> String {
        let ts = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        format!("[{ts}] [{}] {message}", level.padded())
    }

    /// Write a line at the given level, subject to the configured filter.
    pub fn write(&mut self, level: LogLevel, message: &str) -> eyre::Result<()> {
        if level < self.min_level {
            return Ok(());
        }
        self.write_unfiltered(level, message)
    }

    /// Write a lifecycle line unconditionally, always tagged `INFO`.
    pub fn write_lifecycle(&mut self, message: &str) -> eyre::Result<()> {
        self.write_unfiltered(LogLevel::Info, message)
    }

    fn write_unfiltered(&mut self, level: LogLevel, message: &str) -> eyre::Result<()> {
        let line = Self::format_line(level, message);
        writeln!(self.writer, "{line}")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Render a task event as a human-readable daemon log line at `Info`.
    pub fn log_event(&mut self, event: &TaskEvent) -> eyre::Result<()> {
        let message = describe_event(event);
        self.write(LogLevel::Info, &message)
    }

    /// Consume task events from the bus and append each as a log line until
    /// the bus is closed.
    pub async fn run(mut self, event_bus: Arc<EventBus>) {
        let mut rx = event_bus.subscribe();
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(e) = self.log_event(&event) {
                        warn!(error = %e, "DaemonLogger: failed to write event");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "DaemonLogger: lagged behind, missed events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("DaemonLogger: channel closed, shutting down");
                    break;
                }
            }
        }
    }
}

fn describe_event(event: &TaskEvent) -> String {
    match event {
        TaskEvent::TaskCreated { task_id } => format!("task {task_id} created"),
        TaskEvent::TaskStarted { task_id, stage } => match stage {
            Some(stage) => format!("task {task_id} started (stage {stage})"),
            None => format!("task {task_id} started"),
        },
        TaskEvent::TaskCompleted { task_id } => format!("task {task_id} completed"),
        TaskEvent::TaskFailed { task_id, error } => format!("task {task_id} failed: {error}"),
        TaskEvent::TaskPaused {
            task_id,
            reason,
            resume_after,
        } => match resume_after {
            Some(at) => format!("task {task_id} paused ({reason}, resumes at {at})"),
            None => format!("task {task_id} paused ({reason})"),
        },
        TaskEvent::TaskResumed { task_id } => format!("task {task_id} resumed"),
        TaskEvent::TaskSessionResumed {
            task_id,
            previous_status,
            ..
        } => format!("task {task_id} session resumed from {previous_status}"),
        TaskEvent::TasksAutoResumed {
            resumed_count,
            reason,
            errors,
            ..
        } => format!(
            "{resumed_count} task(s) auto-resumed ({reason}), {} error(s)",
            errors.len()
        ),
        TaskEvent::TaskTrashed { task_id } => format!("task {task_id} trashed"),
        TaskEvent::TaskIterate {
            task_id,
            iteration_id,
            instructions,
            ..
        } => {
            format!("task {task_id} iteration {iteration_id} recorded: {instructions}")
        }
        TaskEvent::InteractionReceived { task_id, command, .. } => {
            format!("task {task_id} interaction received: {command}")
        }
        TaskEvent::InteractionProcessed {
            task_id,
            command,
            success,
        } => format!("task {task_id} interaction {command} processed (success={success})"),
        TaskEvent::WorktreeMergeCleaned { task_id, path, pr_url } => {
            format!("task {task_id} worktree cleaned after merge (path={path}, pr={pr_url})")
        }
        TaskEvent::OrphanDetected { tasks, reason, .. } => {
            format!("{} orphaned task(s) detected ({reason})", tasks.len())
        }
        TaskEvent::OrphanRecovered {
            task_id, new_status, ..
        } => format!("task {task_id} recovered from orphan state -> {new_status}"),
    }
}

/// Return the last `n` lines of the daemon log at `path`. Missing files
/// yield an empty vector rather than an error.
pub fn tail_lines(path: impl AsRef<Path>, n: usize) -> eyre::Result<Vec<String>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)?;
    let lines: Vec<String> = content.lines().map(|l| l.to_string()).collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].to_vec())
}

/// Spawn the daemon logger as a background task.
pub fn spawn_daemon_logger(
    path: impl AsRef<Path>,
    min_level: LogLevel,
    event_bus: Arc<EventBus>,
) -> eyre::Result<tokio::task::JoinHandle<()>> {
    let logger = DaemonLogger::open(path, min_level)?;
    Ok(tokio::spawn(async move {
        logger.run(event_bus).await;
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_known_levels_case_insensitively() {
        assert_eq!(LogLevel::from_str("INFO").unwrap(), LogLevel::Info);
        assert_eq!(LogLevel::from_str("warn").unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("Warning").unwrap(), LogLevel::Warn);
        assert!(LogLevel::from_str("nonsense").is_err());
    }

    #[test]
    fn format_line_has_five_char_level_column() {
        let line = DaemonLogger::format_line(LogLevel::Info, "hello");
        let level_field = line.split("] [").nth(1).unwrap().split(']').next().unwrap();
        assert_eq!(level_field.len(), 5);
        assert_eq!(level_field, "INFO ");
    }

    #[test]
    fn below_threshold_messages_are_dropped() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("daemon.log");
        let mut logger = DaemonLogger::open(&path, LogLevel::Warn).unwrap();

        logger.write(LogLevel::Debug, "should not appear").unwrap();
        logger.write(LogLevel::Error, "should appear").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(!content.contains("should not appear"));
        assert!(content.contains("should appear"));
    }

    #[test]
    fn lifecycle_messages_bypass_the_filter() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("daemon.log");
        let mut logger = DaemonLogger::open(&path, LogLevel::Error).unwrap();

        logger.write_lifecycle("daemon started").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("[INFO ] daemon started"));
    }

    #[test]
    fn tail_lines_returns_empty_for_missing_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("missing.log");
        assert!(tail_lines(&path, 10).unwrap().is_empty());
    }

    #[test]
    fn tail_lines_returns_last_n() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("daemon.log");
        let mut logger = DaemonLogger::open(&path, LogLevel::Debug).unwrap();
        for i in 0..10 {
            logger.write(LogLevel::Info, &format!("line {i}")).unwrap();
        }

        let last = tail_lines(&path, 3).unwrap();
        assert_eq!(last.len(), 3);
        assert!(last[0].contains("line 7"));
        assert!(last[2].contains("line 9"));
    }

    #[test]
    fn log_event_renders_human_readable_message() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("daemon.log");
        let mut logger = DaemonLogger::open(&path, LogLevel::Debug).unwrap();

        logger
            .log_event(&TaskEvent::TaskFailed {
                task_id: "t1".to_string(),
                error: "boom".to_string(),
            })
            .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("task t1 failed: boom"));
    }
}
