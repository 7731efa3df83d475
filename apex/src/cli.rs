//! CLI command definitions and subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::debug;

/// apex - autonomous task orchestration daemon
#[derive(Parser)]
#[command(name = "apexd", about = "Autonomous task orchestration daemon", version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage the apex daemon process
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Create, inspect and manage tasks
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },

    /// Approve or reject a supervised-autonomy gate
    Gate {
        #[command(subcommand)]
        command: GateCommand,
    },

    /// Feed mid-task feedback and inspect iteration diffs
    Interact {
        #[command(subcommand)]
        command: InteractCommand,
    },

    /// Internal: run as the daemon process (used by `daemon start`)
    #[command(hide = true)]
    RunDaemon,

    /// Show daemon logs
    Logs {
        /// Follow log output (like tail -f)
        #[arg(short, long)]
        follow: bool,

        /// Number of lines to show
        #[arg(short, long, default_value = "50")]
        lines: usize,
    },
}

/// Task management subcommands
#[derive(Debug, Subcommand)]
pub enum TaskCommand {
    /// Create a new task
    Create {
        /// Task description
        description: String,

        /// Workflow to run (defaults to "default")
        #[arg(short, long, default_value = "default")]
        workflow: String,

        /// Autonomy level: full, supervised, manual
        #[arg(short, long, default_value = "supervised")]
        autonomy: String,

        /// Priority: urgent, high, normal, low
        #[arg(short, long, default_value = "normal")]
        priority: String,

        /// Free-form effort estimate
        #[arg(long)]
        effort: Option<String>,

        /// Acceptance criteria
        #[arg(long)]
        acceptance_criteria: Option<String>,

        /// Task ids this task depends on
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,

        /// Parent task id, for a subtask
        #[arg(long)]
        parent_id: Option<String>,
    },

    /// List tasks
    List {
        /// Filter by status: pending, in-progress, paused, completed, failed, cancelled
        #[arg(short, long)]
        status: Option<String>,

        /// Include trashed tasks
        #[arg(long)]
        include_trashed: bool,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show a single task
    Show {
        id: String,

        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Move a task to trash (cancels it)
    Trash { id: String },

    /// Resume a paused task
    Resume { id: String },
}

/// Gate approval subcommands
#[derive(Debug, Subcommand)]
pub enum GateCommand {
    /// Approve a pending gate
    Approve {
        task_id: String,
        name: String,

        #[arg(long)]
        approver: Option<String>,

        #[arg(long)]
        comment: Option<String>,
    },

    /// Reject a pending gate
    Reject {
        task_id: String,
        name: String,

        #[arg(long)]
        approver: Option<String>,

        #[arg(long)]
        comment: Option<String>,
    },

    /// List a task's gates
    List { task_id: String },
}

/// Mid-task interaction subcommands
#[derive(Debug, Subcommand)]
pub enum InteractCommand {
    /// Submit feedback as a new iteration on an in-progress task
    Iterate {
        task_id: String,
        feedback: String,
    },

    /// Show the file/usage diff for an iteration (defaults to the most recent)
    Diff {
        task_id: String,

        #[arg(long)]
        iteration_id: Option<String>,
    },
}

/// Daemon management subcommands
#[derive(Debug, Subcommand)]
pub enum DaemonCommand {
    /// Start the daemon
    Start {
        /// Don't fork to background (run in foreground)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the daemon
    Stop,

    /// Check daemon status
    Status {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Ping the daemon to check if it's alive and responsive
    Ping,
}

/// Result of checking a required tool.
pub struct ToolCheck {
    pub name: &'static str,
    pub available: bool,
    pub version: Option<String>,
}

impl ToolCheck {
    pub fn check(name: &'static str, version_args: &[&str]) -> Self {
        debug!(name, ?version_args, "ToolCheck::check: called");
        let result = std::process::Command::new(name).args(version_args).output();

        match result {
            Ok(output) if output.status.success() => {
                let version_str = String::from_utf8_lossy(&output.stdout);
                let version = parse_version(&version_str);
                Self {
                    name,
                    available: true,
                    version: Some(version),
                }
            }
            _ => Self {
                name,
                available: false,
                version: None,
            },
        }
    }
}

fn parse_version(output: &str) -> String {
    for word in output.split_whitespace() {
        let word = word.trim_start_matches('v');
        if word.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            let version: String = word.chars().take_while(|c| c.is_ascii_digit() || *c == '.').collect();
            if !version.is_empty() {
                return version;
            }
        }
    }
    "unknown".to_string()
}

/// Check the tools the worktree/VCS backend shells out to: `git` for the
/// worktree provider and branch merges, `gh` for PR-merge-state polling.
pub fn check_required_tools() -> Vec<ToolCheck> {
    vec![
        ToolCheck::check("git", &["--version"]),
        ToolCheck::check("gh", &["--version"]),
    ]
}

/// Lightweight daemon-running check for help display, independent of
/// [`crate::daemon::DaemonManager`] so it doesn't need a resolved project path.
pub fn is_daemon_running(pid_file: &PathBuf) -> bool {
    if !pid_file.exists() {
        return false;
    }
    let Ok(contents) = std::fs::read_to_string(pid_file) else {
        return false;
    };
    let Ok(pid) = contents.trim().parse::<u32>() else {
        return false;
    };
    PathBuf::from(format!("/proc/{}", pid)).exists()
}

/// Generate the after_help text with tool checks and daemon status.
pub fn generate_after_help(pid_file: &PathBuf, log_path: &PathBuf) -> String {
    let tools = check_required_tools();
    let daemon_running = is_daemon_running(pid_file);

    let mut help = String::new();

    help.push_str("Required Tools:\n");
    for tool in &tools {
        let icon = if tool.available { "\u{2705}" } else { "\u{274C}" };
        let version = tool.version.as_deref().unwrap_or("not found");
        help.push_str(&format!("  {} {:<10} {}\n", icon, tool.name, version));
    }

    help.push('\n');
    help.push_str("Daemon:\n");
    let daemon_icon = if daemon_running { "\u{2705}" } else { "\u{274C}" };
    let daemon_status = if daemon_running { "running" } else { "stopped" };
    help.push_str(&format!("  {} {}\n", daemon_icon, daemon_status));

    help.push('\n');
    help.push_str(&format!("Logs are written to: {}\n", log_path.display()));
    help
}

/// Output format for list/status/show commands.
#[derive(Clone, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_no_command() {
        let cli = Cli::parse_from(["apexd"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cli_parse_daemon_start() {
        let cli = Cli::parse_from(["apexd", "daemon", "start"]);
        assert!(matches!(
            cli.command,
            Some(Command::Daemon {
                command: DaemonCommand::Start { foreground: false }
            })
        ));
    }

    #[test]
    fn test_cli_parse_daemon_start_foreground() {
        let cli = Cli::parse_from(["apexd", "daemon", "start", "--foreground"]);
        assert!(matches!(
            cli.command,
            Some(Command::Daemon {
                command: DaemonCommand::Start { foreground: true }
            })
        ));
    }

    #[test]
    fn test_cli_parse_daemon_stop() {
        let cli = Cli::parse_from(["apexd", "daemon", "stop"]);
        assert!(matches!(
            cli.command,
            Some(Command::Daemon {
                command: DaemonCommand::Stop
            })
        ));
    }

    #[test]
    fn test_cli_parse_task_create() {
        let cli = Cli::parse_from(["apexd", "task", "create", "fix the bug", "--priority", "high"]);
        if let Some(Command::Task {
            command: TaskCommand::Create { description, priority, workflow, .. },
        }) = cli.command
        {
            assert_eq!(description, "fix the bug");
            assert_eq!(priority, "high");
            assert_eq!(workflow, "default");
        } else {
            panic!("Expected Task::Create command");
        }
    }

    #[test]
    fn test_cli_parse_gate_approve() {
        let cli = Cli::parse_from(["apexd", "gate", "approve", "task-1", "plan-review"]);
        assert!(matches!(
            cli.command,
            Some(Command::Gate {
                command: GateCommand::Approve { .. }
            })
        ));
    }

    #[test]
    fn test_cli_parse_interact_iterate() {
        let cli = Cli::parse_from(["apexd", "interact", "iterate", "task-1", "please add tests"]);
        if let Some(Command::Interact {
            command: InteractCommand::Iterate { task_id, feedback },
        }) = cli.command
        {
            assert_eq!(task_id, "task-1");
            assert_eq!(feedback, "please add tests");
        } else {
            panic!("Expected Interact::Iterate command");
        }
    }

    #[test]
    fn test_output_format_from_str() {
        assert!(matches!("text".parse::<OutputFormat>(), Ok(OutputFormat::Text)));
        assert!(matches!("json".parse::<OutputFormat>(), Ok(OutputFormat::Json)));
        assert!("invalid".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_cli_with_config() {
        let cli = Cli::parse_from(["apexd", "-c", "/path/to/config.yml", "daemon", "status"]);
        assert_eq!(cli.config, Some(PathBuf::from("/path/to/config.yml")));
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("git version 2.43.0"), "2.43.0");
        assert_eq!(parse_version("gh version 2.60.0 (2024-10-01)"), "2.60.0");
        assert_eq!(parse_version("v1.2.3"), "1.2.3");
    }
}
