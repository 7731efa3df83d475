//! `apexd` - the apex daemon and CLI entry point.
//!
//! `task`/`gate`/`interact` subcommands talk directly to the store: SQLite's
//! WAL mode gives us safe concurrent access from a short-lived CLI process
//! alongside the long-running daemon, so there's no need to round-trip these
//! through IPC. Only daemon lifecycle management and `logs` go through the
//! Unix-socket control protocol.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::{Context, Result};
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use apex::cli::{Cli, Command, DaemonCommand, GateCommand, InteractCommand, OutputFormat, TaskCommand, generate_after_help};
use apex::config::Config;
use apex::daemon::DaemonManager;
use apex::ipc::{self, DaemonClient, DaemonMessage, DaemonResponse};
use apex::orchestrator::{CreateTaskRequest, Orchestrator, WorkspaceStrategy};
use apex::workspace::{ContainerProvider, WorkspaceProvider, WorktreeProvider};
use apex::{
    CapacityMonitor, DaemonScheduler, EventLogLevel, HealthMonitor, InteractionManager, NoopAgentRuntime, Runner,
    RunnerConfig, UsageManager, WorkflowRegistry, create_event_bus, spawn_daemon_logger, tail_lines,
};
use apex_store::{Autonomy, Priority, Store, Task, TaskFilter, TaskPatch, TaskStatus};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: &str) {
    let directive = cli_log_level.unwrap_or(config_log_level);
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref()).context("failed to load configuration")?;
    setup_logging(cli.log_level.as_deref(), &config.daemon.log_level);

    match &cli.command {
        None => {
            println!(
                "{}",
                generate_after_help(&config.storage.pid_path(), &config.storage.log_path())
            );
            Ok(())
        }
        Some(Command::Daemon { command }) => cmd_daemon(command, &config, cli.config.as_ref()).await,
        Some(Command::Task { command }) => cmd_task(command, &config),
        Some(Command::Gate { command }) => cmd_gate(command, &config),
        Some(Command::Interact { command }) => cmd_interact(command, &config),
        Some(Command::RunDaemon) => run_daemon_process(config).await,
        Some(Command::Logs { follow, lines }) => cmd_logs(&config, *follow, *lines).await,
    }
}

fn open_store(config: &Config) -> Result<Store> {
    Store::open(config.storage.db_path()).context("failed to open task store")
}

/// An [`Orchestrator`] with no workspace backend and a throwaway event bus,
/// for the CLI mutations (`task create`, `task trash`) that want its
/// validation and event-emission logic but run outside the daemon process.
fn cli_orchestrator(config: &Config, store: Arc<Store>) -> Orchestrator {
    Orchestrator::new(
        store,
        create_event_bus(),
        WorkflowRegistry::with_defaults(),
        Arc::new(NoopAgentRuntime),
        Arc::new(UsageManager::new(config.usage.clone())),
        None,
        WorkspaceStrategy::None,
        config.storage.project_path.clone(),
        config.git.worktree.preserve_on_failure,
        config.workspace.cleanup_on_complete,
    )
}

fn parse_autonomy(s: &str) -> Result<Autonomy> {
    match s.to_lowercase().as_str() {
        "full" => Ok(Autonomy::Full),
        "supervised" => Ok(Autonomy::Supervised),
        "manual" => Ok(Autonomy::Manual),
        other => Err(eyre::eyre!("unknown autonomy level: {other} (expected full, supervised or manual)")),
    }
}

// --------------------------------------------------------------- daemon cmd

async fn cmd_daemon(command: &DaemonCommand, config: &Config, config_path: Option<&PathBuf>) -> Result<()> {
    let manager = DaemonManager::new(config.storage.pid_path());

    match command {
        DaemonCommand::Start { foreground } => {
            if *foreground {
                run_daemon_process(config.clone()).await
            } else {
                let pid = manager.start(config_path)?;
                println!("apex daemon started in the background (pid {pid})");
                Ok(())
            }
        }
        DaemonCommand::Stop => {
            manager
                .stop(Duration::from_millis(config.daemon.shutdown_grace_ms))
                .context("failed to stop daemon")?;
            println!("apex daemon stopped");
            Ok(())
        }
        DaemonCommand::Status { format } => {
            let status = manager.status();
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
                OutputFormat::Text => {
                    println!("running: {}", status.running);
                    if let Some(pid) = status.pid {
                        println!("pid: {pid}");
                    }
                    if let Some(version) = &status.version {
                        println!("version: {version} (matches this binary: {})", status.version_matches);
                    }
                }
            }
            Ok(())
        }
        DaemonCommand::Ping => {
            let client = DaemonClient::for_project(&config.storage.project_path);
            let version = client.ping().await.context("daemon did not respond to ping")?;
            println!("pong (daemon version {version})");
            Ok(())
        }
    }
}

// ---------------------------------------------------------------- task cmd

fn cmd_task(command: &TaskCommand, config: &Config) -> Result<()> {
    let store = Arc::new(open_store(config)?);

    match command {
        TaskCommand::Create {
            description,
            workflow,
            autonomy,
            priority,
            effort,
            acceptance_criteria,
            depends_on,
            parent_id,
        } => {
            let orchestrator = cli_orchestrator(config, store);
            let req = CreateTaskRequest {
                project_path: config.storage.project_path.display().to_string(),
                workflow: workflow.clone(),
                description: description.clone(),
                acceptance_criteria: acceptance_criteria.clone(),
                autonomy: parse_autonomy(autonomy)?,
                priority: priority.parse::<Priority>().map_err(|e| eyre::eyre!(e))?,
                effort: effort.clone(),
                depends_on: depends_on.clone(),
                parent_id: parent_id.clone(),
                max_retries: None,
            };
            let task = orchestrator.create_task(req)?;
            println!("created task {}", task.id);
            Ok(())
        }

        TaskCommand::List {
            status,
            include_trashed,
            format,
        } => {
            let status = status
                .as_deref()
                .map(|s| s.parse::<TaskStatus>())
                .transpose()
                .map_err(|e| eyre::eyre!(e))?;
            let filter = TaskFilter {
                status,
                limit: None,
                order_by_priority: true,
                include_trashed: *include_trashed,
            };
            let tasks = store.list_tasks(&filter)?;
            print_tasks(&tasks, format)
        }

        TaskCommand::Show { id, format } => {
            let task = store.get_task(id)?.ok_or_else(|| eyre::eyre!("task not found: {id}"))?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&task)?),
                OutputFormat::Text => print_task_details(&task),
            }
            Ok(())
        }

        TaskCommand::Trash { id } => {
            let orchestrator = cli_orchestrator(config, store);
            orchestrator.trash_task(id)?;
            println!("task {id} trashed");
            Ok(())
        }

        TaskCommand::Resume { id } => {
            let task = store.get_task(id)?.ok_or_else(|| eyre::eyre!("task not found: {id}"))?;
            if task.status != TaskStatus::Paused {
                eyre::bail!("task {id} is not paused (status: {})", task.status);
            }
            store.update_task(
                id,
                TaskPatch {
                    status: Some(TaskStatus::Pending),
                    paused_at: Some(None),
                    resume_after: Some(None),
                    pause_reason: Some(None),
                    resume_attempts: Some(task.resume_attempts + 1),
                    ..Default::default()
                },
            )?;
            println!("task {id} marked pending; the running daemon will pick it up on its next poll");
            Ok(())
        }
    }
}

fn print_tasks(tasks: &[Task], format: &OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(tasks)?),
        OutputFormat::Text => {
            if tasks.is_empty() {
                println!("no tasks");
                return Ok(());
            }
            for task in tasks {
                println!(
                    "{:<20} {:<12} {:<8} {}",
                    task.id,
                    task.status.to_string(),
                    task.priority.to_string(),
                    task.description
                );
            }
        }
    }
    Ok(())
}

fn print_task_details(task: &Task) {
    println!("id:          {}", task.id);
    println!("description: {}", task.description);
    println!("status:      {}", task.status);
    println!("workflow:    {}", task.workflow);
    if let Some(stage) = &task.stage {
        println!("stage:       {stage}");
    }
    println!("priority:    {}", task.priority);
    println!("autonomy:    {:?}", task.autonomy);
    println!(
        "usage:       {} tokens, ${:.4}",
        task.usage.total_tokens(),
        task.usage.estimated_cost
    );
    if let Some(branch) = &task.branch {
        println!("branch:      {branch}");
    }
    if let Some(pr_url) = &task.pr_url {
        println!("pr:          {pr_url}");
    }
    if let Some(error) = &task.error {
        println!("error:       {error}");
    }
}

// ---------------------------------------------------------------- gate cmd

fn cmd_gate(command: &GateCommand, config: &Config) -> Result<()> {
    let store = open_store(config)?;

    match command {
        GateCommand::Approve {
            task_id,
            name,
            approver,
            comment,
        } => {
            store.approve_gate(task_id, name, approver.as_deref(), comment.as_deref())?;
            println!("gate {name} on task {task_id} approved");
            Ok(())
        }

        GateCommand::Reject {
            task_id,
            name,
            approver,
            comment,
        } => {
            store.reject_gate(task_id, name, approver.as_deref(), comment.as_deref())?;
            println!("gate {name} on task {task_id} rejected");
            Ok(())
        }

        GateCommand::List { task_id } => {
            let gates = store.get_all_gates(task_id)?;
            if gates.is_empty() {
                println!("no gates for task {task_id}");
                return Ok(());
            }
            for gate in gates {
                println!("{:<20} {:?}", gate.name, gate.status);
            }
            Ok(())
        }
    }
}

// ------------------------------------------------------------ interact cmd

fn cmd_interact(command: &InteractCommand, config: &Config) -> Result<()> {
    let store = Arc::new(open_store(config)?);
    let manager = InteractionManager::new(store, create_event_bus());

    match command {
        InteractCommand::Iterate { task_id, feedback } => {
            let iteration_id = manager.iterate_task(task_id, feedback, None)?;
            println!("recorded iteration {iteration_id} on task {task_id}");
            Ok(())
        }

        InteractCommand::Diff { task_id, iteration_id } => {
            let diff = manager.get_iteration_diff(task_id, iteration_id.as_deref())?;
            println!("{}", diff.summary);
            if !diff.files_changed.added.is_empty() {
                println!("added:    {}", diff.files_changed.added.join(", "));
            }
            if !diff.files_changed.modified.is_empty() {
                println!("modified: {}", diff.files_changed.modified.join(", "));
            }
            if !diff.files_changed.removed.is_empty() {
                println!("removed:  {}", diff.files_changed.removed.join(", "));
            }
            println!("token delta: {}, cost delta: ${:.4}", diff.token_usage_delta, diff.cost_delta);
            Ok(())
        }
    }
}

// ----------------------------------------------------------------- logs cmd

async fn cmd_logs(config: &Config, follow: bool, lines: usize) -> Result<()> {
    let client = DaemonClient::for_project(&config.storage.project_path);

    if client.socket_exists() {
        if let Ok(log_lines) = client.logs(lines).await {
            for line in &log_lines {
                println!("{line}");
            }
            if !follow {
                return Ok(());
            }
        }
    }

    let log_path = config.storage.log_path();
    for line in tail_lines(&log_path, lines)? {
        println!("{line}");
    }

    if follow {
        let mut last_len = std::fs::metadata(&log_path).map(|m| m.len()).unwrap_or(0);
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let Ok(metadata) = std::fs::metadata(&log_path) else {
                continue;
            };
            if metadata.len() > last_len {
                let content = std::fs::read_to_string(&log_path)?;
                let new_bytes = &content.as_bytes()[last_len as usize..];
                print!("{}", String::from_utf8_lossy(new_bytes));
                last_len = metadata.len();
            }
        }
    }

    Ok(())
}

// -------------------------------------------------------------- daemon run

/// Wire up every component and drive the poll loop until shutdown.
async fn run_daemon_process(config: Config) -> Result<()> {
    let pid_file = config.storage.pid_path();
    let manager = DaemonManager::new(pid_file);
    manager.register_self()?;

    let store = Arc::new(Store::open(config.storage.db_path()).context("failed to open task store")?);
    let events = create_event_bus();

    let log_level: EventLogLevel = config.daemon.log_level.parse().unwrap_or(EventLogLevel::Info);
    let logger_handle = spawn_daemon_logger(config.storage.log_path(), log_level, Arc::clone(&events))?;

    let workflows = WorkflowRegistry::with_defaults();
    let agent: Arc<dyn apex::AgentRuntime> = Arc::new(NoopAgentRuntime);
    let usage = Arc::new(UsageManager::new(config.usage.clone()));
    let capacity = Arc::new(CapacityMonitor::new());
    let health = Arc::new(HealthMonitor::new(config.daemon.max_restart_history as usize));

    let (workspace, workspace_strategy): (Option<Arc<dyn WorkspaceProvider>>, WorkspaceStrategy) =
        if config.container.enabled {
            let provider = ContainerProvider::new(
                config.container.clone(),
                config.storage.worktree_base_dir(),
                Arc::clone(&store),
            )?;
            (Some(Arc::new(provider) as Arc<dyn WorkspaceProvider>), WorkspaceStrategy::Container)
        } else if config.git.worktree.enabled {
            let base_dir = config
                .git
                .worktree
                .base_dir
                .clone()
                .unwrap_or_else(|| config.storage.worktree_base_dir());
            let provider = WorktreeProvider::new(
                base_dir,
                config.storage.project_path.clone(),
                config.git.worktree.max_active,
                config.git.worktree.prune_stale_after_days,
                Arc::clone(&store),
            );
            (Some(Arc::new(provider) as Arc<dyn WorkspaceProvider>), WorkspaceStrategy::Worktree)
        } else {
            (None, WorkspaceStrategy::None)
        };

    let scheduler = Arc::new(DaemonScheduler::new(config.scheduler.clone()));

    let orchestrator = Arc::new(
        Orchestrator::new(
            Arc::clone(&store),
            Arc::clone(&events),
            workflows,
            agent,
            Arc::clone(&usage),
            workspace,
            workspace_strategy,
            config.storage.project_path.clone(),
            config.git.worktree.preserve_on_failure,
            config.workspace.cleanup_on_complete,
        )
        .with_scheduler(Arc::clone(&scheduler)),
    );

    let runner_config = RunnerConfig::from_daemon_config(&config.daemon);
    let runner = Arc::new(Runner::new(
        runner_config,
        Arc::clone(&store),
        Arc::clone(&events),
        Arc::clone(&orchestrator),
        (*scheduler).clone(),
        Arc::clone(&usage),
        Arc::clone(&capacity),
        Arc::clone(&health),
    ));

    match runner.recover_orphans() {
        Ok(0) => {}
        Ok(n) => info!(count = n, "recovered orphaned tasks from a prior run"),
        Err(e) => warn!(error = %e, "failed to recover orphaned tasks"),
    }

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let (listener, socket_path) = ipc::create_listener(&config.storage.project_path)?;
    let ipc_task = tokio::spawn(run_ipc_listener(
        listener,
        Arc::clone(&store),
        Arc::clone(&usage),
        Arc::clone(&health),
        config.storage.log_path(),
        shutdown_tx.clone(),
    ));

    let signal_shutdown = {
        let shutdown_tx = shutdown_tx.clone();
        async move {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            }
            let _ = shutdown_tx.send(true);
        }
    };
    tokio::spawn(signal_shutdown);

    let shutdown_signal = async move {
        let _ = shutdown_rx.wait_for(|&v| v).await;
    };

    info!("apex daemon ready");
    runner.run(shutdown_signal).await;

    ipc_task.abort();
    ipc::cleanup_socket(&socket_path);
    logger_handle.abort();

    info!("apex daemon shut down");
    Ok(())
}

async fn run_ipc_listener(
    listener: UnixListener,
    store: Arc<Store>,
    usage: Arc<UsageManager>,
    health: Arc<HealthMonitor>,
    log_path: PathBuf,
    shutdown_tx: watch::Sender<bool>,
) {
    loop {
        let (mut stream, _addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "ipc listener: accept failed");
                continue;
            }
        };

        let store = Arc::clone(&store);
        let usage = Arc::clone(&usage);
        let health = Arc::clone(&health);
        let log_path = log_path.clone();
        let shutdown_tx = shutdown_tx.clone();

        tokio::spawn(async move {
            let message = match ipc::read_message(&mut stream).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "ipc: failed to read message");
                    return;
                }
            };

            let response = handle_ipc_message(message, &store, &usage, &health, &log_path, &shutdown_tx);
            if let Err(e) = ipc::send_response(&mut stream, response).await {
                warn!(error = %e, "ipc: failed to send response");
            }
        });
    }
}

fn handle_ipc_message(
    message: DaemonMessage,
    store: &Arc<Store>,
    usage: &Arc<UsageManager>,
    health: &Arc<HealthMonitor>,
    log_path: &PathBuf,
    shutdown_tx: &watch::Sender<bool>,
) -> DaemonResponse {
    match message {
        DaemonMessage::Ping => DaemonResponse::Pong {
            version: apex::daemon::VERSION.to_string(),
        },
        DaemonMessage::Status => {
            let pending = store
                .list_tasks(&TaskFilter {
                    status: Some(TaskStatus::Pending),
                    ..Default::default()
                })
                .map(|t| t.len())
                .unwrap_or(0);
            let in_progress = store
                .list_tasks(&TaskFilter {
                    status: Some(TaskStatus::InProgress),
                    ..Default::default()
                })
                .map(|t| t.len())
                .unwrap_or(0);
            let health_report = health.get_health_report();
            let daily = usage.daily_usage();
            DaemonResponse::Status {
                report: serde_json::json!({
                    "pending_tasks": pending,
                    "in_progress_tasks": in_progress,
                    "version": apex::daemon::VERSION,
                    "uptime_secs": health_report.uptime_secs,
                    "health_checks_passed": health_report.health_checks_passed,
                    "health_checks_failed": health_report.health_checks_failed,
                    "restart_history": health_report.restart_history,
                    "daily_cost": daily.cost,
                    "daily_tokens": daily.tokens,
                    "active_tasks": usage.active_tasks(),
                }),
            }
        }
        DaemonMessage::Logs { lines } => match tail_lines(log_path, lines) {
            Ok(lines) => DaemonResponse::Logs { lines },
            Err(e) => DaemonResponse::Error { message: e.to_string() },
        },
        DaemonMessage::Shutdown => {
            let _ = shutdown_tx.send(true);
            DaemonResponse::Ok
        }
    }
}
