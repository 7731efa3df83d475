//! Event bus for orchestrator activity.
//!
//! Every significant action in the orchestrator (task lifecycle transitions,
//! interactions, orphan recovery) emits a [`types::TaskEvent`] onto a shared
//! broadcast channel. The daemon log sink is one subscriber; a running daemon
//! could add others (metrics, IPC push) without touching emitters.

mod bus;
mod logger;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventEmitter, create_event_bus};
pub use logger::{DaemonLogger, LogLevel, spawn_daemon_logger, tail_lines};
pub use types::TaskEvent;
