//! Inter-process communication between the `apexd status`/`logs`/`stop` CLI
//! commands and the running daemon.
//!
//! A Unix domain socket at `<projectPath>/.apex/apex.sock` carries a simple
//! JSON-over-newline protocol (see [`messages`]). This is the daemon's
//! operational surface: it never carries task-authoring traffic, only
//! process inspection and shutdown.

use std::path::{Path, PathBuf};

pub mod client;
pub mod listener;
pub mod messages;

pub use client::DaemonClient;
pub use messages::{DaemonMessage, DaemonResponse};

/// Socket path for a given project: `<projectPath>/.apex/apex.sock`.
pub fn socket_path(project_path: impl AsRef<Path>) -> PathBuf {
    project_path.as_ref().join(".apex").join("apex.sock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_is_rooted_under_dot_apex() {
        let path = socket_path("/srv/proj");
        assert_eq!(path, PathBuf::from("/srv/proj/.apex/apex.sock"));
    }
}
