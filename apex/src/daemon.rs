//! Daemon process management: PID file, version file, fork-to-background.

use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use eyre::{Context, Result};
use tracing::{debug, info, warn};

/// Current version, set at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Process manager for the `apexd` daemon.
#[derive(Debug)]
pub struct DaemonManager {
    pid_file: PathBuf,
    version_file: PathBuf,
}

impl DaemonManager {
    /// Build a manager rooted at `<projectPath>/.apex/apex.pid`.
    pub fn new(pid_file: PathBuf) -> Self {
        let version_file = pid_file.with_extension("version");
        Self { pid_file, version_file }
    }

    pub fn is_running(&self) -> bool {
        self.read_pid().is_some_and(is_process_running)
    }

    pub fn running_pid(&self) -> Option<u32> {
        self.read_pid().filter(|&pid| is_process_running(pid))
    }

    fn read_pid(&self) -> Option<u32> {
        if !self.pid_file.exists() {
            return None;
        }
        let mut file = fs::File::open(&self.pid_file).ok()?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).ok()?;
        contents.trim().parse().ok()
    }

    fn write_pid(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.pid_file.parent() {
            fs::create_dir_all(parent).context("failed to create PID file directory")?;
        }
        let mut file = fs::File::create(&self.pid_file).context("failed to create PID file")?;
        write!(file, "{}", pid).context("failed to write PID")?;
        debug!(pid, path = ?self.pid_file, "wrote PID file");
        Ok(())
    }

    fn remove_pid_file(&self) -> Result<()> {
        if self.pid_file.exists() {
            fs::remove_file(&self.pid_file).context("failed to remove PID file")?;
        }
        Ok(())
    }

    fn write_version(&self, version: &str) -> Result<()> {
        if let Some(parent) = self.version_file.parent() {
            fs::create_dir_all(parent).context("failed to create version file directory")?;
        }
        let mut file = fs::File::create(&self.version_file).context("failed to create version file")?;
        write!(file, "{}", version).context("failed to write version")?;
        Ok(())
    }

    pub fn read_version(&self) -> Option<String> {
        if !self.version_file.exists() {
            return None;
        }
        let mut file = fs::File::open(&self.version_file).ok()?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).ok()?;
        Some(contents.trim().to_string())
    }

    fn remove_version_file(&self) -> Result<()> {
        if self.version_file.exists() {
            fs::remove_file(&self.version_file).context("failed to remove version file")?;
        }
        Ok(())
    }

    pub fn version_matches(&self) -> bool {
        self.read_version().is_some_and(|v| v == VERSION)
    }

    /// Fork a background daemon by re-executing the current binary with the
    /// hidden `run-daemon` subcommand, then record its PID.
    pub fn start(&self, config_path: Option<&PathBuf>) -> Result<u32> {
        if let Some(pid) = self.running_pid() {
            return Err(eyre::eyre!("daemon already running with PID {}", pid));
        }

        info!("starting daemon in background");
        let exe = std::env::current_exe().context("failed to get current executable")?;

        let mut cmd = Command::new(&exe);
        cmd.arg("run-daemon");
        if let Some(path) = config_path {
            cmd.arg("--config").arg(path);
        }
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());

        let child = cmd.spawn().context("failed to spawn daemon process")?;
        let pid = child.id();
        self.write_pid(pid)?;
        self.write_version(VERSION)?;

        info!(pid, "daemon started");
        Ok(pid)
    }

    /// Send SIGTERM, poll for exit, escalate to SIGKILL past the grace period.
    pub fn stop(&self, grace: std::time::Duration) -> Result<()> {
        let pid = self.running_pid().ok_or_else(|| eyre::eyre!("daemon is not running"))?;

        info!(pid, "stopping daemon");
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            kill(Pid::from_raw(pid as i32), Signal::SIGTERM).context("failed to send SIGTERM")?;
        }

        let attempts = (grace.as_millis() / 100).max(1) as u64;
        let mut waited = 0;
        while is_process_running(pid) && waited < attempts {
            std::thread::sleep(std::time::Duration::from_millis(100));
            waited += 1;
        }

        if is_process_running(pid) {
            warn!(pid, "daemon did not stop gracefully, sending SIGKILL");
            #[cfg(unix)]
            {
                use nix::sys::signal::{Signal, kill};
                use nix::unistd::Pid;
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        }

        self.remove_pid_file()?;
        self.remove_version_file()?;
        info!(pid, "daemon stopped");
        Ok(())
    }

    /// Called by the forked process itself once it is running as the daemon.
    pub fn register_self(&self) -> Result<()> {
        let pid = std::process::id();
        self.write_pid(pid)?;
        self.write_version(VERSION)?;
        info!(pid, version = VERSION, "daemon registered");
        Ok(())
    }

    pub fn pid_file(&self) -> &PathBuf {
        &self.pid_file
    }

    pub fn status(&self) -> DaemonStatus {
        let pid = self.running_pid();
        DaemonStatus {
            running: pid.is_some(),
            pid,
            version: self.read_version(),
            version_matches: self.version_matches(),
            pid_file: self.pid_file.clone(),
        }
    }
}

fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub version: Option<String>,
    pub version_matches: bool,
    pub pid_file: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn is_not_running_when_no_pid_file() {
        let dir = TempDir::new().unwrap();
        let manager = DaemonManager::new(dir.path().join("apex.pid"));
        assert!(!manager.is_running());
    }

    #[test]
    fn write_and_read_pid_round_trips() {
        let dir = TempDir::new().unwrap();
        let manager = DaemonManager::new(dir.path().join("apex.pid"));

        manager.write_pid(12345).unwrap();
        assert_eq!(manager.read_pid(), Some(12345));

        manager.remove_pid_file().unwrap();
        assert_eq!(manager.read_pid(), None);
    }

    #[test]
    fn version_file_path_is_derived_from_pid_file() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("apex.pid");
        let manager = DaemonManager::new(pid_file.clone());
        assert_eq!(manager.version_file, dir.path().join("apex.version"));
    }

    #[test]
    fn version_matches_detects_mismatch_and_absence() {
        let dir = TempDir::new().unwrap();
        let manager = DaemonManager::new(dir.path().join("apex.pid"));
        assert!(!manager.version_matches());

        manager.write_version("some-other-version").unwrap();
        assert!(!manager.version_matches());

        manager.write_version(VERSION).unwrap();
        assert!(manager.version_matches());
    }

    #[test]
    fn status_reports_not_running_for_fresh_manager() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("apex.pid");
        let manager = DaemonManager::new(pid_file.clone());
        let status = manager.status();
        assert!(!status.running);
        assert!(status.pid.is_none());
        assert_eq!(status.pid_file, pid_file);
    }
}
