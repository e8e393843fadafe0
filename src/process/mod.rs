//! Child process supervision.
//!
//! [`ProcessSupervisor`] is the only seam that knows about platforms: it
//! starts children in their own process group, polls them for exit without
//! blocking and terminates whole process trees. [`LocalSupervisor`] is the
//! implementation used by the orchestrator.

mod local;
pub mod log;
pub mod platform;

pub use local::LocalSupervisor;

use crate::config::StartCommand;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Exit metadata captured when a child is reaped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub pid: u32,
    pub code: Option<i32>,
    /// Terminating signal on unix.
    pub signal: Option<i32>,
    pub exited_at: DateTime<Utc>,
}

impl ExitInfo {
    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("pid {} exited with code {}", self.pid, code),
            (None, Some(sig)) => format!("pid {} killed by signal {}", self.pid, sig),
            (None, None) => format!("pid {} exited", self.pid),
        }
    }
}

#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Start `command` for `service`, appending output to the service log.
    /// Returns the child pid.
    async fn spawn(&self, service: &str, command: &StartCommand) -> Result<u32>;

    /// Pid of the live child owned for `service`, if any.
    fn pid_of(&self, service: &str) -> Option<u32>;

    /// Liveness check for any pid, owned or not.
    fn is_alive(&self, pid: u32) -> bool;

    fn is_zombie(&self, pid: u32) -> bool;

    /// Non-blocking exit poll for an owned child. `None` while it runs or
    /// when nothing is owned for `service`.
    fn poll_exit(&self, service: &str) -> Option<ExitInfo>;

    /// Graceful tree signal, then a forced tree kill once `grace` elapses.
    /// Releases ownership of the child.
    async fn terminate(&self, service: &str, grace: Duration) -> Result<Option<ExitInfo>>;

    /// Same as [`terminate`](Self::terminate) for a pid this supervisor did
    /// not spawn (e.g. restored from the registry).
    async fn terminate_pid(&self, pid: u32, service: &str, grace: Duration) -> Result<()>;

    /// Immediate forced tree kill.
    async fn kill_tree(&self, pid: u32, service: &str) -> Result<()>;

    /// Owned children as `(service, pid)`.
    fn managed(&self) -> Vec<(String, u32)>;

    fn log_path(&self, service: &str) -> PathBuf;

    async fn tail_log(&self, service: &str, lines: usize) -> Result<Vec<String>> {
        log::tail(&self.log_path(service), lines).await
    }
}
