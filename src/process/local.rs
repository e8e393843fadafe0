use super::{log, platform, ExitInfo, ProcessSupervisor};
use crate::config::StartCommand;
use crate::error::{validate_pid, Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};

/// How long to wait for the kernel to reap a tree after SIGKILL.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct ChildEntry {
    pid: u32,
    child: Child,
    exit: Option<ExitInfo>,
}

/// Supervisor for children of this process.
///
/// The child table is a sync mutex: every access is a quick lookup or a
/// `try_wait`, never an await. `terminate` removes the entry first and waits
/// on the owned `Child` without the lock.
pub struct LocalSupervisor {
    logs_dir: PathBuf,
    children: Mutex<HashMap<String, ChildEntry>>,
}

impl LocalSupervisor {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            children: Mutex::new(HashMap::new()),
        }
    }

    fn exit_info(pid: u32, status: ExitStatus) -> ExitInfo {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        ExitInfo {
            pid,
            code: status.code(),
            signal,
            exited_at: Utc::now(),
        }
    }

    async fn wait_for_exit(child: &mut Child, pid: u32, timeout: Duration) -> Option<ExitInfo> {
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => Some(Self::exit_info(pid, status)),
            Ok(Err(e)) => {
                tracing::warn!(pid, error = %e, "error waiting for child");
                None
            }
            Err(_) => None,
        }
    }
}

#[async_trait]
impl ProcessSupervisor for LocalSupervisor {
    #[tracing::instrument(skip(self, command), fields(service.name = %service))]
    async fn spawn(&self, service: &str, command: &StartCommand) -> Result<u32> {
        if let Some(pid) = self.pid_of(service) {
            return Err(Error::ServiceStartFailed(
                service.to_string(),
                format!("already running as pid {}", pid),
            ));
        }

        std::fs::create_dir_all(&self.logs_dir)?;
        let path = self.log_path(service);
        log::rotate(&path)?;
        let log_file = OpenOptions::new().create(true).append(true).open(&path)?;
        let stderr_file = log_file.try_clone()?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .current_dir(&command.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr_file))
            .kill_on_drop(false);
        platform::configure(&mut cmd);

        let child = cmd.spawn().map_err(|e| {
            tracing::error!(program = %command.program, cwd = ?command.cwd, error = %e, "spawn failed");
            Error::ServiceStartFailed(service.to_string(), e.to_string())
        })?;

        let raw_pid = child
            .id()
            .ok_or_else(|| Error::ServiceStartFailed(service.to_string(), "child exited before reporting a pid".to_string()))?;
        let pid = validate_pid(raw_pid, service)?;

        self.children.lock().insert(
            service.to_string(),
            ChildEntry {
                pid,
                child,
                exit: None,
            },
        );
        tracing::info!(pid, "service process started");
        Ok(pid)
    }

    fn pid_of(&self, service: &str) -> Option<u32> {
        let mut children = self.children.lock();
        let entry = children.get_mut(service)?;
        if entry.exit.is_none() {
            if let Ok(Some(status)) = entry.child.try_wait() {
                entry.exit = Some(Self::exit_info(entry.pid, status));
            }
        }
        entry.exit.is_none().then_some(entry.pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        platform::pid_alive(pid)
    }

    fn is_zombie(&self, pid: u32) -> bool {
        platform::is_zombie(pid)
    }

    fn poll_exit(&self, service: &str) -> Option<ExitInfo> {
        let mut children = self.children.lock();
        let entry = children.get_mut(service)?;
        if entry.exit.is_none() {
            match entry.child.try_wait() {
                Ok(Some(status)) => entry.exit = Some(Self::exit_info(entry.pid, status)),
                Ok(None) => {}
                Err(e) => tracing::debug!(service, error = %e, "exit poll failed"),
            }
        }
        entry.exit.clone()
    }

    #[tracing::instrument(skip(self), fields(service.name = %service))]
    async fn terminate(&self, service: &str, grace: Duration) -> Result<Option<ExitInfo>> {
        let Some(mut entry) = self.children.lock().remove(service) else {
            return Ok(None);
        };
        if let Some(exit) = entry.exit.take() {
            return Ok(Some(exit));
        }
        if let Ok(Some(status)) = entry.child.try_wait() {
            return Ok(Some(Self::exit_info(entry.pid, status)));
        }

        let pid = entry.pid;
        if let Err(e) = platform::signal_tree(pid, false, service) {
            tracing::warn!(pid, error = %e, "graceful signal failed, forcing");
        } else if let Some(exit) = Self::wait_for_exit(&mut entry.child, pid, grace).await {
            tracing::debug!(pid, "exited gracefully");
            return Ok(Some(exit));
        } else {
            tracing::warn!(pid, ?grace, "did not exit within grace period, killing tree");
        }

        platform::signal_tree(pid, true, service)?;
        Ok(Self::wait_for_exit(&mut entry.child, pid, REAP_TIMEOUT).await)
    }

    async fn terminate_pid(&self, pid: u32, service: &str, grace: Duration) -> Result<()> {
        if !platform::pid_alive(pid) {
            return Ok(());
        }
        platform::signal_tree(pid, false, service)?;

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if !platform::pid_alive(pid) {
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        tracing::warn!(pid, service, ?grace, "did not exit within grace period, killing tree");
        self.kill_tree(pid, service).await
    }

    async fn kill_tree(&self, pid: u32, service: &str) -> Result<()> {
        platform::signal_tree(pid, true, service)?;

        // Reap if it is one of ours so it does not linger as a zombie
        let owned = {
            let mut children = self.children.lock();
            let name = children
                .iter()
                .find(|(_, e)| e.pid == pid)
                .map(|(name, _)| name.clone());
            name.and_then(|n| children.remove(&n))
        };
        if let Some(mut entry) = owned {
            Self::wait_for_exit(&mut entry.child, pid, REAP_TIMEOUT).await;
            return Ok(());
        }

        let deadline = tokio::time::Instant::now() + REAP_TIMEOUT;
        while platform::pid_alive(pid) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Ok(())
    }

    fn managed(&self) -> Vec<(String, u32)> {
        let mut all: Vec<_> = self
            .children
            .lock()
            .iter()
            .filter(|(_, e)| e.exit.is_none())
            .map(|(name, e)| (name.clone(), e.pid))
            .collect();
        all.sort();
        all
    }

    fn log_path(&self, service: &str) -> PathBuf {
        log::log_path(&self.logs_dir, service)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sh(script: &str, cwd: &std::path::Path) -> StartCommand {
        StartCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
            cwd: cwd.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn output_goes_to_service_log() {
        let dir = tempfile::tempdir().unwrap();
        let sup = LocalSupervisor::new(dir.path().join("logs"));
        sup.spawn("echo", &sh("echo $GREETING; echo FATAL boom >&2", dir.path()))
            .await
            .unwrap();

        for _ in 0..50 {
            if sup.poll_exit("echo").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let lines = sup.tail_log("echo", 10).await.unwrap();
        assert!(lines.contains(&"hello".to_string()));
        assert!(lines.contains(&"FATAL boom".to_string()));
    }

    #[tokio::test]
    async fn respawn_starts_a_fresh_log() {
        let dir = tempfile::tempdir().unwrap();
        let sup = LocalSupervisor::new(dir.path());
        for word in ["first", "second"] {
            sup.spawn("svc", &sh(&format!("echo {}", word), dir.path()))
                .await
                .unwrap();
            for _ in 0..50 {
                if sup.poll_exit("svc").is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
        assert_eq!(sup.tail_log("svc", 10).await.unwrap(), vec!["second".to_string()]);
        let previous = std::fs::read_to_string(dir.path().join("svc.log.1")).unwrap();
        assert_eq!(previous.trim(), "first");
    }

    #[tokio::test]
    async fn exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let sup = LocalSupervisor::new(dir.path());
        sup.spawn("fail", &sh("exit 3", dir.path())).await.unwrap();

        let mut exit = None;
        for _ in 0..50 {
            exit = sup.poll_exit("fail");
            if exit.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(exit.unwrap().code, Some(3));
        assert_eq!(sup.pid_of("fail"), None);
    }

    #[tokio::test]
    async fn terminate_stops_the_process_tree() {
        let dir = tempfile::tempdir().unwrap();
        let sup = LocalSupervisor::new(dir.path());
        let pid = sup
            .spawn("sleepy", &sh("sleep 30 & sleep 30; wait", dir.path()))
            .await
            .unwrap();
        assert!(sup.is_alive(pid));
        assert_eq!(sup.managed(), vec![("sleepy".to_string(), pid)]);

        let exit = sup
            .terminate("sleepy", Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.pid, pid);
        assert!(!sup.is_alive(pid));
        assert!(sup.managed().is_empty());
    }

    #[tokio::test]
    async fn double_spawn_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sup = LocalSupervisor::new(dir.path());
        sup.spawn("svc", &sh("sleep 30", dir.path())).await.unwrap();
        assert!(sup.spawn("svc", &sh("sleep 30", dir.path())).await.is_err());
        sup.terminate("svc", Duration::from_millis(500)).await.unwrap();
    }

    #[tokio::test]
    async fn terminate_unknown_service_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let sup = LocalSupervisor::new(dir.path());
        assert!(sup.terminate("ghost", Duration::from_millis(10)).await.unwrap().is_none());
    }
}
