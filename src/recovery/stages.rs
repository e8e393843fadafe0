//! Recovery stages and the environment they act on.
//!
//! The manager drives the stage order, timeouts and backoff; a
//! [`RecoveryEnvironment`] does the actual observing and fixing. The fallback
//! stage is pure and lives in [`super::report`].

use super::{CapturedError, DiagnosisResult, PortConflict};
use crate::config::{HealthSettings, ServiceConfig};
use crate::error::{Error, Result};
use crate::health::{apply_probe, HealthChecker};
use crate::process::ProcessSupervisor;
use crate::registry::{ServiceRegistry, ServiceStatus};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Log phrases that point at resource exhaustion rather than a code bug.
const RESOURCE_PATTERNS: &[(&str, &str)] = &[
    ("out of memory", "memory exhausted"),
    ("cannot allocate memory", "memory exhausted"),
    ("no space left on device", "disk full"),
    ("too many open files", "file descriptor limit reached"),
    ("address already in use", "port already in use"),
];

const VERIFY_POLL: Duration = Duration::from_millis(500);

#[async_trait]
pub trait RecoveryEnvironment: Send + Sync {
    /// Stage 1: exit metadata and the last `lines` log lines.
    async fn capture(&self, service: &str, lines: usize) -> Result<CapturedError>;

    /// Stage 2: port conflicts, zombies and resource exhaustion.
    async fn diagnose(&self, service: &str, captured: &CapturedError) -> Result<DiagnosisResult>;

    /// Stage 3: corrective action. Returns a description of every action taken.
    async fn attempt(&self, service: &str, diagnosis: &DiagnosisResult) -> Result<Vec<String>>;

    /// Whether the service is serving again after [`attempt`](Self::attempt).
    async fn verify(&self, service: &str) -> bool;

    /// Called once when every attempt failed: stop anything the attempts
    /// left running so the service ends up stopped.
    async fn abandon(&self, _service: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Environment acting on real processes through the supervisor.
pub struct LocalEnvironment {
    registry: Arc<ServiceRegistry>,
    supervisor: Arc<dyn ProcessSupervisor>,
    checker: Arc<dyn HealthChecker>,
    services: BTreeMap<String, ServiceConfig>,
    workdir: PathBuf,
    health: HealthSettings,
    stop_grace: Duration,
}

impl LocalEnvironment {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        supervisor: Arc<dyn ProcessSupervisor>,
        checker: Arc<dyn HealthChecker>,
        services: BTreeMap<String, ServiceConfig>,
        workdir: PathBuf,
        health: HealthSettings,
        stop_grace: Duration,
    ) -> Self {
        Self {
            registry,
            supervisor,
            checker,
            services,
            workdir,
            health,
            stop_grace,
        }
    }

    fn service_config(&self, service: &str) -> Result<&ServiceConfig> {
        self.services
            .get(service)
            .ok_or_else(|| Error::ServiceNotFound(service.to_string()))
    }

    /// Stop whatever is left of the old process tree.
    async fn stop_leftovers(&self, service: &str, diagnosis: &DiagnosisResult, actions: &mut Vec<String>) {
        for &pid in &diagnosis.zombie_pids {
            match self.supervisor.kill_tree(pid, service).await {
                Ok(()) => actions.push(format!("killed zombie pid {}", pid)),
                Err(e) => actions.push(format!("failed to kill zombie pid {}: {}", pid, e)),
            }
        }

        match self.supervisor.terminate(service, self.stop_grace).await {
            Ok(Some(exit)) => actions.push(format!("reaped previous process: {}", exit.describe())),
            Ok(None) => {}
            Err(e) => actions.push(format!("failed to terminate previous process: {}", e)),
        }

        // A pid restored from disk is not owned by the supervisor
        if let Some(pid) = self.registry.get(service).and_then(|r| r.pid) {
            if self.supervisor.is_alive(pid) && !diagnosis.zombie_pids.contains(&pid) {
                match self.supervisor.terminate_pid(pid, service, self.stop_grace).await {
                    Ok(()) => actions.push(format!("terminated unresponsive pid {}", pid)),
                    Err(e) => actions.push(format!("failed to terminate pid {}: {}", pid, e)),
                }
            }
        }
    }

    fn clear_temp_files(&self, config: &ServiceConfig, cwd: &std::path::Path, actions: &mut Vec<String>) {
        for file in &config.temp_files {
            let path = if file.is_absolute() { file.clone() } else { cwd.join(file) };
            if !path.exists() {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => actions.push(format!("removed temp file {}", path.display())),
                Err(e) => actions.push(format!("could not remove {}: {}", path.display(), e)),
            }
        }
    }
}

#[async_trait]
impl RecoveryEnvironment for LocalEnvironment {
    async fn capture(&self, service: &str, lines: usize) -> Result<CapturedError> {
        let exit = self.supervisor.poll_exit(service);
        let last_error = self.registry.get(service).and_then(|r| r.last_error);
        let log_tail = self.supervisor.tail_log(service, lines).await?;
        Ok(CapturedError {
            exit,
            last_error,
            log_tail,
        })
    }

    async fn diagnose(&self, service: &str, captured: &CapturedError) -> Result<DiagnosisResult> {
        let record = self
            .registry
            .get(service)
            .ok_or_else(|| Error::ServiceNotFound(service.to_string()))?;
        let mut diagnosis = DiagnosisResult::default();

        // The supervisor reaps its own children; only a pid it never spawned
        // (e.g. restored from disk) can linger as a zombie
        let owned = self
            .supervisor
            .pid_of(service)
            .or_else(|| self.supervisor.poll_exit(service).map(|exit| exit.pid));
        let own: Vec<u32> = [record.pid, owned].into_iter().flatten().collect();

        // Listener lookup shells out to ss/lsof/netstat
        let port = record.port;
        let holders = tokio::task::spawn_blocking(move || crate::port::find_owning_processes(port))
            .await
            .map_err(|e| Error::Process(format!("listener lookup failed: {}", e)))?;
        let foreign: Vec<_> = holders.into_iter().filter(|p| !own.contains(&p.pid)).collect();
        if !foreign.is_empty() {
            diagnosis.port_conflicts.push(PortConflict { port, holders: foreign });
        }

        if let Some(pid) = record.pid.filter(|pid| Some(*pid) != owned) {
            if self.supervisor.is_zombie(pid) {
                diagnosis.zombie_pids.push(pid);
            }
        }

        for line in &captured.log_tail {
            let lowered = line.to_lowercase();
            for (pattern, issue) in RESOURCE_PATTERNS {
                if lowered.contains(pattern) && !diagnosis.resource_issues.iter().any(|i| i == issue) {
                    diagnosis.resource_issues.push(issue.to_string());
                }
            }
        }

        Ok(diagnosis)
    }

    #[tracing::instrument(skip(self, diagnosis), fields(service.name = %service))]
    async fn attempt(&self, service: &str, diagnosis: &DiagnosisResult) -> Result<Vec<String>> {
        let config = self.service_config(service)?;
        let record = self
            .registry
            .get(service)
            .ok_or_else(|| Error::ServiceNotFound(service.to_string()))?;
        let mut actions = Vec::new();

        self.stop_leftovers(service, diagnosis, &mut actions).await;
        if record.status != ServiceStatus::Stopped {
            self.registry.update_status(service, ServiceStatus::Stopped)?;
        }

        let command = config
            .start_command(&self.workdir)?
            .with_env("PORT", record.port.to_string());
        self.clear_temp_files(config, &command.cwd, &mut actions);

        for conflict in &diagnosis.port_conflicts {
            let pids: Vec<String> = conflict.holders.iter().map(|p| p.pid.to_string()).collect();
            actions.push(format!(
                "port {} held by pid {}, left untouched",
                conflict.port,
                pids.join(", ")
            ));
        }

        self.registry.allocator().handoff(record.port);
        let pid = self.supervisor.spawn(service, &command).await?;
        self.registry.set_pid(service, Some(pid))?;
        self.registry.update_status(service, ServiceStatus::Starting)?;
        actions.push(format!("restarted on port {} as pid {}", record.port, pid));
        Ok(actions)
    }

    async fn verify(&self, service: &str) -> bool {
        let attempts = (self.health.startup_timeout.as_millis() / VERIFY_POLL.as_millis()).max(1);
        let policy = RetryPolicy::fixed(attempts as usize, VERIFY_POLL);
        let probe = policy
            .run(|_| async move {
                if let Some(exit) = self.supervisor.poll_exit(service) {
                    return Err(exit.describe());
                }
                let record = self
                    .registry
                    .get(service)
                    .ok_or_else(|| "unregistered".to_string())?;
                let probe = self.checker.probe(&record, self.health.timeout).await;
                if probe.healthy {
                    Ok(probe)
                } else {
                    Err(probe.describe())
                }
            })
            .await;

        match probe {
            Ok(probe) => self
                .registry
                .update(service, |r| apply_probe(r, &probe, self.health.failure_threshold))
                .is_ok(),
            Err(reason) => {
                tracing::debug!(service, %reason, "service did not come back");
                false
            }
        }
    }

    async fn abandon(&self, service: &str) -> Result<Vec<String>> {
        let mut actions = Vec::new();
        match self.supervisor.terminate(service, self.stop_grace).await {
            Ok(Some(exit)) => actions.push(format!("stopped last restart: {}", exit.describe())),
            Ok(None) => {}
            Err(e) => actions.push(format!("failed to stop last restart: {}", e)),
        }
        if let Some(pid) = self.registry.get(service).and_then(|r| r.pid) {
            if self.supervisor.is_alive(pid) {
                self.supervisor.terminate_pid(pid, service, self.stop_grace).await?;
                actions.push(format!("terminated pid {}", pid));
            }
        }

        match self.registry.update(service, |r| {
            r.pid = None;
            r.status = ServiceStatus::Stopped;
        }) {
            Ok(()) | Err(Error::ServiceNotFound(_)) => Ok(actions),
            Err(e) => Err(e),
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::health::HttpChecker;
    use crate::port::PortAllocator;
    use crate::process::LocalSupervisor;
    use crate::registry::ServiceRecord;
    use std::net::{IpAddr, Ipv4Addr};

    struct Fixture {
        dir: tempfile::TempDir,
        registry: Arc<ServiceRegistry>,
        supervisor: Arc<LocalSupervisor>,
        env: LocalEnvironment,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let allocator = Arc::new(PortAllocator::new(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        let registry = Arc::new(ServiceRegistry::new(dir.path().join("registry"), allocator));
        let supervisor = Arc::new(LocalSupervisor::new(dir.path().join("logs")));
        let services = BTreeMap::from([("svc".to_string(), ServiceConfig::new(["sleep", "30"]))]);
        let env = LocalEnvironment::new(
            registry.clone(),
            supervisor.clone(),
            Arc::new(HttpChecker::new()),
            services,
            dir.path().to_path_buf(),
            HealthSettings::default(),
            Duration::from_millis(500),
        );
        Fixture {
            dir,
            registry,
            supervisor,
            env,
        }
    }

    fn wait_for_exit(pid: u32) {
        for _ in 0..50 {
            if crate::process::platform::is_zombie(pid) {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("pid {pid} never exited");
    }

    #[tokio::test]
    async fn unowned_zombie_is_diagnosed() {
        let fx = fixture();
        // Spawned outside the supervisor and never waited on
        let mut orphan = std::process::Command::new("true").spawn().unwrap();
        let pid = orphan.id();
        wait_for_exit(pid);
        fx.registry
            .register(ServiceRecord::new("svc", "127.0.0.1", 41_511).with_pid(pid))
            .unwrap();

        let diagnosis = fx.env.diagnose("svc", &CapturedError::default()).await.unwrap();
        assert_eq!(diagnosis.zombie_pids, vec![pid]);
        orphan.wait().unwrap();
    }

    #[tokio::test]
    async fn exited_owned_child_is_reaped_not_reported() {
        let fx = fixture();
        let command = ServiceConfig::new(["sh", "-c", "exit 2"])
            .start_command(fx.dir.path())
            .unwrap();
        let pid = fx.supervisor.spawn("svc", &command).await.unwrap();
        fx.registry
            .register(ServiceRecord::new("svc", "127.0.0.1", 41_512).with_pid(pid))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let captured = fx.env.capture("svc", 10).await.unwrap();
        assert_eq!(captured.exit.as_ref().map(|e| e.code), Some(Some(2)));
        let diagnosis = fx.env.diagnose("svc", &captured).await.unwrap();
        assert!(diagnosis.zombie_pids.is_empty());
        assert!(!crate::process::platform::is_zombie(pid));
    }

    #[tokio::test]
    async fn abandon_stops_the_last_restart() {
        let fx = fixture();
        fx.registry
            .register(ServiceRecord::new("svc", "127.0.0.1", 41_513).with_status(ServiceStatus::Stopped))
            .unwrap();
        let actions = fx.env.attempt("svc", &DiagnosisResult::default()).await.unwrap();
        assert!(actions.iter().any(|a| a.starts_with("restarted on port 41513")));
        let pid = fx.registry.get("svc").unwrap().pid.unwrap();
        assert_eq!(fx.registry.get("svc").unwrap().status, ServiceStatus::Starting);

        fx.env.abandon("svc").await.unwrap();

        let record = fx.registry.get("svc").unwrap();
        assert_eq!(record.status, ServiceStatus::Stopped);
        assert!(record.pid.is_none());
        assert!(!fx.supervisor.is_alive(pid));
        assert!(fx.supervisor.managed().is_empty());
    }
}
