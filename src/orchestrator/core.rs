use super::OrchestratorBuilder;
use crate::config::{Config, ServiceConfig};
use crate::error::{Error, Result};
use crate::health::{HealthChecker, HealthMonitor};
use crate::port::PortAllocator;
use crate::process::ProcessSupervisor;
use crate::recovery::{CrashSignal, RecoveryManager};
use crate::registry::{ServiceRecord, ServiceRegistry, ServiceStatus, StalenessReaper, SystemLiveness};
use crate::shutdown::ShutdownCoordinator;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long background tasks get to wind down when stopped.
const BACKGROUND_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Context object owning every orchestration component.
///
/// All components share one [`PortAllocator`] and one [`ServiceRegistry`];
/// nothing else holds mutable shared state. Methods take `&self` and are
/// safe to call concurrently.
///
/// # Service lifecycle
///
/// 1. **Start**: allocate a port, spawn the child with `PORT` set, register
///    it as `starting` and wait for its first healthy probe
/// 2. **Monitor**: the health monitor, crash recovery and staleness reaper
///    run as background tasks ([`run_background_tasks`](Self::run_background_tasks))
/// 3. **Stop**: graceful tree signal, forced kill after the grace period
pub struct Orchestrator {
    pub(super) config: Config,
    pub(super) work_dir: PathBuf,
    pub(super) state_dir: PathBuf,
    pub(super) allocator: Arc<PortAllocator>,
    pub(super) registry: Arc<ServiceRegistry>,
    pub(super) supervisor: Arc<dyn ProcessSupervisor>,
    pub(super) checker: Arc<dyn HealthChecker>,
    pub(super) monitor: Arc<HealthMonitor>,
    pub(super) recovery: Arc<RecoveryManager>,
    pub(super) shutdown: Arc<ShutdownCoordinator>,
    pub(super) crash_rx: Mutex<Option<UnboundedReceiver<CrashSignal>>>,
    pub(super) background: CancellationToken,
    pub(super) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn allocator(&self) -> &Arc<PortAllocator> {
        &self.allocator
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<dyn ProcessSupervisor> {
        &self.supervisor
    }

    pub fn health_checker(&self) -> &Arc<dyn HealthChecker> {
        &self.checker
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    fn service_config(&self, name: &str) -> Result<&ServiceConfig> {
        self.config
            .services
            .get(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))
    }

    /// Startup order over the configured services; see [`Config::startup_order`].
    pub fn startup_order(&self, only: &[String]) -> Result<Vec<String>> {
        self.config.startup_order(only)
    }

    /// Start services in dependency order, each waiting until healthy before
    /// the next one starts. Returns the started names.
    pub async fn start_all(&self, only: &[String]) -> Result<Vec<String>> {
        let order = self.startup_order(only)?;
        tracing::info!(services = ?order, "starting services");
        for name in &order {
            self.start(name).await?;
        }
        Ok(order)
    }

    /// Start one service and wait for it to become healthy. Returns its port.
    ///
    /// Every declared dependency must already be healthy. A service that is
    /// already running is left alone.
    #[tracing::instrument(skip(self), fields(service.name = %name))]
    pub async fn start(&self, name: &str) -> Result<u16> {
        if self.shutdown.is_shutting_down() {
            return Err(Error::Cancelled(format!("start of '{}': shutdown in progress", name)));
        }
        let config = self.service_config(name)?;

        if let Some(record) = self.registry.get(name) {
            if self.supervisor.pid_of(name).is_some() && record.status != ServiceStatus::Stopped {
                tracing::debug!(port = record.port, "already running");
                return Ok(record.port);
            }
        }

        for dep in config.depends_on.iter().filter(|d| self.config.services.contains_key(*d)) {
            let healthy = self
                .registry
                .get(dep)
                .is_some_and(|r| r.status == ServiceStatus::Healthy);
            if !healthy {
                return Err(Error::ServiceStartFailed(
                    name.to_string(),
                    format!("dependency '{}' is not healthy", dep),
                ));
            }
        }

        let port = self
            .allocator
            .allocate(name, config.preferred_port(), config.range()?, config.class)
            .await?;
        let command = config
            .start_command(&self.work_dir)?
            .with_env("PORT", port.to_string());

        self.allocator.handoff(port);
        let pid = match self.supervisor.spawn(name, &command).await {
            Ok(pid) => pid,
            Err(e) => {
                self.allocator.release(port);
                return Err(e);
            }
        };

        let mut record = ServiceRecord::new(name, config.host.clone(), port)
            .with_pid(pid)
            .with_status(ServiceStatus::Starting)
            .with_dependencies(config.depends_on.iter().cloned())
            .with_health_path(config.health_path.clone());
        record.protocol = config.protocol.clone();

        if let Err(e) = self.registry.register(record) {
            self.abort_start(name).await;
            self.allocator.release(port);
            return Err(e);
        }

        if let Err(e) = self.monitor.wait_until_healthy(name).await {
            tracing::error!(error = %e, "service did not become healthy");
            self.abort_start(name).await;
            return Err(e);
        }

        tracing::info!(port, pid, "service healthy");
        Ok(port)
    }

    async fn abort_start(&self, name: &str) {
        if let Err(e) = self.supervisor.terminate(name, self.config.shutdown.stop_grace).await {
            tracing::warn!(service = %name, error = %e, "failed to stop service after failed start");
        }
        if self.registry.get(name).is_some() {
            let _ = self.registry.update(name, |r| {
                r.status = ServiceStatus::Stopped;
                r.pid = None;
            });
        }
    }

    /// Stop one service. The record stays registered as `stopped` and keeps
    /// its port reservation so a restart gets the same port.
    #[tracing::instrument(skip(self), fields(service.name = %name))]
    pub async fn stop(&self, name: &str) -> Result<()> {
        let record = self
            .registry
            .get(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
        if record.status == ServiceStatus::Stopped && record.pid.is_none() {
            return Ok(());
        }
        if record.status.is_valid_transition(ServiceStatus::Stopping) {
            self.registry.update_status(name, ServiceStatus::Stopping)?;
        }

        let grace = self.config.shutdown.stop_grace;
        let exit = self.supervisor.terminate(name, grace).await?;
        if exit.is_none() {
            // Not ours, e.g. restored from a previous run
            if let Some(pid) = record.pid {
                self.supervisor.terminate_pid(pid, name, grace).await?;
            }
        }

        self.registry.update(name, |r| {
            r.status = ServiceStatus::Stopped;
            r.pid = None;
        })?;
        tracing::info!(exit = ?exit.map(|e| e.describe()), "service stopped");
        Ok(())
    }

    /// Stop every registered service in reverse startup order. Keeps going
    /// past failures and returns the first one.
    pub async fn stop_all(&self) -> Result<()> {
        let mut order = self
            .registry
            .resolve_startup_order()
            .unwrap_or_else(|_| self.registry.names());
        order.reverse();

        let mut first_error = None;
        for name in order {
            if let Err(e) = self.stop(&name).await {
                tracing::warn!(service = %name, error = %e, "failed to stop service");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Force-kill every process tree we know of, owned or persisted.
    pub async fn kill_process_trees(&self) -> Result<()> {
        let mut targets: Vec<(String, u32)> = self.supervisor.managed();
        for record in self.registry.list(None) {
            if let Some(pid) = record.pid {
                if !targets.iter().any(|(_, p)| *p == pid) && self.supervisor.is_alive(pid) {
                    targets.push((record.name.clone(), pid));
                }
            }
        }
        for (name, pid) in targets {
            tracing::warn!(service = %name, pid, "killing process tree");
            self.supervisor.kill_tree(pid, &name).await?;
            if self.registry.get(&name).is_some() {
                self.registry.update(&name, |r| {
                    r.pid = None;
                    r.status = ServiceStatus::Stopped;
                })?;
            }
        }
        Ok(())
    }

    /// Stop everything recorded in the registry, including processes left
    /// by another run, then clear the registry.
    pub async fn teardown(&self) -> Result<Vec<String>> {
        let grace = self.config.shutdown.stop_grace;
        let mut removed = Vec::new();
        for record in self.registry.list(None) {
            if self.supervisor.terminate(&record.name, grace).await?.is_none() {
                if let Some(pid) = record.pid {
                    self.supervisor.terminate_pid(pid, &record.name, grace).await?;
                }
            }
            self.registry.unregister(&record.name)?;
            removed.push(record.name);
        }
        Ok(removed)
    }

    /// Registered services ordered by name.
    pub fn status(&self) -> Vec<ServiceRecord> {
        self.registry.list(None)
    }

    /// Spawn the health monitor, crash recovery and staleness reaper. They
    /// run until [`stop_background_tasks`](Self::stop_background_tasks).
    /// Calling this twice is a no-op.
    pub fn run_background_tasks(&self) {
        let Some(crash_rx) = self.crash_rx.lock().take() else {
            tracing::debug!("background tasks already running");
            return;
        };

        let liveness = Arc::new(SystemLiveness::new(
            Arc::clone(&self.supervisor),
            Arc::clone(&self.allocator),
        ));
        let reaper = StalenessReaper::new(Arc::clone(&self.registry), liveness, self.config.registry.ttl);

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(
            Arc::clone(&self.monitor).run(self.background.child_token()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&self.recovery).run(crash_rx, self.background.child_token()),
        ));
        tasks.push(tokio::spawn(
            reaper.run(self.config.registry.clone(), self.background.child_token()),
        ));
        tracing::debug!("background tasks started");
    }

    /// Cancel background tasks and wait briefly for them to finish.
    pub async fn stop_background_tasks(&self) {
        self.background.cancel();
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(BACKGROUND_STOP_TIMEOUT, handle).await.is_err() {
                tracing::warn!("background task did not stop in time");
            }
        }
    }
}
