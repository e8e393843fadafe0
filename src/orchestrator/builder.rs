use super::Orchestrator;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::health::{HealthChecker, HealthMonitor, HttpChecker};
use crate::port::PortAllocator;
use crate::process::{LocalSupervisor, ProcessSupervisor};
use crate::recovery::{CrashDetector, LocalEnvironment, RecoveryManager, ReportStore};
use crate::registry::ServiceRegistry;
use crate::shutdown::{ExitPolicy, ShutdownCoordinator};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Builder for constructing an [`Orchestrator`].
///
/// Validates the configuration, reopens the persisted registry and wires
/// every component to the same allocator and registry.
///
/// # Example
///
/// ```no_run
/// use devfleet::{Config, Orchestrator};
/// use std::path::PathBuf;
///
/// # async fn example() -> Result<(), devfleet::Error> {
/// let orchestrator = Orchestrator::builder()
///     .config(Config::default())
///     .work_dir(PathBuf::from("."))
///     .build()?;
/// orchestrator.start_all(&[]).await?;
/// # Ok(())
/// # }
/// ```
pub struct OrchestratorBuilder {
    config: Option<Config>,
    work_dir: Option<PathBuf>,
    exit_policy: ExitPolicy,
    supervisor: Option<Arc<dyn ProcessSupervisor>>,
    checker: Option<Arc<dyn HealthChecker>>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            work_dir: None,
            exit_policy: ExitPolicy::Return,
            supervisor: None,
            checker: None,
        }
    }

    /// Set the configuration. Required.
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Directory relative paths resolve against. Defaults to ".".
    pub fn work_dir(mut self, dir: PathBuf) -> Self {
        self.work_dir = Some(dir);
        self
    }

    /// What emergency shutdown does afterwards. Defaults to
    /// [`ExitPolicy::Return`]; the binary uses `Exit(1)`.
    pub fn exit_policy(mut self, policy: ExitPolicy) -> Self {
        self.exit_policy = policy;
        self
    }

    /// Replace the local process supervisor.
    pub fn supervisor(mut self, supervisor: Arc<dyn ProcessSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Replace the HTTP health checker.
    pub fn health_checker(mut self, checker: Arc<dyn HealthChecker>) -> Self {
        self.checker = Some(checker);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let config = self
            .config
            .ok_or_else(|| Error::Config("Configuration is required".to_string()))?;
        config.validate()?;

        let work_dir = self.work_dir.unwrap_or_else(|| PathBuf::from("."));
        let state_dir = config.state_path(&work_dir);
        std::fs::create_dir_all(&state_dir)?;

        let allocator = Arc::new(PortAllocator::new(config.bind_host));
        let registry = Arc::new(ServiceRegistry::load(
            state_dir.join("registry"),
            Arc::clone(&allocator),
        )?);
        let supervisor = self
            .supervisor
            .unwrap_or_else(|| Arc::new(LocalSupervisor::new(state_dir.join("logs"))));
        let checker = self.checker.unwrap_or_else(|| Arc::new(HttpChecker::new()));

        let (crash_tx, crash_rx) = tokio::sync::mpsc::unbounded_channel();
        let monitor = Arc::new(
            HealthMonitor::new(Arc::clone(&registry), Arc::clone(&checker), config.health.clone())
                .with_crash_channel(crash_tx),
        );

        let environment = LocalEnvironment::new(
            Arc::clone(&registry),
            Arc::clone(&supervisor),
            Arc::clone(&checker),
            config.services.clone(),
            work_dir.clone(),
            config.health.clone(),
            config.shutdown.stop_grace,
        );
        let detector = CrashDetector::new(
            Arc::clone(&supervisor),
            Arc::clone(&checker),
            config.health.timeout,
            config.recovery.detection_lines,
        );
        let markers: BTreeMap<String, Vec<String>> = config
            .services
            .iter()
            .filter_map(|(name, svc)| svc.fatal_markers.clone().map(|m| (name.clone(), m)))
            .collect();
        let recovery = Arc::new(
            RecoveryManager::new(
                Arc::clone(&registry),
                Arc::new(environment),
                ReportStore::new(state_dir.join("reports")),
                config.recovery.clone(),
            )
            .with_detector(detector)
            .with_service_markers(markers),
        );

        let shutdown = Arc::new(ShutdownCoordinator::new(config.shutdown.clone(), self.exit_policy));

        tracing::debug!(
            state_dir = %state_dir.display(),
            services = config.services.len(),
            bind_host = %config.bind_host,
            "orchestrator built"
        );

        Ok(Orchestrator {
            config,
            work_dir,
            state_dir,
            allocator,
            registry,
            supervisor,
            checker,
            monitor,
            recovery,
            shutdown,
            crash_rx: Mutex::new(Some(crash_rx)),
            background: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
