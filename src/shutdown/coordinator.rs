use crate::config::ShutdownSettings;
use crate::error::{Error, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Priorities below this stop services.
pub const PRIORITY_PROCESSES: i32 = 100;
/// Priorities at or above this clean up resources.
pub const PRIORITY_RESOURCES: i32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPhase {
    Running,
    Initiated,
    StoppingServices,
    CleaningProcesses,
    CleaningResources,
    EmergencyCleanup,
    Completed,
}

impl ShutdownPhase {
    fn for_priority(priority: i32) -> Self {
        if priority < PRIORITY_PROCESSES {
            ShutdownPhase::StoppingServices
        } else if priority < PRIORITY_RESOURCES {
            ShutdownPhase::CleaningProcesses
        } else {
            ShutdownPhase::CleaningResources
        }
    }
}

impl fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShutdownPhase::Running => "running",
            ShutdownPhase::Initiated => "initiated",
            ShutdownPhase::StoppingServices => "stopping_services",
            ShutdownPhase::CleaningProcesses => "cleaning_processes",
            ShutdownPhase::CleaningResources => "cleaning_resources",
            ShutdownPhase::EmergencyCleanup => "emergency_cleanup",
            ShutdownPhase::Completed => "completed",
        };
        f.write_str(s)
    }
}

pub type CleanupAction = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Clone)]
pub struct CleanupHandler {
    pub name: String,
    /// Lower runs first.
    pub priority: i32,
    pub timeout: Duration,
    /// A failure escalates to emergency cleanup.
    pub critical: bool,
    action: CleanupAction,
}

impl fmt::Debug for CleanupHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupHandler")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("critical", &self.critical)
            .finish()
    }
}

impl CleanupHandler {
    /// Run the handler under its own timeout, turning panics and timeouts
    /// into errors.
    async fn execute(&self, timeout: Duration) -> Result<()> {
        let fut = AssertUnwindSafe((self.action)()).catch_unwind();
        let failure = |reason: String| Error::ShutdownHandler {
            name: self.name.clone(),
            reason,
        };
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(failure(e.to_string())),
            Ok(Err(_)) => Err(failure("panicked".to_string())),
            Err(_) => Err(failure(format!("timed out after {:?}", timeout))),
        }
    }
}

/// What emergency cleanup does once its handlers ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitPolicy {
    /// Terminate the process with this code.
    Exit(i32),
    /// Return to the caller, for embedding and tests.
    Return,
}

#[derive(Debug, Default)]
pub struct ShutdownOutcome {
    pub reason: String,
    /// Handlers that completed, in execution order.
    pub completed: Vec<String>,
    pub failures: Vec<Error>,
    pub emergency: bool,
    /// Why the emergency path was taken.
    pub escalation: Option<String>,
}

enum Escalation {
    CriticalFailure(String),
    Deadline,
    Forced,
}

/// Drains registered cleanup handlers exactly once.
pub struct ShutdownCoordinator {
    settings: ShutdownSettings,
    exit_policy: ExitPolicy,
    handlers: Mutex<Vec<CleanupHandler>>,
    phase: Mutex<ShutdownPhase>,
    started: AtomicBool,
    clean_exit: AtomicBool,
    force: CancellationToken,
    completed: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new(settings: ShutdownSettings, exit_policy: ExitPolicy) -> Self {
        Self {
            settings,
            exit_policy,
            handlers: Mutex::new(Vec::new()),
            phase: Mutex::new(ShutdownPhase::Running),
            started: AtomicBool::new(false),
            clean_exit: AtomicBool::new(false),
            force: CancellationToken::new(),
            completed: CancellationToken::new(),
        }
    }

    pub fn settings(&self) -> &ShutdownSettings {
        &self.settings
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        let mut current = self.phase.lock();
        if *current != phase {
            tracing::debug!(from = %*current, to = %phase, "shutdown phase");
            *current = phase;
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Register a cleanup handler. Fails once shutdown has started.
    pub fn register_cleanup<F, Fut>(
        &self,
        name: impl Into<String>,
        priority: i32,
        timeout: Duration,
        critical: bool,
        action: F,
    ) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        if self.is_shutting_down() {
            return Err(Error::ShutdownHandler {
                name,
                reason: "shutdown already in progress".to_string(),
            });
        }
        let action: CleanupAction = Arc::new(move || action().boxed());
        tracing::debug!(handler = %name, priority, critical, "cleanup handler registered");
        self.handlers.lock().push(CleanupHandler {
            name,
            priority,
            timeout,
            critical,
            action,
        });
        Ok(())
    }

    /// Handlers sorted by priority; registration order breaks ties.
    fn sorted_handlers(&self) -> Vec<CleanupHandler> {
        let mut handlers = self.handlers.lock().clone();
        handlers.sort_by_key(|h| h.priority);
        handlers
    }

    /// The program is exiting normally; the last-resort hook must not fire.
    pub fn mark_clean_exit(&self) {
        self.clean_exit.store(true, Ordering::SeqCst);
    }

    pub fn is_clean_exit(&self) -> bool {
        self.clean_exit.load(Ordering::SeqCst)
    }

    /// Resolves once a shutdown sequence has completed.
    pub async fn wait_completed(&self) {
        self.completed.cancelled().await;
    }

    /// Run the shutdown sequence. Only the first call does anything; later
    /// and concurrent calls return `None` immediately.
    pub async fn initiate_shutdown(&self, reason: &str) -> Option<ShutdownOutcome> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(reason, "shutdown already in progress");
            return None;
        }
        tracing::info!(reason, "shutdown initiated");
        self.set_phase(ShutdownPhase::Initiated);

        let handlers = self.sorted_handlers();
        let outcome = Mutex::new(ShutdownOutcome {
            reason: reason.to_string(),
            ..Default::default()
        });

        let escalation = tokio::select! {
            biased;
            _ = self.force.cancelled() => Some(Escalation::Forced),
            normal = tokio::time::timeout(self.settings.emergency_timeout, self.run_normal(&handlers, &outcome)) => {
                match normal {
                    Ok(None) => None,
                    Ok(Some(name)) => Some(Escalation::CriticalFailure(name)),
                    Err(_) => Some(Escalation::Deadline),
                }
            }
        };

        let mut outcome = outcome.into_inner();
        if let Some(escalation) = escalation {
            let why = match escalation {
                Escalation::CriticalFailure(name) => format!("critical handler '{}' failed", name),
                Escalation::Deadline => format!("emergency timeout of {:?} elapsed", self.settings.emergency_timeout),
                Escalation::Forced => "forced shutdown".to_string(),
            };
            tracing::error!(reason = %why, "escalating to emergency cleanup");
            outcome.emergency = true;
            outcome.escalation = Some(why);
            self.run_emergency(&handlers, &mut outcome).await;
        }

        self.set_phase(ShutdownPhase::Completed);
        tracing::info!(
            completed = outcome.completed.len(),
            failed = outcome.failures.len(),
            emergency = outcome.emergency,
            "shutdown completed"
        );
        self.completed.cancel();

        if outcome.emergency {
            if let ExitPolicy::Exit(code) = self.exit_policy {
                std::process::exit(code);
            }
        }
        Some(outcome)
    }

    /// Skip straight to emergency cleanup, or escalate a shutdown already in
    /// progress. Returns `None` when another caller owns the sequence.
    pub async fn force_shutdown(&self, reason: &str) -> Option<ShutdownOutcome> {
        self.force.cancel();
        self.initiate_shutdown(reason).await
    }

    /// Escalate an in-progress shutdown without waiting for it.
    pub fn escalate(&self) {
        self.force.cancel();
    }

    /// Normal path. Returns the name of a failed critical handler, if any.
    async fn run_normal(&self, handlers: &[CleanupHandler], outcome: &Mutex<ShutdownOutcome>) -> Option<String> {
        for handler in handlers {
            self.set_phase(ShutdownPhase::for_priority(handler.priority));
            tracing::debug!(handler = %handler.name, priority = handler.priority, "running cleanup handler");

            match handler.execute(handler.timeout).await {
                Ok(()) => outcome.lock().completed.push(handler.name.clone()),
                Err(e) => {
                    tracing::warn!(handler = %handler.name, error = %e, critical = handler.critical, "cleanup handler failed");
                    outcome.lock().failures.push(e);
                    if handler.critical {
                        return Some(handler.name.clone());
                    }
                }
            }
        }
        None
    }

    /// Run the first few critical handlers that have not already completed,
    /// ignoring their failures. Each is bounded by the shorter of its own
    /// timeout and the emergency handler timeout.
    async fn run_emergency(&self, handlers: &[CleanupHandler], outcome: &mut ShutdownOutcome) {
        self.set_phase(ShutdownPhase::EmergencyCleanup);
        let limit = self.settings.handler_timeout;
        let done: HashSet<String> = outcome.completed.iter().cloned().collect();
        let pending: Vec<&CleanupHandler> = handlers
            .iter()
            .filter(|h| h.critical && !done.contains(&h.name))
            .take(self.settings.emergency_handlers)
            .collect();
        for handler in pending {
            match handler.execute(handler.timeout.min(limit)).await {
                Ok(()) => outcome.completed.push(format!("{} (emergency)", handler.name)),
                Err(e) => {
                    tracing::warn!(handler = %handler.name, error = %e, "emergency handler failed, ignoring");
                    outcome.failures.push(e);
                }
            }
        }
    }

    /// Emergency cleanup from a context without a usable runtime, such as a
    /// panic hook or a destructor. Runs on a dedicated thread with its own
    /// runtime and blocks until done.
    ///
    /// Does nothing (and returns false) when a clean exit was marked,
    /// shutdown already started, or no handlers are registered.
    pub fn last_resort(self: &Arc<Self>, reason: &str) -> bool {
        if self.is_clean_exit() || self.handler_count() == 0 {
            return false;
        }
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        tracing::error!(reason, "shutdown was never initiated, running emergency cleanup");

        let coordinator = Arc::clone(self);
        let reason = reason.to_string();
        let worker = std::thread::Builder::new()
            .name("devfleet-last-resort".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        eprintln!("last-resort cleanup could not start a runtime: {}", e);
                        return;
                    }
                };
                runtime.block_on(async {
                    let handlers = coordinator.sorted_handlers();
                    let mut outcome = ShutdownOutcome {
                        reason,
                        emergency: true,
                        ..Default::default()
                    };
                    coordinator.run_emergency(&handlers, &mut outcome).await;
                    coordinator.set_phase(ShutdownPhase::Completed);
                    coordinator.completed.cancel();
                });
            });

        match worker {
            Ok(handle) => handle.join().is_ok(),
            Err(e) => {
                eprintln!("last-resort cleanup thread failed to start: {}", e);
                false
            }
        }
    }
}
