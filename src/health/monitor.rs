//! Periodic probing and health state transitions.
//!
//! Each service gets its own task so a hanging endpoint only delays its own
//! next probe. Probes run without any lock; the resulting transition is
//! applied through the registry's read-modify-write.

use super::{HealthChecker, ProbeResult};
use crate::config::HealthSettings;
use crate::error::{Error, Result};
use crate::recovery::{CrashSignal, DetectionMethod, DetectionResult};
use crate::registry::{ServiceRecord, ServiceRegistry, ServiceStatus};
use crate::retry::RetryPolicy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Poll interval of the startup health wait.
const STARTUP_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ServiceStatus,
    pub to: ServiceStatus,
    pub failure_count: u32,
    /// The failure threshold was reached on this probe.
    pub crashed: bool,
}

/// Apply one probe result to `record`.
///
/// Failures during `starting` are not counted; the startup wait owns that
/// phase. From `healthy` or `unknown` a failure moves to `unhealthy`; each
/// further failure increments the counter and reaching `threshold` moves the
/// service to `stopped`. Any success restores `healthy` and clears the counter.
pub fn apply_probe(record: &mut ServiceRecord, probe: &ProbeResult, threshold: u32) -> Transition {
    let from = record.status;
    record.last_probe_ok = Some(probe.healthy);
    record.last_probe_latency_ms = Some(probe.latency.as_millis() as u64);

    let mut crashed = false;
    if !from.is_monitored() {
        // stopping / stopped: record the probe but leave the state alone
    } else if probe.healthy {
        record.status = ServiceStatus::Healthy;
        record.health_failure_count = 0;
        record.last_error = None;
    } else {
        record.last_error = Some(probe.describe());
        if from != ServiceStatus::Starting {
            record.health_failure_count += 1;
            record.status = ServiceStatus::Unhealthy;
            if record.health_failure_count >= threshold.max(1) {
                record.status = ServiceStatus::Stopped;
                crashed = true;
            }
        }
    }

    Transition {
        from,
        to: record.status,
        failure_count: record.health_failure_count,
        crashed,
    }
}

pub struct HealthMonitor {
    registry: Arc<ServiceRegistry>,
    checker: Arc<dyn HealthChecker>,
    settings: HealthSettings,
    crash_tx: Option<mpsc::UnboundedSender<CrashSignal>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        checker: Arc<dyn HealthChecker>,
        settings: HealthSettings,
    ) -> Self {
        Self {
            registry,
            checker,
            settings,
            crash_tx: None,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Report threshold crashes to the recovery manager.
    pub fn with_crash_channel(mut self, tx: mpsc::UnboundedSender<CrashSignal>) -> Self {
        self.crash_tx = Some(tx);
        self
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    /// One-shot probe without touching registry state.
    pub async fn probe(&self, name: &str) -> Result<ProbeResult> {
        let record = self
            .registry
            .get(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
        Ok(self.checker.probe(&record, self.settings.timeout).await)
    }

    /// Probe `name` once and apply the transition.
    ///
    /// Returns `None` when the record disappeared or was re-registered while
    /// the probe was in flight.
    pub async fn check_once(&self, name: &str) -> Result<Option<Transition>> {
        let Some(record) = self.registry.get(name) else {
            return Ok(None);
        };
        if !record.status.is_monitored() {
            return Ok(None);
        }

        let probe = self.checker.probe(&record, self.settings.timeout).await;
        let threshold = self.settings.failure_threshold;
        let registration_id = record.registration_id.clone();

        let transition = match self.registry.update(name, |current| {
            (current.registration_id == registration_id)
                .then(|| apply_probe(current, &probe, threshold))
        }) {
            Ok(t) => t,
            Err(Error::ServiceNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        if let Some(t) = &transition {
            if t.from != t.to {
                tracing::info!(service = %name, from = %t.from, to = %t.to, failures = t.failure_count, "health transition");
            }
            if t.crashed {
                tracing::warn!(service = %name, failures = t.failure_count, "failure threshold reached");
                self.signal_crash(name, &registration_id, &probe);
            }
        }
        Ok(transition)
    }

    fn signal_crash(&self, name: &str, registration_id: &str, probe: &ProbeResult) {
        let Some(tx) = &self.crash_tx else {
            return;
        };
        let signal = CrashSignal {
            service: name.to_string(),
            registration_id: registration_id.to_string(),
            detection: DetectionResult::crashed(
                DetectionMethod::HealthEndpoint,
                format!(
                    "{} consecutive failed probes, last: {}",
                    self.settings.failure_threshold,
                    probe.describe()
                ),
            ),
        };
        if tx.send(signal).is_err() {
            tracing::debug!(service = %name, "recovery manager is gone, crash signal dropped");
        }
    }

    /// Wait until `name` answers its first healthy probe or the startup
    /// timeout elapses. A healthy probe moves the service to `healthy`.
    ///
    /// The startup timeout bounds the whole wait, including a probe that is
    /// still in flight when it runs out.
    pub async fn wait_until_healthy(&self, name: &str) -> Result<()> {
        let startup_timeout = self.settings.startup_timeout;
        let attempts = (startup_timeout.as_millis() / STARTUP_POLL.as_millis()).max(1);
        let policy = RetryPolicy::fixed(attempts as usize, STARTUP_POLL);

        let polling = policy.run(|_| async move {
            let record = self
                .registry
                .get(name)
                .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
            let probe = self.checker.probe(&record, self.settings.timeout).await;
            if probe.healthy {
                Ok(probe)
            } else {
                Err(Error::HealthCheckFailed(name.to_string(), probe.describe()))
            }
        });
        let outcome = tokio::time::timeout(startup_timeout, polling)
            .await
            .unwrap_or_else(|_| {
                Err(Error::HealthCheckFailed(
                    name.to_string(),
                    "probe still pending".to_string(),
                ))
            });

        match outcome {
            Ok(probe) => {
                self.registry
                    .update(name, |r| apply_probe(r, &probe, self.settings.failure_threshold))?;
                Ok(())
            }
            Err(Error::HealthCheckFailed(_, last)) => Err(Error::HealthCheckFailed(
                name.to_string(),
                format!("not healthy within {:?} (last probe: {})", startup_timeout, last),
            )),
            Err(e) => Err(e),
        }
    }

    /// Probe loop for one service. Ends when cancelled or when the record is
    /// unregistered.
    pub async fn monitor_service(&self, name: String, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if self.registry.get(&name).is_none() {
                        tracing::debug!(service = %name, "no longer registered, monitor exiting");
                        break;
                    }
                    if let Err(e) = self.check_once(&name).await {
                        tracing::warn!(service = %name, error = %e, "health check cycle failed");
                    }
                }
            }
        }
    }

    /// Keep one probe task per registered service until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut reconcile = tokio::time::interval(self.settings.interval);
        reconcile.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = reconcile.tick() => self.spawn_missing(&cancel),
            }
        }

        let handles: Vec<_> = self.tasks.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            let _ = handle.await;
        }
        tracing::debug!("health monitor stopped");
    }

    fn spawn_missing(self: &Arc<Self>, cancel: &CancellationToken) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, handle| !handle.is_finished());
        for name in self.registry.names() {
            if tasks.contains_key(&name) {
                continue;
            }
            let monitor = Arc::clone(self);
            let token = cancel.child_token();
            let task_name = name.clone();
            tasks.insert(
                name,
                tokio::spawn(async move { monitor.monitor_service(task_name, token).await }),
            );
        }
    }

    /// Names with a live probe task.
    pub fn monitored(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .tasks
            .lock()
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(ok: bool) -> ProbeResult {
        if ok {
            ProbeResult::healthy(200, Duration::from_millis(3))
        } else {
            ProbeResult::failed(Some(500), Duration::from_millis(3), "HTTP 500")
        }
    }

    fn record(status: ServiceStatus) -> ServiceRecord {
        ServiceRecord::new("api", "127.0.0.1", 8080).with_status(status)
    }

    #[test]
    fn starting_failures_are_not_counted() {
        let mut rec = record(ServiceStatus::Starting);
        let t = apply_probe(&mut rec, &probe(false), 3);
        assert_eq!(t.to, ServiceStatus::Starting);
        assert_eq!(rec.health_failure_count, 0);
        assert_eq!(rec.last_probe_ok, Some(false));
    }

    #[test]
    fn threshold_moves_to_stopped() {
        let mut rec = record(ServiceStatus::Healthy);
        assert_eq!(apply_probe(&mut rec, &probe(false), 3).to, ServiceStatus::Unhealthy);
        assert_eq!(apply_probe(&mut rec, &probe(false), 3).to, ServiceStatus::Unhealthy);
        let t = apply_probe(&mut rec, &probe(false), 3);
        assert_eq!(t.to, ServiceStatus::Stopped);
        assert!(t.crashed);
        assert_eq!(t.failure_count, 3);
    }

    #[test]
    fn success_resets_counter() {
        let mut rec = record(ServiceStatus::Healthy);
        apply_probe(&mut rec, &probe(false), 3);
        apply_probe(&mut rec, &probe(false), 3);
        let t = apply_probe(&mut rec, &probe(true), 3);
        assert_eq!(t.to, ServiceStatus::Healthy);
        assert_eq!(rec.health_failure_count, 0);
        assert!(rec.last_error.is_none());
    }

    #[test]
    fn stopped_service_is_left_alone() {
        let mut rec = record(ServiceStatus::Stopped);
        let t = apply_probe(&mut rec, &probe(true), 3);
        assert_eq!(t.to, ServiceStatus::Stopped);
        assert!(!t.crashed);
    }
}
