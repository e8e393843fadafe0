//! Staleness reaping and integrity sweeps.

use super::{ServiceRecord, ServiceRegistry, ServiceStatus};
use crate::config::RegistrySettings;
use crate::port::PortAllocator;
use crate::process::ProcessSupervisor;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Live checks used to confirm staleness.
pub trait Liveness: Send + Sync {
    fn pid_alive(&self, pid: u32) -> bool;
    fn port_bound(&self, port: u16) -> bool;
}

/// Liveness backed by the process supervisor and the allocator's interface.
pub struct SystemLiveness {
    supervisor: Arc<dyn ProcessSupervisor>,
    allocator: Arc<PortAllocator>,
}

impl SystemLiveness {
    pub fn new(supervisor: Arc<dyn ProcessSupervisor>, allocator: Arc<PortAllocator>) -> Self {
        Self {
            supervisor,
            allocator,
        }
    }
}

impl Liveness for SystemLiveness {
    fn pid_alive(&self, pid: u32) -> bool {
        self.supervisor.is_alive(pid)
    }

    fn port_bound(&self, port: u16) -> bool {
        self.allocator.is_port_bound(port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapReason {
    PidExited(u32),
    PortNotBound(u16),
    ExpiredAfterFailedProbe,
}

impl fmt::Display for ReapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReapReason::PidExited(pid) => write!(f, "owning pid {} no longer exists", pid),
            ReapReason::PortNotBound(port) => write!(f, "port {} is no longer bound", port),
            ReapReason::ExpiredAfterFailedProbe => write!(f, "ttl expired and last probe failed"),
        }
    }
}

pub struct StalenessReaper {
    registry: Arc<ServiceRegistry>,
    liveness: Arc<dyn Liveness>,
    ttl: Duration,
}

impl StalenessReaper {
    pub fn new(registry: Arc<ServiceRegistry>, liveness: Arc<dyn Liveness>, ttl: Duration) -> Self {
        Self {
            registry,
            liveness,
            ttl,
        }
    }

    /// Decide whether `record` is stale. Every positive answer rests on a
    /// live check; age alone never qualifies.
    ///
    /// - a recorded pid that no longer exists
    /// - a port that is no longer bound, once the service has passed startup
    /// - an expired ttl combined with a failed last probe and an unbound port
    ///
    /// A live pid behind a bound port is never stale.
    pub fn staleness(&self, record: &ServiceRecord) -> Option<ReapReason> {
        if let Some(pid) = record.pid {
            if !self.liveness.pid_alive(pid) {
                return Some(ReapReason::PidExited(pid));
            }
        }

        let past_startup = matches!(
            record.status,
            ServiceStatus::Healthy | ServiceStatus::Unhealthy
        );
        let bound = self.liveness.port_bound(record.port);
        if past_startup && !bound {
            return Some(ReapReason::PortNotBound(record.port));
        }

        let expired = record
            .age(Utc::now())
            .to_std()
            .map_or(false, |age| age > self.ttl);
        if expired && record.last_probe_ok == Some(false) && !bound {
            return Some(ReapReason::ExpiredAfterFailedProbe);
        }

        None
    }

    /// One pass over the registry. Returns the reaped records.
    ///
    /// Checks run on a snapshot without the registry lock; removal goes
    /// through `unregister_if` so a record re-registered or put into recovery
    /// meanwhile survives. Services with a crash incident in progress are
    /// skipped: their dead pid is expected until the restart.
    pub fn sweep(&self) -> Vec<(ServiceRecord, ReapReason)> {
        let mut reaped = Vec::new();
        for record in self.registry.list(None) {
            if self.registry.is_recovering(&record.name) {
                continue;
            }
            let Some(reason) = self.staleness(&record) else {
                continue;
            };
            match self.registry.unregister_if(&record.name, &record.registration_id) {
                Ok(Some(removed)) => {
                    tracing::info!(service = %removed.name, %reason, "reaped stale registry entry");
                    reaped.push((removed, reason));
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(service = %record.name, error = %e, "failed to reap entry"),
            }
        }
        reaped
    }

    /// Background loop running staleness and integrity sweeps until cancelled.
    pub async fn run(self, settings: RegistrySettings, cancel: CancellationToken) {
        let mut sweep = tokio::time::interval(settings.sweep_interval);
        let mut integrity = tokio::time::interval(settings.integrity_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        integrity.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First ticks fire immediately; the registry was just loaded
        sweep.tick().await;
        integrity.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("registry sweeps stopped");
                    break;
                }
                _ = sweep.tick() => {
                    let reaped = self.sweep();
                    if !reaped.is_empty() {
                        tracing::debug!(count = reaped.len(), "staleness sweep finished");
                    }
                }
                _ = integrity.tick() => {
                    if let Err(e) = self.registry.check_integrity() {
                        tracing::warn!(error = %e, "integrity sweep failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr};

    #[derive(Default)]
    struct FakeLiveness {
        dead_pids: Mutex<HashSet<u32>>,
        unbound_ports: Mutex<HashSet<u16>>,
    }

    impl Liveness for FakeLiveness {
        fn pid_alive(&self, pid: u32) -> bool {
            !self.dead_pids.lock().contains(&pid)
        }
        fn port_bound(&self, port: u16) -> bool {
            !self.unbound_ports.lock().contains(&port)
        }
    }

    fn setup(ttl: Duration) -> (tempfile::TempDir, Arc<ServiceRegistry>, Arc<FakeLiveness>, StalenessReaper) {
        let dir = tempfile::tempdir().unwrap();
        let allocator = Arc::new(PortAllocator::new(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        let registry = Arc::new(ServiceRegistry::new(dir.path(), allocator));
        let liveness = Arc::new(FakeLiveness::default());
        let reaper = StalenessReaper::new(registry.clone(), liveness.clone(), ttl);
        (dir, registry, liveness, reaper)
    }

    #[test]
    fn starting_service_without_listener_is_kept() {
        let (_dir, registry, liveness, reaper) = setup(Duration::from_secs(3600));
        registry
            .register(ServiceRecord::new("api", "127.0.0.1", 18001).with_pid(4000).with_status(ServiceStatus::Starting))
            .unwrap();
        liveness.unbound_ports.lock().insert(18001);

        assert!(reaper.sweep().is_empty());
    }

    #[test]
    fn healthy_service_whose_port_closed_is_reaped() {
        let (_dir, registry, liveness, reaper) = setup(Duration::from_secs(3600));
        registry
            .register(ServiceRecord::new("api", "127.0.0.1", 18001).with_pid(4000).with_status(ServiceStatus::Healthy))
            .unwrap();
        liveness.unbound_ports.lock().insert(18001);

        let reaped = reaper.sweep();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].1, ReapReason::PortNotBound(18001));
    }

    #[test]
    fn expired_pidless_record_needs_a_failed_probe() {
        let (_dir, registry, liveness, reaper) = setup(Duration::ZERO);
        let mut record = ServiceRecord::new("ext", "127.0.0.1", 18002).with_status(ServiceStatus::Starting);
        record.started_at = Utc::now() - chrono::Duration::hours(2);
        registry.register(record).unwrap();
        liveness.unbound_ports.lock().insert(18002);
        assert!(reaper.sweep().is_empty());

        registry.update("ext", |r| r.last_probe_ok = Some(false)).unwrap();
        let reaped = reaper.sweep();
        assert_eq!(reaped[0].1, ReapReason::ExpiredAfterFailedProbe);
    }

    #[test]
    fn live_pid_stuck_starting_with_failing_health_expires() {
        let (_dir, registry, liveness, reaper) = setup(Duration::from_secs(60));
        let mut record = ServiceRecord::new("api", "127.0.0.1", 18003)
            .with_pid(4100)
            .with_status(ServiceStatus::Starting);
        record.started_at = Utc::now() - chrono::Duration::hours(2);
        record.last_probe_ok = Some(false);
        registry.register(record).unwrap();

        // Still listening: the live pid and port keep it
        assert!(reaper.sweep().is_empty());

        liveness.unbound_ports.lock().insert(18003);
        let reaped = reaper.sweep();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].1, ReapReason::ExpiredAfterFailedProbe);
    }

    #[test]
    fn failing_health_within_ttl_is_kept() {
        let (_dir, registry, liveness, reaper) = setup(Duration::from_secs(3600));
        let mut record = ServiceRecord::new("api", "127.0.0.1", 18004)
            .with_pid(4200)
            .with_status(ServiceStatus::Starting);
        record.last_probe_ok = Some(false);
        registry.register(record).unwrap();
        liveness.unbound_ports.lock().insert(18004);

        assert!(reaper.sweep().is_empty());
    }

    #[test]
    fn service_in_recovery_is_not_reaped() {
        let (_dir, registry, liveness, reaper) = setup(Duration::from_secs(3600));
        registry
            .register(ServiceRecord::new("db", "127.0.0.1", 18005).with_pid(4300).with_status(ServiceStatus::Stopped))
            .unwrap();
        liveness.dead_pids.lock().insert(4300);

        assert!(registry.begin_recovery("db"));
        assert!(reaper.sweep().is_empty());
        assert!(registry.allocator().owner_of(18005).is_some());

        registry.end_recovery("db");
        assert_eq!(reaper.sweep()[0].1, ReapReason::PidExited(4300));
    }
}
