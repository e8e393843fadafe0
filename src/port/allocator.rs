use super::{class_range, conflict, PortRange, PortReservation, ProcessInfo};
use crate::config::ServiceClass;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::time::Duration;

/// Retries for a preferred port that is briefly stuck in TIME_WAIT.
const BIND_RETRIES: usize = 3;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(50);
/// Ephemeral binds that collide with a soft reservation are retried this often.
const EPHEMERAL_ATTEMPTS: usize = 8;

#[derive(Default)]
struct AllocatorState {
    reservations: HashMap<u16, PortReservation>,
    /// Listeners keeping hard reservations bound until handoff.
    listeners: HashMap<u16, TcpListener>,
}

impl AllocatorState {
    fn port_of(&self, service: &str) -> Option<u16> {
        self.reservations
            .values()
            .find(|r| r.owner_service == service)
            .map(|r| r.port)
    }
}

/// Port allocator with a single lock around check-and-reserve.
///
/// The availability check *is* the bind: a candidate is bound on `bind_host`
/// (the same interface the service will listen on) and the listener is kept
/// until [`handoff`](Self::handoff). The lock is never held across an await;
/// retry delays sleep outside of it and re-check the reservation table.
pub struct PortAllocator {
    bind_host: IpAddr,
    state: Mutex<AllocatorState>,
}

enum Claim {
    Reserved(u16),
    /// Another service holds it in our table. Not worth retrying.
    Taken,
    /// The OS refused the bind. May clear after TIME_WAIT.
    Busy(std::io::Error),
}

impl PortAllocator {
    pub fn new(bind_host: IpAddr) -> Self {
        Self {
            bind_host,
            state: Mutex::new(AllocatorState::default()),
        }
    }

    pub fn bind_host(&self) -> IpAddr {
        self.bind_host
    }

    /// Allocate a port for `service`.
    ///
    /// Order: `preferred`, then `range` ascending, then the class range, then
    /// an OS-assigned ephemeral port. Calling again for a service that already
    /// holds a reservation returns the same port.
    #[tracing::instrument(skip(self), fields(service.name = %service))]
    pub async fn allocate(
        &self,
        service: &str,
        preferred: Option<u16>,
        range: Option<PortRange>,
        class: ServiceClass,
    ) -> Result<u16> {
        if let Some(port) = self.state.lock().port_of(service) {
            return Ok(port);
        }

        if let Some(port) = preferred {
            let policy = RetryPolicy::fixed(BIND_RETRIES, BIND_RETRY_DELAY);
            let outcome = policy
                .run(|_| async move {
                    match self.try_claim(service, port) {
                        Claim::Reserved(p) => Ok(Some(p)),
                        Claim::Taken => Ok(None),
                        Claim::Busy(e) => Err(e),
                    }
                })
                .await;
            match outcome {
                Ok(Some(p)) => return Ok(p),
                Ok(None) => tracing::debug!(port, "preferred port reserved by another service"),
                Err(e) => tracing::debug!(port, error = %e, "preferred port unavailable"),
            }
        }

        let fallback = class_range(class);
        let candidates = range
            .into_iter()
            .chain(std::iter::once(fallback))
            .flat_map(|r| r.ports())
            .filter(|p| Some(*p) != preferred);

        for port in candidates {
            if let Claim::Reserved(p) = self.try_claim(service, port) {
                if matches!(range, Some(r) if !r.contains(p)) {
                    tracing::info!(port = p, %class, "service range exhausted, using class range");
                }
                return Ok(p);
            }
        }

        tracing::warn!("no port free in configured ranges, falling back to an ephemeral port");
        self.claim_ephemeral(service)
    }

    /// Check-and-reserve for one candidate. Runs entirely under the lock.
    fn try_claim(&self, service: &str, port: u16) -> Claim {
        let mut state = self.state.lock();
        if let Some(existing) = state.port_of(service) {
            return Claim::Reserved(existing);
        }
        if state.reservations.contains_key(&port) {
            return Claim::Taken;
        }
        match TcpListener::bind(SocketAddr::new(self.bind_host, port)) {
            Ok(listener) => {
                Self::insert(&mut state, service, port, Some(listener));
                Claim::Reserved(port)
            }
            Err(e) => Claim::Busy(e),
        }
    }

    fn claim_ephemeral(&self, service: &str) -> Result<u16> {
        let mut last_error = String::from("no ephemeral port assigned");
        for _ in 0..EPHEMERAL_ATTEMPTS {
            let mut state = self.state.lock();
            let listener = TcpListener::bind(SocketAddr::new(self.bind_host, 0)).map_err(|e| {
                Error::PortAllocation {
                    service: service.to_string(),
                    reason: format!("ephemeral bind on {} failed: {}", self.bind_host, e),
                }
            })?;
            let port = listener.local_addr()?.port();
            if state.reservations.contains_key(&port) {
                last_error = format!("OS assigned port {} which is already reserved", port);
                continue;
            }
            Self::insert(&mut state, service, port, Some(listener));
            return Ok(port);
        }
        Err(Error::PortAllocation {
            service: service.to_string(),
            reason: last_error,
        })
    }

    fn insert(state: &mut AllocatorState, service: &str, port: u16, listener: Option<TcpListener>) {
        let hard = listener.is_some();
        if let Some(listener) = listener {
            state.listeners.insert(port, listener);
        }
        state.reservations.insert(
            port,
            PortReservation {
                port,
                owner_service: service.to_string(),
                reserved_at: Utc::now(),
                reserved: hard,
            },
        );
        tracing::debug!(port, service, hard, "port reserved");
    }

    /// Drop the held listener so the owning service can bind the port.
    /// The reservation itself stays in place.
    pub fn handoff(&self, port: u16) {
        if self.state.lock().listeners.remove(&port).is_some() {
            tracing::debug!(port, "listener released for handoff");
        }
    }

    /// Record a port the service already owns (e.g. restored from the persisted
    /// registry). Fails if another service holds it.
    pub fn adopt(&self, service: &str, port: u16) -> Result<()> {
        let mut state = self.state.lock();
        match state.reservations.get(&port) {
            Some(existing) if existing.owner_service != service => Err(Error::PortConflict {
                port,
                owner: existing.owner_service.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                Self::insert(&mut state, service, port, None);
                Ok(())
            }
        }
    }

    /// Remove the reservation. The OS may keep the socket in TIME_WAIT, so the
    /// port is not guaranteed to be immediately bindable again.
    pub fn release(&self, port: u16) -> Option<PortReservation> {
        let mut state = self.state.lock();
        state.listeners.remove(&port);
        let released = state.reservations.remove(&port);
        if let Some(r) = &released {
            tracing::debug!(port, service = %r.owner_service, "port released");
        }
        released
    }

    pub fn release_service(&self, service: &str) -> Option<PortReservation> {
        let port = self.state.lock().port_of(service)?;
        self.release(port)
    }

    pub fn release_all(&self) {
        let mut state = self.state.lock();
        state.listeners.clear();
        state.reservations.clear();
    }

    pub fn reservation_for(&self, service: &str) -> Option<PortReservation> {
        let state = self.state.lock();
        let port = state.port_of(service)?;
        state.reservations.get(&port).cloned()
    }

    pub fn owner_of(&self, port: u16) -> Option<String> {
        self.state
            .lock()
            .reservations
            .get(&port)
            .map(|r| r.owner_service.clone())
    }

    /// All reservations ordered by port.
    pub fn reservations(&self) -> Vec<PortReservation> {
        let mut all: Vec<_> = self.state.lock().reservations.values().cloned().collect();
        all.sort_by_key(|r| r.port);
        all
    }

    /// Whether something is listening on `port` on the allocator's interface.
    /// Ports whose listener we still hold count as bound.
    pub fn is_port_bound(&self, port: u16) -> bool {
        if self.state.lock().listeners.contains_key(&port) {
            return true;
        }
        TcpListener::bind(SocketAddr::new(self.bind_host, port)).is_err()
    }

    /// Best-effort identification of the processes listening on `port`.
    pub fn find_owning_process(&self, port: u16) -> Vec<ProcessInfo> {
        conflict::find_owning_processes(port)
    }
}

impl Drop for PortAllocator {
    fn drop(&mut self) {
        self.release_all();
    }
}
