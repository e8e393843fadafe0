use crate::port::PortReservation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Lifecycle status of a registered service.
///
/// ```text
/// Unknown ──► Starting ──► Healthy ◄──► Unhealthy ──► Stopped
///                │            │             │            ▲
///                └────────────┴─► Stopping ─┴────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    #[default]
    Unknown,
    Starting,
    Healthy,
    Unhealthy,
    Stopping,
    Stopped,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceStatus::Unknown => "unknown",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ServiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Ok(ServiceStatus::Unknown),
            "starting" => Ok(ServiceStatus::Starting),
            "healthy" => Ok(ServiceStatus::Healthy),
            "unhealthy" => Ok(ServiceStatus::Unhealthy),
            "stopping" => Ok(ServiceStatus::Stopping),
            "stopped" => Ok(ServiceStatus::Stopped),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

impl ServiceStatus {
    /// Check if a status transition is allowed.
    ///
    /// # Examples
    ///
    /// ```
    /// use devfleet::registry::ServiceStatus;
    ///
    /// assert!(ServiceStatus::Starting.is_valid_transition(ServiceStatus::Healthy));
    /// assert!(ServiceStatus::Unhealthy.is_valid_transition(ServiceStatus::Healthy));
    /// assert!(!ServiceStatus::Stopped.is_valid_transition(ServiceStatus::Healthy));
    /// ```
    pub fn is_valid_transition(&self, to: ServiceStatus) -> bool {
        use ServiceStatus::*;
        match (self, to) {
            // Externally observed services start out unknown
            (Unknown, _) => true,

            (Starting, Healthy | Unhealthy | Stopping | Stopped) => true,

            (Healthy, Unhealthy | Stopping | Stopped) => true,
            (Unhealthy, Healthy | Stopping | Stopped) => true,

            (Stopping, Stopped) => true,

            // Restart after stop or crash
            (Stopped, Starting | Stopping) => true,

            (s1, s2) if *s1 == s2 => true,

            _ => false,
        }
    }

    /// Whether the health monitor should keep probing a service in this state.
    pub fn is_monitored(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Unknown
                | ServiceStatus::Starting
                | ServiceStatus::Healthy
                | ServiceStatus::Unhealthy
        )
    }
}

/// One managed unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub health_path: String,
    /// Absent for externally observed services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default)]
    pub status: ServiceStatus,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Assigned by the registry on every registration.
    #[serde(default)]
    pub registration_id: String,
    #[serde(default)]
    pub health_failure_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_latency_ms: Option<u64>,
    /// Outcome of the most recent probe, `None` before the first one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_ok: Option<bool>,
    pub started_at: DateTime<Utc>,
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            protocol: "http".to_string(),
            health_path: "/health".to_string(),
            pid: None,
            status: ServiceStatus::Unknown,
            dependencies: BTreeSet::new(),
            registration_id: String::new(),
            health_failure_count: 0,
            last_error: None,
            last_probe_latency_ms: None,
            last_probe_ok: None,
            started_at: Utc::now(),
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_status(mut self, status: ServiceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = path.into();
        self
    }

    /// URL probed by the health monitor. A wildcard host is probed on loopback.
    pub fn health_url(&self) -> String {
        let host = match self.host.as_str() {
            "0.0.0.0" | "" => "127.0.0.1",
            "::" | "[::]" => "[::1]",
            h => h,
        };
        format!("{}://{}:{}{}", self.protocol, host, self.port, self.health_path)
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.started_at)
    }
}

/// Generate an opaque registration token.
pub fn generate_registration_id() -> String {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    let high: u64 = rng.gen();
    let low: u64 = rng.gen();
    format!("reg-{:016x}{:016x}", high, low)
}

/// `services.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesFile {
    pub timestamp: DateTime<Utc>,
    pub services: Vec<ServiceRecord>,
}

/// `ports.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortsFile {
    pub timestamp: DateTime<Utc>,
    pub allocations: BTreeMap<u16, PortReservation>,
}

/// `dependencies.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependenciesFile {
    pub timestamp: DateTime<Utc>,
    pub graph: BTreeMap<String, BTreeSet<String>>,
}

/// Point-in-time copy of everything the registry persists.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub timestamp: DateTime<Utc>,
    pub services: Vec<ServiceRecord>,
    pub ports: Vec<PortReservation>,
    pub graph: BTreeMap<String, BTreeSet<String>>,
}
