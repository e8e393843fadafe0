use super::duration::{serde_duration, serde_duration_list};
use super::service::ServiceConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Fatal log markers used by the log-pattern crash detector when neither the
/// recovery section nor the service overrides them.
pub const DEFAULT_FATAL_MARKERS: &[&str] = &[
    "FATAL",
    "CRITICAL ERROR",
    "SEGMENTATION FAULT",
    "OUT OF MEMORY",
    "STACK OVERFLOW",
    "ACCESS VIOLATION",
];

/// Root of `devfleet.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding registry files, logs, crash reports and backups.
    /// Relative paths are resolved against the working directory.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Interface used for both the availability check and the reservation bind.
    #[serde(default = "default_bind_host")]
    pub bind_host: IpAddr,

    #[serde(default)]
    pub health: HealthSettings,

    #[serde(default)]
    pub registry: RegistrySettings,

    #[serde(default)]
    pub recovery: RecoverySettings,

    #[serde(default)]
    pub shutdown: ShutdownSettings,

    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            bind_host: default_bind_host(),
            health: HealthSettings::default(),
            registry: RegistrySettings::default(),
            recovery: RecoverySettings::default(),
            shutdown: ShutdownSettings::default(),
            services: BTreeMap::new(),
        }
    }
}

impl Config {
    /// `state_dir` resolved against `work_dir`.
    pub fn state_path(&self, work_dir: &std::path::Path) -> PathBuf {
        if self.state_dir.is_absolute() {
            self.state_dir.clone()
        } else {
            work_dir.join(&self.state_dir)
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".devfleet")
}

fn default_bind_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    #[serde(with = "serde_duration")]
    pub interval: Duration,
    #[serde(with = "serde_duration")]
    pub timeout: Duration,
    pub failure_threshold: u32,
    /// How long `start` waits for the first healthy probe.
    #[serde(with = "serde_duration")]
    pub startup_timeout: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(5),
            failure_threshold: 3,
            startup_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    #[serde(with = "serde_duration")]
    pub sweep_interval: Duration,
    #[serde(with = "serde_duration")]
    pub integrity_interval: Duration,
    #[serde(with = "serde_duration")]
    pub ttl: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            integrity_interval: Duration::from_secs(60),
            ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    pub enabled: bool,
    /// Delay waited before each recovery attempt. Its length is the attempt budget.
    #[serde(with = "serde_duration_list")]
    pub backoff: Vec<Duration>,
    #[serde(with = "serde_duration")]
    pub stage_timeout: Duration,
    /// Log lines snapshotted by the error-capture stage.
    pub capture_lines: usize,
    /// Log lines scanned by the log-pattern detector.
    pub detection_lines: usize,
    #[serde(with = "serde_duration")]
    pub monitor_interval: Duration,
    pub fatal_markers: Vec<String>,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            backoff: vec![
                Duration::from_secs(5),
                Duration::from_secs(15),
                Duration::from_secs(45),
            ],
            stage_timeout: Duration::from_secs(30),
            capture_lines: 100,
            detection_lines: 50,
            monitor_interval: Duration::from_secs(10),
            fatal_markers: DEFAULT_FATAL_MARKERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSettings {
    /// Budget measured from shutdown start after which emergency cleanup is forced.
    #[serde(with = "serde_duration")]
    pub emergency_timeout: Duration,
    /// How many critical handlers emergency cleanup runs.
    pub emergency_handlers: usize,
    #[serde(with = "serde_duration")]
    pub handler_timeout: Duration,
    /// Grace period between the graceful tree signal and the forced kill.
    #[serde(with = "serde_duration")]
    pub stop_grace: Duration,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            emergency_timeout: Duration::from_secs(30),
            emergency_handlers: 3,
            handler_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(5),
        }
    }
}
