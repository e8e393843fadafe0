// Allow unused_assignments at module level because thiserror's generated code
// for struct variants triggers false positive warnings - the fields ARE used
// in the Display impl but rustc's lint pass doesn't see this.
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::io;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    #[diagnostic(
        code(devfleet::config::error),
        help("Run `devfleet validate` to check devfleet.yaml")
    )]
    Config(String),

    #[error("Invalid configuration: {0}")]
    #[diagnostic(code(devfleet::config::validation))]
    Validation(String),

    #[error("Invalid port range {start}-{end}: {reason}")]
    #[diagnostic(
        code(devfleet::port::invalid_range),
        help("Port ranges must satisfy 1 <= start <= end <= 65535")
    )]
    InvalidPortRange { start: u32, end: u32, reason: String },

    #[error("Circular dependency detected among: {}", .0.join(", "))]
    #[diagnostic(
        code(devfleet::dependency::circular),
        help("Services cannot depend on each other in a cycle. Review the depends_on fields")
    )]
    CircularDependency(Vec<String>),

    #[error("Port allocation failed for '{service}': {reason}")]
    #[diagnostic(
        code(devfleet::port::allocation_failed),
        help("Widen the service's port_range or stop whatever is holding the ports")
    )]
    PortAllocation { service: String, reason: String },

    #[error("Port {port} is already owned by service '{owner}'")]
    #[diagnostic(
        code(devfleet::port::conflict),
        help("Two live services can never share a port. Unregister '{owner}' first or pick another port")
    )]
    PortConflict { port: u16, owner: String },

    #[error("Registry file '{path}' is corrupted: {reason}")]
    #[diagnostic(code(devfleet::registry::corrupted))]
    RegistryCorruption { path: String, reason: String },

    #[error("Service not found: {0}")]
    #[diagnostic(
        code(devfleet::service::not_found),
        help("Check registered services with `devfleet status`")
    )]
    ServiceNotFound(String),

    #[error("Service '{0}' failed to start: {1}")]
    #[diagnostic(
        code(devfleet::service::start_failed),
        help("Check the service log under <state_dir>/logs/{0}.log")
    )]
    ServiceStartFailed(String, String),

    #[error("Service '{0}' health check failed: {1}")]
    #[diagnostic(code(devfleet::service::health_check_failed))]
    HealthCheckFailed(String, String),

    #[error("Process error: {0}")]
    #[diagnostic(code(devfleet::process::error))]
    Process(String),

    #[error("Invalid PID {pid}: {reason}")]
    InvalidPid { pid: u32, reason: String },

    #[error("Cleanup handler '{name}' failed: {reason}")]
    #[diagnostic(code(devfleet::shutdown::handler_failed))]
    ShutdownHandler { name: String, reason: String },

    #[error("Timeout after {1:?} waiting for {0}")]
    Timeout(String, std::time::Duration),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::CircularDependency(names) => Some(format!(
                "Break the cycle by removing one of the depends_on entries between: {}",
                names.join(", ")
            )),
            Error::PortAllocation { service, .. } => Some(format!(
                "No port was free for '{}'. Widen its port_range or free ports with `devfleet down`.",
                service
            )),
            Error::PortConflict { port, owner } => Some(format!(
                "Port {} belongs to '{}'. Stop it with `devfleet down` or choose another port.",
                port, owner
            )),
            Error::InvalidPortRange { .. } => {
                Some("Port ranges are written as [start, end] with 1 <= start <= end <= 65535.".to_string())
            }
            Error::ServiceNotFound(name) => Some(format!(
                "'{}' is not registered. Check `devfleet status` for known services.",
                name
            )),
            Error::ServiceStartFailed(name, _) | Error::HealthCheckFailed(name, _) => Some(format!(
                "Inspect <state_dir>/logs/{}.log and verify the health_path in devfleet.yaml.",
                name
            )),
            Error::Config(_) | Error::Validation(_) => {
                Some("Validate your config with: devfleet validate".to_string())
            }
            _ => None,
        }
    }

    /// Formats the error with its suggestion (if any) for user-friendly display.
    pub fn with_suggestion(&self) -> String {
        match self.suggestion() {
            Some(suggestion) => format!("{}\n\nHint: {}", self, suggestion),
            None => self.to_string(),
        }
    }

    /// Whether this error belongs to the fatal configuration class.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::Validation(_)
                | Error::InvalidPortRange { .. }
                | Error::CircularDependency(_)
        )
    }
}

/// Validates a PID before it is used for signalling.
/// Rejects PID 0 (process group), PID 1 (init) and values > i32::MAX.
pub fn validate_pid(pid: u32, service_name: &str) -> Result<u32> {
    if pid == 0 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "PID 0 is invalid for service '{}' (refers to process group, not a process)",
                service_name
            ),
        });
    }
    if pid == 1 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "refusing to operate on PID 1 (init) for service '{}'",
                service_name
            ),
        });
    }
    if pid > i32::MAX as u32 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "PID {} exceeds i32::MAX for service '{}', cannot convert safely",
                pid, service_name
            ),
        });
    }
    Ok(pid)
}

/// Same as validate_pid but allows PID 1 for read-only existence checks.
pub fn validate_pid_for_check(pid: u32) -> Option<u32> {
    if pid == 0 || pid > i32::MAX as u32 {
        return None;
    }
    Some(pid)
}
