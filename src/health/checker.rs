use crate::registry::ServiceRecord;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// Outcome of one probe. Failures are values, never errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub healthy: bool,
    pub status_code: Option<u16>,
    pub latency: Duration,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn healthy(status_code: u16, latency: Duration) -> Self {
        Self {
            healthy: true,
            status_code: Some(status_code),
            latency,
            error: None,
        }
    }

    pub fn failed(status_code: Option<u16>, latency: Duration, error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            status_code,
            latency,
            error: Some(error.into()),
        }
    }

    pub fn describe(&self) -> String {
        match (&self.error, self.status_code) {
            (Some(e), _) => e.clone(),
            (None, Some(code)) => format!("HTTP {}", code),
            (None, None) => "ok".to_string(),
        }
    }
}

/// Probe seam for the health monitor and the crash detectors.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Probe `record`, giving up after `timeout`.
    async fn probe(&self, record: &ServiceRecord, timeout: Duration) -> ProbeResult;
}
