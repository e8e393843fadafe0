//! Crash detection and recovery.
//!
//! - `detect` - the three independent crash detectors
//! - `stages` - the four recovery stages and the environment they act on
//! - `report` - crash reports and their on-disk store
//! - `manager` - incident handling, backoff and the detection loop
//!
//! A crash incident always ends with exactly one persisted [`CrashReport`],
//! whether or not the service came back.

pub mod detect;
mod manager;
pub mod report;
pub mod stages;

pub use detect::{scan_fatal_markers, CrashDetector};
pub use manager::RecoveryManager;
pub use report::{CrashReport, ReportStore};
pub use stages::{LocalEnvironment, RecoveryEnvironment};

use crate::port::ProcessInfo;
use crate::process::ExitInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    ProcessMonitor,
    HealthEndpoint,
    LogPattern,
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DetectionMethod::ProcessMonitor => "process_monitor",
            DetectionMethod::HealthEndpoint => "health_endpoint",
            DetectionMethod::LogPattern => "log_pattern",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub method: DetectionMethod,
    pub is_crashed: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl DetectionResult {
    pub fn ok(method: DetectionMethod, message: impl Into<String>) -> Self {
        Self {
            method,
            is_crashed: false,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn crashed(method: DetectionMethod, message: impl Into<String>) -> Self {
        Self {
            is_crashed: true,
            ..Self::ok(method, message)
        }
    }
}

/// A crash reported by another component, e.g. the health monitor reaching
/// its failure threshold.
#[derive(Debug, Clone)]
pub struct CrashSignal {
    pub service: String,
    /// Registration the crash was observed on. Signals for an older
    /// registration are ignored.
    pub registration_id: String,
    pub detection: DetectionResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Severity implied by what detected the crash.
    pub fn from_detections(detections: &[DetectionResult]) -> Self {
        detections
            .iter()
            .filter(|d| d.is_crashed)
            .map(|d| match d.method {
                DetectionMethod::LogPattern => Severity::Critical,
                DetectionMethod::ProcessMonitor => Severity::High,
                DetectionMethod::HealthEndpoint => Severity::Medium,
            })
            .max()
            .unwrap_or(Severity::Low)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStage {
    ErrorCapture,
    Diagnose,
    RecoveryAttempt,
    Fallback,
}

impl fmt::Display for RecoveryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryStage::ErrorCapture => "error_capture",
            RecoveryStage::Diagnose => "diagnose",
            RecoveryStage::RecoveryAttempt => "recovery_attempt",
            RecoveryStage::Fallback => "fallback",
        };
        f.write_str(s)
    }
}

/// Output of the error capture stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedError {
    pub exit: Option<ExitInfo>,
    pub last_error: Option<String>,
    pub log_tail: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConflict {
    pub port: u16,
    pub holders: Vec<ProcessInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosisResult {
    pub port_conflicts: Vec<PortConflict>,
    pub zombie_pids: Vec<u32>,
    pub resource_issues: Vec<String>,
}

impl DiagnosisResult {
    pub fn is_clean(&self) -> bool {
        self.port_conflicts.is_empty() && self.zombie_pids.is_empty() && self.resource_issues.is_empty()
    }
}

/// One executed stage of one recovery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub attempt: usize,
    pub stage: RecoveryStage,
    pub actions: Vec<String>,
    pub success: bool,
    pub duration_ms: u64,
}
