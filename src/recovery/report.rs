//! Crash reports.

use super::{
    CapturedError, DetectionMethod, DetectionResult, DiagnosisResult, RecoveryAttempt, Severity,
};
use crate::error::Result;
use crate::registry::store::atomic_write;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashReport {
    pub service_name: String,
    pub crash_id: String,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
    pub detections: Vec<DetectionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured: Option<CapturedError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<DiagnosisResult>,
    pub attempts: Vec<RecoveryAttempt>,
    pub resolved: bool,
    pub suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl CrashReport {
    pub fn new(service: impl Into<String>, detections: Vec<DetectionResult>) -> Self {
        Self {
            service_name: service.into(),
            crash_id: generate_crash_id(),
            severity: Severity::from_detections(&detections),
            detected_at: Utc::now(),
            detections,
            captured: None,
            diagnosis: None,
            attempts: Vec::new(),
            resolved: false,
            suggestions: Vec::new(),
            completed_at: None,
        }
    }

    /// Number of recovery attempts that ran.
    pub fn attempt_count(&self) -> usize {
        self.attempts.iter().map(|a| a.attempt).max().unwrap_or(0)
    }

    pub fn file_name(&self) -> String {
        format!("{}-{}.json", self.service_name, self.crash_id)
    }
}

/// `<utc timestamp>-<8 hex chars>`, sortable by time.
pub fn generate_crash_id() -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!("{}-{:08x}", Utc::now().format("%Y%m%dT%H%M%SZ"), suffix)
}

/// Manual-intervention hints for an unresolved (or resolved-with-findings)
/// incident. Always includes the generic checks.
pub fn suggestions(
    service: &str,
    detections: &[DetectionResult],
    captured: Option<&CapturedError>,
    diagnosis: Option<&DiagnosisResult>,
) -> Vec<String> {
    let mut hints = Vec::new();

    if let Some(diagnosis) = diagnosis {
        for conflict in &diagnosis.port_conflicts {
            let holders: Vec<String> = conflict
                .holders
                .iter()
                .map(|p| format!("{} (pid {})", p.name, p.pid))
                .collect();
            hints.push(format!(
                "Port {} is held by {}; stop it or give '{}' a different port",
                conflict.port,
                holders.join(", "),
                service
            ));
        }
        if !diagnosis.zombie_pids.is_empty() {
            hints.push(format!(
                "Zombie processes {:?} were found; check that the parent reaps its children",
                diagnosis.zombie_pids
            ));
        }
        for issue in &diagnosis.resource_issues {
            hints.push(format!("Resource problem detected ({}); free resources before restarting", issue));
        }
    }

    if let Some(exit) = captured.and_then(|c| c.exit.as_ref()) {
        hints.push(format!("Process exit: {}; inspect the service log", exit.describe()));
    }
    if detections
        .iter()
        .any(|d| d.is_crashed && d.method == DetectionMethod::LogPattern)
    {
        hints.push(format!("A fatal error was logged; read logs/{}.log", service));
    }

    hints.push(format!("Review the configuration of '{}' in devfleet.yaml", service));
    hints.push(format!("Check connectivity to the dependencies of '{}'", service));
    hints.push("Check available memory, disk space and file descriptors".to_string());
    hints
}

/// Reports directory, one JSON file per incident.
#[derive(Debug, Clone)]
pub struct ReportStore {
    dir: PathBuf,
}

impl ReportStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write(&self, report: &CrashReport) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(report.file_name());
        atomic_write(&path, &serde_json::to_string_pretty(report)?)?;
        Ok(path)
    }

    pub fn read(path: &Path) -> Result<CrashReport> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Every report file, oldest first. Unreadable files are skipped.
    pub fn list(&self) -> Result<Vec<CrashReport>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut reports = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path) {
                Ok(report) => reports.push(report),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable crash report"),
            }
        }
        reports.sort_by(|a, b| a.detected_at.cmp(&b.detected_at));
        Ok(reports)
    }

    pub fn for_service(&self, service: &str) -> Result<Vec<CrashReport>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.service_name == service)
            .collect())
    }
}
