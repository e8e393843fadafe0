//! The three crash detectors.
//!
//! Each detector produces its own [`DetectionResult`]; a crash is declared if
//! any of them reports `is_crashed`. Detectors never fail: a detector that
//! cannot observe anything reports "no crash" with an explanatory message.

use super::{DetectionMethod, DetectionResult};
use crate::health::HealthChecker;
use crate::process::ProcessSupervisor;
use crate::registry::{ServiceRecord, ServiceStatus};
use std::sync::Arc;
use std::time::Duration;

/// First `(marker, line)` pair where a line contains a marker, ignoring case.
pub fn scan_fatal_markers(lines: &[String], markers: &[String]) -> Option<(String, String)> {
    let markers: Vec<(String, &String)> = markers
        .iter()
        .filter(|m| !m.trim().is_empty())
        .map(|m| (m.to_lowercase(), m))
        .collect();

    lines.iter().find_map(|line| {
        let lowered = line.to_lowercase();
        markers
            .iter()
            .find(|(needle, _)| lowered.contains(needle.as_str()))
            .map(|(_, marker)| ((*marker).clone(), line.clone()))
    })
}

pub struct CrashDetector {
    supervisor: Arc<dyn ProcessSupervisor>,
    checker: Arc<dyn HealthChecker>,
    probe_timeout: Duration,
    log_lines: usize,
}

impl CrashDetector {
    pub fn new(
        supervisor: Arc<dyn ProcessSupervisor>,
        checker: Arc<dyn HealthChecker>,
        probe_timeout: Duration,
        log_lines: usize,
    ) -> Self {
        Self {
            supervisor,
            checker,
            probe_timeout,
            log_lines,
        }
    }

    /// Run all three detectors concurrently against `record`.
    pub async fn detect(&self, record: &ServiceRecord, markers: &[String]) -> Vec<DetectionResult> {
        let (process, health, logs) = tokio::join!(
            self.check_process(record),
            self.check_health(record),
            self.check_logs(record, markers),
        );
        vec![process, health, logs]
    }

    pub async fn check_process(&self, record: &ServiceRecord) -> DetectionResult {
        let method = DetectionMethod::ProcessMonitor;
        if let Some(exit) = self.supervisor.poll_exit(&record.name) {
            return DetectionResult::crashed(method, exit.describe());
        }
        match record.pid {
            Some(pid) if !self.supervisor.is_alive(pid) => {
                DetectionResult::crashed(method, format!("pid {} no longer exists", pid))
            }
            Some(pid) => DetectionResult::ok(method, format!("pid {} running", pid)),
            None => DetectionResult::ok(method, "no owning process"),
        }
    }

    /// Probe the health endpoint.
    ///
    /// This deliberately departs from treating every failed probe or non-200
    /// as a crash: a failure only counts once the record is already
    /// `unhealthy`. The health monitor's consecutive-failure threshold decides
    /// when that happens, so a single blip against a `healthy` or `starting`
    /// record is reported as an unconfirmed failure instead of an incident.
    pub async fn check_health(&self, record: &ServiceRecord) -> DetectionResult {
        let method = DetectionMethod::HealthEndpoint;
        let probe = self.checker.probe(record, self.probe_timeout).await;
        if probe.healthy {
            DetectionResult::ok(method, probe.describe())
        } else if record.status == ServiceStatus::Unhealthy {
            DetectionResult::crashed(method, probe.describe())
        } else {
            DetectionResult::ok(method, format!("unconfirmed failure: {}", probe.describe()))
        }
    }

    pub async fn check_logs(&self, record: &ServiceRecord, markers: &[String]) -> DetectionResult {
        let method = DetectionMethod::LogPattern;
        let lines = match self.supervisor.tail_log(&record.name, self.log_lines).await {
            Ok(lines) => lines,
            Err(e) => return DetectionResult::ok(method, format!("log unavailable: {}", e)),
        };
        match scan_fatal_markers(&lines, markers) {
            Some((marker, line)) => {
                DetectionResult::crashed(method, format!("fatal marker '{}' in log: {}", marker, line.trim()))
            }
            None => DetectionResult::ok(method, format!("{} log lines clean", lines.len())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_FATAL_MARKERS;
    use crate::health::ProbeResult;
    use crate::process::LocalSupervisor;
    use async_trait::async_trait;

    struct DownChecker;

    #[async_trait]
    impl HealthChecker for DownChecker {
        async fn probe(&self, _record: &ServiceRecord, _timeout: Duration) -> ProbeResult {
            ProbeResult::failed(Some(503), Duration::from_millis(1), "HTTP 503")
        }
    }

    fn detector(dir: &std::path::Path) -> CrashDetector {
        CrashDetector::new(
            Arc::new(LocalSupervisor::new(dir)),
            Arc::new(DownChecker),
            Duration::from_secs(1),
            50,
        )
    }

    fn defaults() -> Vec<String> {
        DEFAULT_FATAL_MARKERS.iter().map(|s| s.to_string()).collect()
    }

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn markers_match_case_insensitively() {
        let log = lines(&["starting", "Segmentation fault (core dumped)"]);
        let (marker, line) = scan_fatal_markers(&log, &defaults()).unwrap();
        assert_eq!(marker, "SEGMENTATION FAULT");
        assert_eq!(line, "Segmentation fault (core dumped)");
    }

    #[test]
    fn clean_log_has_no_match() {
        let log = lines(&["listening on :8080", "GET /health 200"]);
        assert!(scan_fatal_markers(&log, &defaults()).is_none());
    }

    #[test]
    fn custom_markers_replace_defaults() {
        let log = lines(&["panicked at src/main.rs:10", "FATAL: not matched"]);
        let custom = vec!["panicked at".to_string()];
        let (marker, _) = scan_fatal_markers(&log, &custom).unwrap();
        assert_eq!(marker, "panicked at");
        assert!(scan_fatal_markers(&lines(&["FATAL"]), &custom).is_none());
    }

    #[test]
    fn blank_markers_are_ignored() {
        let log = lines(&["anything"]);
        assert!(scan_fatal_markers(&log, &["  ".to_string()]).is_none());
    }

    #[tokio::test]
    async fn failed_health_check_is_a_crash_only_once_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let detector = detector(dir.path());

        for status in [ServiceStatus::Healthy, ServiceStatus::Starting] {
            let record = ServiceRecord::new("api", "127.0.0.1", 18080).with_status(status);
            let result = detector.check_health(&record).await;
            assert!(!result.is_crashed, "{:?} record must not be a crash", status);
            assert!(result.message.contains("unconfirmed"));
        }

        let record = ServiceRecord::new("api", "127.0.0.1", 18080).with_status(ServiceStatus::Unhealthy);
        let result = detector.check_health(&record).await;
        assert!(result.is_crashed);
        assert_eq!(result.method, DetectionMethod::HealthEndpoint);
    }
}
