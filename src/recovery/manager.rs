use super::detect::CrashDetector;
use super::report::{self, CrashReport, ReportStore};
use super::stages::RecoveryEnvironment;
use super::{
    CapturedError, CrashSignal, DetectionResult, DiagnosisResult, RecoveryAttempt, RecoveryStage,
};
use crate::config::RecoverySettings;
use crate::error::Result;
use crate::registry::{ServiceRegistry, ServiceStatus};
use crate::retry::{Attempt, RetryPolicy};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Everything the stages produced so far for one incident.
#[derive(Default)]
struct IncidentLog {
    captured: Option<CapturedError>,
    diagnosis: Option<DiagnosisResult>,
    attempts: Vec<RecoveryAttempt>,
    interrupted: bool,
}

/// Marks a service as having an incident in progress until dropped. The
/// mark lives in the registry so the staleness reaper leaves the record alone.
struct ActiveIncident<'a> {
    registry: &'a ServiceRegistry,
    service: String,
}

impl<'a> ActiveIncident<'a> {
    fn acquire(registry: &'a ServiceRegistry, service: &str) -> Option<Self> {
        registry.begin_recovery(service).then(|| Self {
            registry,
            service: service.to_string(),
        })
    }
}

impl Drop for ActiveIncident<'_> {
    fn drop(&mut self) {
        self.registry.end_recovery(&self.service);
    }
}

/// Runs crash incidents: detection, the four recovery stages with backoff
/// between attempts, and the final report.
pub struct RecoveryManager {
    registry: Arc<ServiceRegistry>,
    env: Arc<dyn RecoveryEnvironment>,
    detector: Option<CrashDetector>,
    reports: ReportStore,
    settings: RecoverySettings,
    service_markers: BTreeMap<String, Vec<String>>,
}

impl RecoveryManager {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        env: Arc<dyn RecoveryEnvironment>,
        reports: ReportStore,
        settings: RecoverySettings,
    ) -> Self {
        Self {
            registry,
            env,
            detector: None,
            reports,
            settings,
            service_markers: BTreeMap::new(),
        }
    }

    /// Enable the periodic per-service detection loop in [`run`](Self::run).
    pub fn with_detector(mut self, detector: CrashDetector) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Per-service fatal marker overrides.
    pub fn with_service_markers(mut self, markers: BTreeMap<String, Vec<String>>) -> Self {
        self.service_markers = markers;
        self
    }

    pub fn markers_for(&self, service: &str) -> &[String] {
        self.service_markers
            .get(service)
            .unwrap_or(&self.settings.fatal_markers)
    }

    pub fn reports(&self) -> &ReportStore {
        &self.reports
    }

    pub fn is_recovering(&self, service: &str) -> bool {
        self.registry.is_recovering(service)
    }

    fn policy(&self) -> RetryPolicy {
        if self.settings.enabled {
            RetryPolicy::schedule(self.settings.backoff.iter().copied())
        } else {
            RetryPolicy::schedule([])
        }
    }

    /// Run the detectors once. Returns every result if any reported a crash.
    pub async fn detect(&self, service: &str) -> Option<Vec<DetectionResult>> {
        let detector = self.detector.as_ref()?;
        let record = self.registry.get(service)?;
        let results = detector.detect(&record, self.markers_for(service)).await;
        results.iter().any(|d| d.is_crashed).then_some(results)
    }

    /// Handle one crash incident and persist its report.
    ///
    /// Returns `None` without doing anything when an incident for `service`
    /// is already running. Cancelling `cancel` stops further attempts; the
    /// report is still written. An unresolved incident leaves the service
    /// `stopped` with no process behind it.
    #[tracing::instrument(skip(self, detections, cancel), fields(service.name = %service))]
    pub async fn handle_crash(
        &self,
        service: &str,
        detections: Vec<DetectionResult>,
        cancel: &CancellationToken,
    ) -> Result<Option<CrashReport>> {
        let Some(_incident) = ActiveIncident::acquire(&self.registry, service) else {
            tracing::debug!("incident already in progress");
            return Ok(None);
        };

        for detection in detections.iter().filter(|d| d.is_crashed) {
            tracing::warn!(method = %detection.method, message = %detection.message, "crash detected");
        }
        self.mark_stopped(service);

        let log = Mutex::new(IncidentLog::default());
        let resolved = tokio::select! {
            resolved = self.recover(service, &log) => resolved,
            _ = cancel.cancelled() => {
                log.lock().interrupted = true;
                false
            }
        };
        if !resolved {
            self.abandon(service).await;
        }

        let report = self.finish_report(service, detections, log.into_inner(), resolved);
        let path = self.reports.write(&report)?;
        if report.resolved {
            tracing::info!(
                crash_id = %report.crash_id,
                attempts = report.attempt_count(),
                report = %path.display(),
                "service recovered"
            );
        } else {
            tracing::error!(
                crash_id = %report.crash_id,
                attempts = report.attempt_count(),
                report = %path.display(),
                "recovery failed, manual intervention needed"
            );
        }
        Ok(Some(report))
    }

    /// Stop whatever the last attempt restarted and leave the record `stopped`.
    async fn abandon(&self, service: &str) {
        match self.stage(self.env.abandon(service)).await {
            Ok(actions) => {
                for action in actions {
                    tracing::info!(service, %action, "abandoned recovery");
                }
            }
            Err(e) => tracing::warn!(service, error = %e, "could not clean up after failed recovery"),
        }
        self.mark_stopped(service);
    }

    /// Keep the health monitor from probing while the incident runs.
    fn mark_stopped(&self, service: &str) {
        let result = self.registry.update(service, |r| {
            if r.status != ServiceStatus::Stopped && r.status.is_valid_transition(ServiceStatus::Stopped) {
                r.status = ServiceStatus::Stopped;
            }
        });
        if let Err(e) = result {
            tracing::debug!(service, error = %e, "could not mark crashed service stopped");
        }
    }

    async fn recover(&self, service: &str, log: &Mutex<IncidentLog>) -> bool {
        self.policy()
            .run(move |attempt| self.run_attempt(service, attempt, log))
            .await
            .is_ok()
    }

    /// One attempt: all four stages, in order.
    async fn run_attempt(
        &self,
        service: &str,
        attempt: Attempt,
        log: &Mutex<IncidentLog>,
    ) -> std::result::Result<(), String> {
        let n = attempt.number;
        tracing::info!(service, attempt = n, "recovery attempt");

        let started = Instant::now();
        let (captured, actions, ok) = self
            .stage(self.env.capture(service, self.settings.capture_lines))
            .await
            .map(|c| {
                let mut actions = vec![format!("captured {} log lines", c.log_tail.len())];
                actions.extend(c.exit.as_ref().map(|e| e.describe()));
                (c, actions, true)
            })
            .unwrap_or_else(|e| (CapturedError::default(), vec![e], false));
        self.record(log, n, RecoveryStage::ErrorCapture, actions, ok, started);

        let started = Instant::now();
        let (diagnosis, actions, ok) = self
            .stage(self.env.diagnose(service, &captured))
            .await
            .map(|d| {
                let actions = describe_diagnosis(&d);
                (d, actions, true)
            })
            .unwrap_or_else(|e| (DiagnosisResult::default(), vec![e], false));
        self.record(log, n, RecoveryStage::Diagnose, actions, ok, started);

        let started = Instant::now();
        let (actions, resolved) = if !self.settings.enabled {
            (vec!["automatic recovery disabled".to_string()], false)
        } else {
            match self.stage(self.env.attempt(service, &diagnosis)).await {
                Ok(mut actions) => {
                    let healthy = tokio::time::timeout(self.settings.stage_timeout, self.env.verify(service))
                        .await
                        .unwrap_or(false);
                    actions.push(if healthy { "verified healthy" } else { "still not healthy" }.to_string());
                    (actions, healthy)
                }
                Err(e) => (vec![e], false),
            }
        };
        self.record(log, n, RecoveryStage::RecoveryAttempt, actions, resolved, started);

        let started = Instant::now();
        let hints = if resolved {
            Vec::new()
        } else {
            report::suggestions(service, &[], Some(&captured), Some(&diagnosis))
        };
        self.record(log, n, RecoveryStage::Fallback, hints, true, started);

        {
            let mut log = log.lock();
            log.captured = Some(captured);
            log.diagnosis = Some(diagnosis);
        }

        if resolved {
            Ok(())
        } else {
            Err(format!("attempt {} did not restore '{}'", n, service))
        }
    }

    /// Run one stage under the stage timeout, flattening errors to text.
    async fn stage<T>(&self, fut: impl Future<Output = Result<T>>) -> std::result::Result<T, String> {
        match tokio::time::timeout(self.settings.stage_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", self.settings.stage_timeout)),
        }
    }

    fn record(
        &self,
        log: &Mutex<IncidentLog>,
        attempt: usize,
        stage: RecoveryStage,
        actions: Vec<String>,
        success: bool,
        started: Instant,
    ) {
        tracing::debug!(attempt, %stage, success, "stage finished");
        log.lock().attempts.push(RecoveryAttempt {
            attempt,
            stage,
            actions,
            success,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }

    fn finish_report(
        &self,
        service: &str,
        detections: Vec<DetectionResult>,
        log: IncidentLog,
        resolved: bool,
    ) -> CrashReport {
        let mut report = CrashReport::new(service, detections);
        report.suggestions = report::suggestions(
            service,
            &report.detections,
            log.captured.as_ref(),
            log.diagnosis.as_ref(),
        );
        if log.interrupted {
            report
                .suggestions
                .insert(0, "Recovery was interrupted by shutdown".to_string());
        }
        report.captured = log.captured;
        report.diagnosis = log.diagnosis;
        report.attempts = log.attempts;
        report.resolved = resolved;
        report.completed_at = Some(Utc::now());
        report
    }

    /// Detection loop for one service. Ends when cancelled or when the
    /// service is unregistered.
    async fn monitor_service(self: Arc<Self>, service: String, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.monitor_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; give the service one interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let Some(record) = self.registry.get(&service) else {
                        break;
                    };
                    if !matches!(record.status, ServiceStatus::Healthy | ServiceStatus::Unhealthy)
                        || self.is_recovering(&service)
                    {
                        continue;
                    }
                    if let Some(detections) = self.detect(&service).await {
                        if let Err(e) = self.handle_crash(&service, detections, &cancel).await {
                            tracing::error!(service = %service, error = %e, "failed to persist crash report");
                        }
                    }
                }
            }
        }
    }

    /// Consume crash signals and run per-service detection until cancelled.
    /// In-flight incidents are allowed to write their reports before this
    /// returns.
    pub async fn run(self: Arc<Self>, mut crashes: mpsc::UnboundedReceiver<CrashSignal>, cancel: CancellationToken) {
        let mut reconcile = tokio::time::interval(self.settings.monitor_interval);
        reconcile.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut loops: HashMap<String, JoinHandle<()>> = HashMap::new();
        let mut incidents = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(signal) = crashes.recv() => {
                    let current = self.registry.get(&signal.service).map(|r| r.registration_id);
                    if current.as_deref() != Some(signal.registration_id.as_str()) {
                        tracing::debug!(service = %signal.service, "ignoring crash signal for stale registration");
                        continue;
                    }
                    let manager = Arc::clone(&self);
                    let token = cancel.child_token();
                    incidents.spawn(async move {
                        if let Err(e) = manager.handle_crash(&signal.service, vec![signal.detection], &token).await {
                            tracing::error!(service = %signal.service, error = %e, "failed to persist crash report");
                        }
                    });
                }
                _ = reconcile.tick(), if self.detector.is_some() => {
                    loops.retain(|_, handle| !handle.is_finished());
                    for name in self.registry.names() {
                        if loops.contains_key(&name) {
                            continue;
                        }
                        let task = tokio::spawn(Arc::clone(&self).monitor_service(name.clone(), cancel.child_token()));
                        loops.insert(name, task);
                    }
                }
                Some(joined) = incidents.join_next() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "recovery task panicked");
                    }
                }
            }
        }

        while incidents.join_next().await.is_some() {}
        for (_, handle) in loops {
            let _ = handle.await;
        }
        tracing::debug!("recovery manager stopped");
    }
}

fn describe_diagnosis(d: &DiagnosisResult) -> Vec<String> {
    if d.is_clean() {
        return vec!["no port conflicts, zombies or resource issues found".to_string()];
    }
    let mut out = Vec::new();
    for conflict in &d.port_conflicts {
        out.push(format!("port {} held by {} other process(es)", conflict.port, conflict.holders.len()));
    }
    if !d.zombie_pids.is_empty() {
        out.push(format!("zombie pids: {:?}", d.zombie_pids));
    }
    out.extend(d.resource_issues.iter().map(|i| format!("resource issue: {}", i)));
    out
}
