//! End-to-end orchestration of real child processes.
//!
//! Services are plain `sleep` processes; health is decided by a scripted
//! checker so no service needs to speak HTTP.
#![cfg(unix)]

use async_trait::async_trait;
use devfleet::config::{RecoverySettings, ShutdownSettings};
use devfleet::health::{HealthChecker, ProbeResult};
use devfleet::recovery::{DetectionMethod, DetectionResult};
use devfleet::registry::{StalenessReaper, SystemLiveness};
use devfleet::{Config, Error, Orchestrator, ServiceConfig, ServiceRecord, ServiceStatus};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct ScriptedChecker {
    broken: Mutex<HashSet<String>>,
}

impl ScriptedChecker {
    fn break_service(&self, name: &str) {
        self.broken.lock().insert(name.to_string());
    }
}

#[async_trait]
impl HealthChecker for ScriptedChecker {
    async fn probe(&self, record: &ServiceRecord, _timeout: Duration) -> ProbeResult {
        if self.broken.lock().contains(&record.name) {
            ProbeResult::failed(Some(503), Duration::from_millis(1), "HTTP 503")
        } else {
            ProbeResult::healthy(200, Duration::from_millis(1))
        }
    }
}

fn sleeper() -> ServiceConfig {
    ServiceConfig::new(["sleep", "30"])
}

fn config() -> Config {
    let mut config = Config::default();
    config.health.interval = Duration::from_millis(100);
    config.health.startup_timeout = Duration::from_secs(1);
    config.shutdown = ShutdownSettings {
        stop_grace: Duration::from_secs(1),
        ..ShutdownSettings::default()
    };
    config.recovery = RecoverySettings {
        backoff: vec![Duration::from_millis(100), Duration::from_millis(200)],
        monitor_interval: Duration::from_millis(200),
        ..RecoverySettings::default()
    };

    let mut api = sleeper();
    api.depends_on = vec!["db".to_string()];
    config.services.insert("db".to_string(), sleeper());
    config.services.insert("api".to_string(), api);
    config
}

fn orchestrator(config: Config) -> (TempDir, Arc<ScriptedChecker>, Arc<Orchestrator>) {
    let dir = tempfile::tempdir().unwrap();
    let checker = Arc::new(ScriptedChecker::default());
    let orchestrator = Orchestrator::builder()
        .config(config)
        .work_dir(dir.path().to_path_buf())
        .health_checker(checker.clone())
        .build()
        .unwrap();
    (dir, checker, Arc::new(orchestrator))
}

fn pid_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

fn sigkill(pid: u32) {
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();
}

#[tokio::test]
async fn start_all_brings_services_up_in_order() {
    let (_dir, _checker, orchestrator) = orchestrator(config());

    let started = orchestrator.start_all(&[]).await.unwrap();
    assert_eq!(started, vec!["db", "api"]);

    let records = orchestrator.status();
    assert_eq!(records.len(), 2);
    for record in &records {
        assert_eq!(record.status, ServiceStatus::Healthy);
        assert!(pid_alive(record.pid.unwrap()));
    }
    assert_ne!(records[0].port, records[1].port);
    assert!(records.iter().find(|r| r.name == "api").unwrap().dependencies.contains("db"));

    orchestrator.teardown().await.unwrap();
}

#[tokio::test]
async fn dependency_must_be_healthy_first() {
    let (_dir, _checker, orchestrator) = orchestrator(config());

    match orchestrator.start("api").await {
        Err(Error::ServiceStartFailed(name, reason)) => {
            assert_eq!(name, "api");
            assert!(reason.contains("'db'"));
        }
        other => panic!("expected ServiceStartFailed, got {other:?}"),
    }
    assert!(orchestrator.registry().get("api").is_none());
}

#[tokio::test]
async fn unhealthy_start_is_rolled_back() {
    let (_dir, checker, orchestrator) = orchestrator(config());
    checker.break_service("db");

    let err = orchestrator.start("db").await.unwrap_err();
    assert!(matches!(err, Error::HealthCheckFailed(..)));

    let record = orchestrator.registry().get("db").unwrap();
    assert_eq!(record.status, ServiceStatus::Stopped);
    assert!(record.pid.is_none());
    assert!(orchestrator.supervisor().pid_of("db").is_none());
}

#[tokio::test]
async fn stop_keeps_the_port_for_a_restart() {
    let (_dir, _checker, orchestrator) = orchestrator(config());
    let port = orchestrator.start("db").await.unwrap();
    let pid = orchestrator.registry().get("db").unwrap().pid.unwrap();

    orchestrator.stop("db").await.unwrap();
    let record = orchestrator.registry().get("db").unwrap();
    assert_eq!(record.status, ServiceStatus::Stopped);
    assert!(record.pid.is_none());
    assert!(!pid_alive(pid));
    assert_eq!(orchestrator.allocator().owner_of(port).as_deref(), Some("db"));

    let restarted = orchestrator.start("db").await.unwrap();
    assert_eq!(restarted, port);
    orchestrator.teardown().await.unwrap();
}

#[tokio::test]
async fn teardown_clears_registry_and_processes() {
    let (dir, _checker, orchestrator) = orchestrator(config());
    orchestrator.start_all(&[]).await.unwrap();
    let pids: Vec<u32> = orchestrator.status().iter().filter_map(|r| r.pid).collect();

    let removed = orchestrator.teardown().await.unwrap();
    assert_eq!(removed.len(), 2);
    assert!(orchestrator.status().is_empty());
    assert!(pids.iter().all(|pid| !pid_alive(*pid)));
    assert!(orchestrator.allocator().reservations().is_empty());

    // A fresh orchestrator on the same state directory sees nothing
    let reopened = Orchestrator::builder()
        .config(config())
        .work_dir(dir.path().to_path_buf())
        .build()
        .unwrap();
    assert!(reopened.status().is_empty());
}

#[tokio::test]
async fn shutdown_stops_every_service() {
    let (_dir, _checker, orchestrator) = orchestrator(config());
    orchestrator.install_cleanup_handlers().unwrap();
    orchestrator.start_all(&[]).await.unwrap();
    orchestrator.run_background_tasks();
    let pids: Vec<u32> = orchestrator.status().iter().filter_map(|r| r.pid).collect();

    let outcome = orchestrator
        .shutdown()
        .initiate_shutdown("test finished")
        .await
        .unwrap();

    assert!(!outcome.emergency, "failures: {:?}", outcome.failures);
    assert_eq!(outcome.completed.first().map(String::as_str), Some("stop-background-tasks"));
    assert!(pids.iter().all(|pid| !pid_alive(*pid)));
    for record in orchestrator.status() {
        assert_eq!(record.status, ServiceStatus::Stopped);
    }
    assert!(orchestrator.start("db").await.is_err(), "no starts after shutdown");
}

#[tokio::test]
async fn killed_service_is_restarted_by_recovery() {
    let (dir, _checker, orchestrator) = orchestrator(config());
    orchestrator.start("db").await.unwrap();
    let old_pid = orchestrator.registry().get("db").unwrap().pid.unwrap();
    orchestrator.run_background_tasks();

    sigkill(old_pid);

    let recovered = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            if let Some(record) = orchestrator.registry().get("db") {
                let restarted = record.pid.is_some_and(|pid| pid != old_pid);
                let reported = !orchestrator.recovery().reports().list().unwrap().is_empty();
                if restarted && reported && record.status == ServiceStatus::Healthy {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("service should be restarted");
    assert!(pid_alive(recovered.pid.unwrap()));

    orchestrator.stop_background_tasks().await;
    let reports = orchestrator.recovery().reports().for_service("db").unwrap();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].resolved);
    assert!(reports[0].detections.iter().any(|d| d.is_crashed));
    assert!(dir.path().join(".devfleet/reports").is_dir());

    orchestrator.teardown().await.unwrap();
}

#[tokio::test]
async fn unresolved_incident_leaves_no_process_behind() {
    let mut config = config();
    config.recovery.backoff = vec![Duration::from_millis(50); 3];
    let (_dir, checker, orchestrator) = orchestrator(config);
    orchestrator.start("db").await.unwrap();
    let old_pid = orchestrator.registry().get("db").unwrap().pid.unwrap();

    checker.break_service("db");
    orchestrator.run_background_tasks();
    sigkill(old_pid);

    let reports = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let reports = orchestrator.recovery().reports().for_service("db").unwrap();
            if !reports.is_empty() && !orchestrator.recovery().is_recovering("db") {
                return reports;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("incident should finish");
    orchestrator.stop_background_tasks().await;

    assert_eq!(reports.len(), 1);
    assert!(!reports[0].resolved);
    assert_eq!(reports[0].attempt_count(), 3);

    let restarted: Vec<u32> = reports[0]
        .attempts
        .iter()
        .flat_map(|a| a.actions.iter())
        .filter_map(|action| action.rsplit_once("as pid ")?.1.parse().ok())
        .collect();
    assert_eq!(restarted.len(), 3);
    assert!(restarted.iter().all(|pid| !pid_alive(*pid)));

    let record = orchestrator.registry().get("db").unwrap();
    assert_eq!(record.status, ServiceStatus::Stopped);
    assert!(record.pid.is_none());
    assert!(orchestrator.supervisor().managed().is_empty());
}

#[tokio::test]
async fn sweeps_during_recovery_leave_the_record_alone() {
    let mut config = config();
    config.recovery.backoff = vec![Duration::from_millis(500)];
    let (_dir, _checker, orchestrator) = orchestrator(config);
    let port = orchestrator.start("db").await.unwrap();
    let old_pid = orchestrator.registry().get("db").unwrap().pid.unwrap();

    sigkill(old_pid);
    while orchestrator.supervisor().pid_of("db").is_some() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let liveness = Arc::new(SystemLiveness::new(
        Arc::clone(orchestrator.supervisor()),
        Arc::clone(orchestrator.allocator()),
    ));
    let reaper = StalenessReaper::new(Arc::clone(orchestrator.registry()), liveness, Duration::from_secs(3600));
    let detections = vec![DetectionResult::crashed(DetectionMethod::ProcessMonitor, "killed")];
    let cancel = CancellationToken::new();

    let mut reaped = Vec::new();
    let report = tokio::select! {
        biased;
        report = orchestrator.recovery().handle_crash("db", detections, &cancel) => report.unwrap().unwrap(),
        _ = async {
            for _ in 0..400 {
                reaped.extend(reaper.sweep());
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        } => panic!("recovery did not finish"),
    };

    assert!(reaped.is_empty(), "reaped {} record(s) mid-incident", reaped.len());
    assert!(report.resolved);
    let record = orchestrator.registry().get("db").unwrap();
    assert_eq!(record.status, ServiceStatus::Healthy);
    assert_eq!(record.port, port);
    assert!(record.pid.is_some_and(|pid| pid != old_pid && pid_alive(pid)));

    orchestrator.teardown().await.unwrap();
}
