//! Shutdown coordinator behaviour under concurrent triggers, the global
//! deadline and forced escalation.

use devfleet::config::ShutdownSettings;
use devfleet::shutdown::{ShutdownPhase, PRIORITY_PROCESSES, PRIORITY_RESOURCES};
use devfleet::{Error, ExitPolicy, ShutdownCoordinator};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn coordinator(settings: ShutdownSettings) -> Arc<ShutdownCoordinator> {
    Arc::new(ShutdownCoordinator::new(settings, ExitPolicy::Return))
}

fn counting_handler(
    coordinator: &ShutdownCoordinator,
    name: &str,
    priority: i32,
    critical: bool,
    calls: &Arc<AtomicUsize>,
) {
    let calls = Arc::clone(calls);
    coordinator
        .register_cleanup(name, priority, Duration::from_secs(5), critical, move || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();
}

#[tokio::test]
async fn concurrent_triggers_run_handlers_once() {
    let coordinator = coordinator(ShutdownSettings::default());
    let calls = Arc::new(AtomicUsize::new(0));
    counting_handler(&coordinator, "stop-services", PRIORITY_PROCESSES, true, &calls);
    counting_handler(&coordinator, "release-ports", PRIORITY_RESOURCES, false, &calls);

    let a = Arc::clone(&coordinator);
    let b = Arc::clone(&coordinator);
    let (first, second) = tokio::join!(
        tokio::spawn(async move { a.initiate_shutdown("signal").await }),
        tokio::spawn(async move { b.initiate_shutdown("panic").await }),
    );
    let outcomes: Vec<_> = [first.unwrap(), second.unwrap()].into_iter().flatten().collect();

    assert_eq!(outcomes.len(), 1, "exactly one caller owns the sequence");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(outcomes[0].completed, vec!["stop-services", "release-ports"]);
    assert!(!outcomes[0].emergency);
    assert_eq!(coordinator.phase(), ShutdownPhase::Completed);

    // A late trigger is a no-op too
    assert!(coordinator.initiate_shutdown("again").await.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn global_deadline_escalates_to_emergency() {
    let settings = ShutdownSettings {
        emergency_timeout: Duration::from_secs(30),
        handler_timeout: Duration::from_secs(2),
        ..ShutdownSettings::default()
    };
    let coordinator = coordinator(settings);
    let emergency_runs = Arc::new(AtomicUsize::new(0));

    // Each handler stays under its own timeout, but together they blow the deadline
    for name in ["drain-a", "drain-b", "drain-c", "drain-d"] {
        coordinator
            .register_cleanup(name, 10, Duration::from_secs(20), false, || async {
                tokio::time::sleep(Duration::from_secs(12)).await;
                Ok(())
            })
            .unwrap();
    }
    counting_handler(&coordinator, "kill-trees", PRIORITY_PROCESSES, true, &emergency_runs);

    let started = tokio::time::Instant::now();
    let outcome = coordinator.initiate_shutdown("deadline").await.unwrap();

    assert!(outcome.emergency);
    assert!(outcome.escalation.as_deref().unwrap().contains("emergency timeout"));
    assert_eq!(outcome.completed[..2], ["drain-a", "drain-b"]);
    assert!(outcome.completed.contains(&"kill-trees (emergency)".to_string()));
    assert_eq!(emergency_runs.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_secs(35));
}

#[tokio::test(start_paused = true)]
async fn second_signal_forces_emergency_cleanup() {
    let coordinator = coordinator(ShutdownSettings::default());
    let critical_runs = Arc::new(AtomicUsize::new(0));

    coordinator
        .register_cleanup("slow-drain", 10, Duration::from_secs(25), false, || async {
            tokio::time::sleep(Duration::from_secs(20)).await;
            Ok(())
        })
        .unwrap();
    counting_handler(&coordinator, "kill-trees", PRIORITY_PROCESSES, true, &critical_runs);

    let escalator = Arc::clone(&coordinator);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        escalator.escalate();
    });

    let outcome = coordinator.initiate_shutdown("interrupt").await.unwrap();
    assert!(outcome.emergency);
    assert_eq!(outcome.escalation.as_deref(), Some("forced shutdown"));
    assert!(!outcome.completed.contains(&"slow-drain".to_string()));
    assert_eq!(critical_runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn non_critical_failure_does_not_stop_the_sequence() {
    let coordinator = coordinator(ShutdownSettings::default());
    let order = Arc::new(Mutex::new(Vec::new()));

    coordinator
        .register_cleanup("persist-registry", PRIORITY_RESOURCES, Duration::from_secs(1), false, || async {
            Err(Error::Validation("disk full".to_string()))
        })
        .unwrap();
    let seen = Arc::clone(&order);
    coordinator
        .register_cleanup("release-ports", PRIORITY_RESOURCES + 10, Duration::from_secs(1), false, move || {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().push("release-ports");
                Ok(())
            }
        })
        .unwrap();

    let outcome = coordinator.initiate_shutdown("down").await.unwrap();
    assert!(!outcome.emergency);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.completed, vec!["release-ports"]);
    assert_eq!(*order.lock(), vec!["release-ports"]);
}

#[tokio::test]
async fn wait_completed_resolves_after_shutdown() {
    let coordinator = coordinator(ShutdownSettings::default());
    let calls = Arc::new(AtomicUsize::new(0));
    counting_handler(&coordinator, "stop-services", PRIORITY_PROCESSES, true, &calls);

    let waiter = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.wait_completed().await })
    };
    coordinator.initiate_shutdown("test").await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter should be released")
        .unwrap();
}
