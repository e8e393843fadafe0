//! Registry persistence across restarts and corruption recovery.

use devfleet::registry::store::{DEPENDENCIES_FILE, PORTS_FILE, SERVICES_FILE};
use devfleet::{PortAllocator, ServiceRecord, ServiceRegistry, ServiceStatus};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;

fn allocator() -> Arc<PortAllocator> {
    Arc::new(PortAllocator::new(IpAddr::V4(Ipv4Addr::LOCALHOST)))
}

fn seed(dir: &Path) -> String {
    let registry = ServiceRegistry::new(dir, allocator());
    registry
        .register(
            ServiceRecord::new("db", "127.0.0.1", 41_432)
                .with_pid(1111)
                .with_status(ServiceStatus::Healthy),
        )
        .unwrap();
    registry
        .register(
            ServiceRecord::new("api", "127.0.0.1", 41_080)
                .with_status(ServiceStatus::Starting)
                .with_dependencies(["db"]),
        )
        .unwrap()
}

#[test]
fn records_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let api_id = seed(dir.path());

    let allocator = allocator();
    let reloaded = ServiceRegistry::load(dir.path(), allocator.clone()).unwrap();

    let api = reloaded.get("api").unwrap();
    assert_eq!(api.registration_id, api_id);
    assert_eq!(api.port, 41_080);
    assert!(api.dependencies.contains("db"));
    assert_eq!(reloaded.get("db").unwrap().pid, Some(1111));

    // Restored ports are reserved again, as soft reservations
    let reservation = allocator.reservation_for("db").unwrap();
    assert_eq!(reservation.port, 41_432);
    assert!(!reservation.reserved);

    assert_eq!(reloaded.resolve_startup_order().unwrap(), vec!["db", "api"]);
}

#[test]
fn corrupt_services_file_is_backed_up_and_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path());
    fs::write(dir.path().join(SERVICES_FILE), "{\"services\": [ {\"name\": ").unwrap();

    let reloaded = ServiceRegistry::load(dir.path(), allocator()).unwrap();
    assert!(reloaded.list(None).is_empty());

    let backups: Vec<_> = fs::read_dir(dir.path().join("backup"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(backups.len(), 1);
    assert!(backups[0].starts_with("services.json."));
    assert!(backups[0].ends_with(".corrupt"));

    // The directory converged back to loadable documents
    let rewritten = fs::read_to_string(dir.path().join(SERVICES_FILE)).unwrap();
    assert!(serde_json::from_str::<serde_json::Value>(&rewritten).is_ok());
}

#[test]
fn corrupt_ports_file_keeps_service_records() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path());
    fs::write(dir.path().join(PORTS_FILE), "not json at all").unwrap();

    let allocator = allocator();
    let reloaded = ServiceRegistry::load(dir.path(), allocator.clone()).unwrap();

    assert_eq!(reloaded.names(), vec!["api", "db"]);
    // Ports are rebuilt from the surviving records
    assert_eq!(allocator.owner_of(41_080).as_deref(), Some("api"));
}

#[test]
fn integrity_sweep_repairs_a_file_corrupted_at_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let registry = ServiceRegistry::new(dir.path(), allocator());
    registry
        .register(ServiceRecord::new("cache", "127.0.0.1", 41_379))
        .unwrap();

    fs::write(dir.path().join(DEPENDENCIES_FILE), "{").unwrap();
    let recovered = registry.check_integrity().unwrap();
    assert_eq!(recovered.len(), 1);

    assert!(registry.check_integrity().unwrap().is_empty());
    let graph = fs::read_to_string(dir.path().join(DEPENDENCIES_FILE)).unwrap();
    assert!(graph.contains("cache"));
}

#[test]
fn writes_leave_no_temp_files_behind() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path());

    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn persisted_port_owned_by_another_service_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path());

    let allocator = allocator();
    // Someone else took db's port before the registry was reopened
    allocator.adopt("intruder", 41_432).unwrap();
    let reloaded = ServiceRegistry::load(dir.path(), allocator.clone()).unwrap();

    assert!(reloaded.get("db").is_none());
    assert!(reloaded.get("api").is_some());
    assert_eq!(allocator.owner_of(41_432).as_deref(), Some("intruder"));
}
