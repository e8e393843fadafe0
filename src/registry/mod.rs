//! Durable service registry.
//!
//! The registry is the single owner of service records. Mutations happen
//! under one short-lived sync lock and are followed by an atomic persist of
//! all three registry documents. Port ownership is delegated to the
//! [`PortAllocator`]; the registry rejects records whose port belongs to a
//! different service.

mod graph;
pub mod reaper;
pub mod store;
mod types;

pub use graph::DependencyGraph;
pub use reaper::{Liveness, ReapReason, StalenessReaper, SystemLiveness};
pub use store::RegistryStore;
pub use types::*;

use crate::error::{Error, Result};
use crate::port::PortAllocator;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

pub struct ServiceRegistry {
    services: Mutex<BTreeMap<String, ServiceRecord>>,
    /// Serialises persists so an older snapshot never overwrites a newer one.
    persist_lock: Mutex<()>,
    /// Services with a crash incident in progress. Never reaped.
    recovering: Mutex<HashSet<String>>,
    store: RegistryStore,
    allocator: Arc<PortAllocator>,
}

impl ServiceRegistry {
    /// Empty registry persisting into `dir`. Nothing is read from disk.
    pub fn new(dir: impl Into<PathBuf>, allocator: Arc<PortAllocator>) -> Self {
        Self {
            services: Mutex::new(BTreeMap::new()),
            persist_lock: Mutex::new(()),
            recovering: Mutex::new(HashSet::new()),
            store: RegistryStore::new(dir),
            allocator,
        }
    }

    /// Load persisted state from `dir`, recovering from corrupt documents.
    ///
    /// Corrupt files are backed up and replaced by whatever could be read
    /// (or an empty state). The result is re-persisted immediately so the
    /// directory always converges to loadable files.
    pub fn load(dir: impl Into<PathBuf>, allocator: Arc<PortAllocator>) -> Result<Self> {
        let registry = Self::new(dir, allocator);
        let store = &registry.store;

        let services = store.load_services()?;
        let ports = store.load_ports()?;
        // The graph is derived from records; the document is only checked for corruption
        let dependencies = store.load_dependencies()?;

        let recovered = [services.backup(), ports.backup(), dependencies.backup()]
            .iter()
            .flatten()
            .count();

        let mut records = BTreeMap::new();
        for record in services.into_option().map(|f| f.services).unwrap_or_default() {
            match registry.allocator.adopt(&record.name, record.port) {
                Ok(()) => {
                    records.insert(record.name.clone(), record);
                }
                Err(e) => {
                    tracing::warn!(service = %record.name, error = %e, "dropping persisted record");
                }
            }
        }

        // Reservations without a record (e.g. allocated but never started)
        for (port, reservation) in ports.into_option().map(|f| f.allocations).unwrap_or_default() {
            if !records.contains_key(&reservation.owner_service) {
                if let Err(e) = registry.allocator.adopt(&reservation.owner_service, port) {
                    tracing::debug!(port, error = %e, "skipping persisted reservation");
                }
            }
        }

        let count = records.len();
        *registry.services.lock() = records;
        registry.persist()?;

        if recovered > 0 {
            tracing::warn!(recovered, "registry recovered from corrupt files");
        }
        tracing::debug!(services = count, dir = %registry.store.dir().display(), "registry loaded");
        Ok(registry)
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    pub fn allocator(&self) -> &Arc<PortAllocator> {
        &self.allocator
    }

    /// Register (or re-register) a service and return its registration id.
    ///
    /// Rejects the record if its port is owned by a different service.
    /// Dependencies on services that are not registered are only logged.
    #[tracing::instrument(skip(self, record), fields(service.name = %record.name))]
    pub fn register(&self, mut record: ServiceRecord) -> Result<String> {
        if record.name.trim().is_empty() {
            return Err(Error::Validation("service name must not be empty".to_string()));
        }
        if record.port == 0 {
            return Err(Error::InvalidPortRange {
                start: 0,
                end: 0,
                reason: format!("service '{}' registered without a port", record.name),
            });
        }

        {
            let mut services = self.services.lock();

            if let Some(other) = services
                .values()
                .find(|r| r.port == record.port && r.name != record.name)
            {
                return Err(Error::PortConflict {
                    port: record.port,
                    owner: other.name.clone(),
                });
            }
            self.allocator.adopt(&record.name, record.port)?;

            // A re-registration on a new port frees the old one
            if let Some(previous) = services.get(&record.name) {
                if previous.port != record.port {
                    self.allocator.release(previous.port);
                }
            }

            for dep in &record.dependencies {
                if !services.contains_key(dep) {
                    tracing::info!(dependency = %dep, "dependency not registered yet");
                }
            }

            record.registration_id = generate_registration_id();
            services.insert(record.name.clone(), record.clone());
        }

        self.persist()?;
        tracing::info!(port = record.port, pid = ?record.pid, "service registered");
        Ok(record.registration_id)
    }

    /// Remove a service and release its port.
    pub fn unregister(&self, name: &str) -> Result<Option<ServiceRecord>> {
        let removed = self.services.lock().remove(name);
        if let Some(record) = &removed {
            self.allocator.release(record.port);
            self.persist()?;
            tracing::info!(service = %name, "service unregistered");
        }
        Ok(removed)
    }

    /// Remove a service only if it still carries `registration_id` and has
    /// no recovery in progress. Guards against removing a record that was
    /// re-registered or is being restarted meanwhile.
    pub fn unregister_if(&self, name: &str, registration_id: &str) -> Result<Option<ServiceRecord>> {
        let removed = {
            let mut services = self.services.lock();
            match services.get(name) {
                Some(r) if r.registration_id == registration_id && !self.is_recovering(name) => {
                    services.remove(name)
                }
                _ => None,
            }
        };
        if let Some(record) = &removed {
            self.allocator.release(record.port);
            self.persist()?;
        }
        Ok(removed)
    }

    /// Mark `name` as having a crash incident in progress. Returns `false`
    /// if one already is.
    pub fn begin_recovery(&self, name: &str) -> bool {
        self.recovering.lock().insert(name.to_string())
    }

    pub fn end_recovery(&self, name: &str) {
        self.recovering.lock().remove(name);
    }

    pub fn is_recovering(&self, name: &str) -> bool {
        self.recovering.lock().contains(name)
    }

    pub fn get(&self, name: &str) -> Option<ServiceRecord> {
        self.services.lock().get(name).cloned()
    }

    /// Records ordered by name, optionally restricted to one status.
    pub fn list(&self, status: Option<ServiceStatus>) -> Vec<ServiceRecord> {
        self.services
            .lock()
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.services.lock().keys().cloned().collect()
    }

    /// Read-modify-write one record under the registry lock, then persist.
    pub fn update<R>(&self, name: &str, f: impl FnOnce(&mut ServiceRecord) -> R) -> Result<R> {
        let result = {
            let mut services = self.services.lock();
            let record = services
                .get_mut(name)
                .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
            f(record)
        };
        self.persist()?;
        Ok(result)
    }

    /// Move a service to `status`. Returns the previous status.
    pub fn update_status(&self, name: &str, status: ServiceStatus) -> Result<ServiceStatus> {
        self.update(name, |record| {
            let previous = record.status;
            if !previous.is_valid_transition(status) {
                return Err(Error::Validation(format!(
                    "service '{}' cannot move from {} to {}",
                    name, previous, status
                )));
            }
            record.status = status;
            if status == ServiceStatus::Starting {
                record.health_failure_count = 0;
                record.started_at = Utc::now();
            }
            Ok(previous)
        })?
    }

    pub fn set_pid(&self, name: &str, pid: Option<u32>) -> Result<()> {
        self.update(name, |record| record.pid = pid)
    }

    /// Dependency graph over registered services.
    ///
    /// Edges to services that are not registered are skipped.
    pub fn dependency_graph(&self) -> DependencyGraph {
        let services = self.services.lock();
        let mut graph = DependencyGraph::new();
        for (name, record) in services.iter() {
            graph.add_node(name);
            for dep in &record.dependencies {
                if services.contains_key(dep) {
                    graph.add_edge(name, dep);
                } else {
                    tracing::debug!(service = %name, dependency = %dep, "skipping unregistered dependency");
                }
            }
        }
        graph
    }

    /// Startup order over registered services: every service after all of
    /// its dependencies. Fails with the unorderable set on a cycle.
    pub fn resolve_startup_order(&self) -> Result<Vec<String>> {
        self.dependency_graph().topological_order()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let services: Vec<ServiceRecord> = self.services.lock().values().cloned().collect();
        let graph = services
            .iter()
            .map(|r| (r.name.clone(), r.dependencies.clone()))
            .collect::<BTreeMap<String, BTreeSet<String>>>();
        RegistrySnapshot {
            timestamp: Utc::now(),
            services,
            ports: self.allocator.reservations(),
            graph,
        }
    }

    /// Atomically write all registry documents.
    pub fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock();
        let snapshot = self.snapshot();

        let services = ServicesFile {
            timestamp: snapshot.timestamp,
            services: snapshot.services,
        };
        let ports = PortsFile {
            timestamp: snapshot.timestamp,
            allocations: snapshot.ports.into_iter().map(|r| (r.port, r)).collect(),
        };
        let dependencies = DependenciesFile {
            timestamp: snapshot.timestamp,
            graph: snapshot.graph,
        };
        self.store.save(&services, &ports, &dependencies)
    }

    /// Parse the persisted documents; rewrite them if any was corrupt.
    pub fn check_integrity(&self) -> Result<Vec<PathBuf>> {
        let recovered = {
            let _guard = self.persist_lock.lock();
            self.store.check_integrity()?
        };
        if !recovered.is_empty() {
            tracing::warn!(count = recovered.len(), "integrity sweep recovered corrupt registry files");
            self.persist()?;
        }
        Ok(recovered)
    }
}
