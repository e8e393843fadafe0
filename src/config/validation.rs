use super::Config;
use crate::error::{Error, Result};
use crate::registry::DependencyGraph;
use std::collections::BTreeSet;

impl Config {
    /// Validate the configuration.
    ///
    /// Fails on anything that would make startup impossible: empty commands,
    /// unusable ports or ranges, zero thresholds and dependency cycles.
    /// Dependencies on services that are not declared only produce a warning
    /// because they may register later from another orchestrator run.
    pub fn validate(&self) -> Result<()> {
        for (name, service) in &self.services {
            if name.trim().is_empty() {
                return Err(Error::Validation("Service names must not be empty".to_string()));
            }

            if service.command.is_empty() || service.command[0].trim().is_empty() {
                return Err(Error::Validation(format!(
                    "Service '{}' has an empty command. Provide an argv list like [\"npm\", \"run\", \"dev\"]",
                    name
                )));
            }

            if let Some(port) = service.port {
                if port == 0 || port > u16::MAX as u32 {
                    return Err(Error::InvalidPortRange {
                        start: port,
                        end: port,
                        reason: format!("service '{}' declares port {} outside 1-65535", name, port),
                    });
                }
            }

            // Surfaces InvalidPortRange for inverted or out-of-bounds ranges
            service.range()?;

            if service.health_path.is_empty() || !service.health_path.starts_with('/') {
                return Err(Error::Validation(format!(
                    "Service '{}' has health_path '{}'. It must start with '/'",
                    name, service.health_path
                )));
            }

            for dep in &service.depends_on {
                if dep == name {
                    return Err(Error::CircularDependency(vec![name.clone()]));
                }
                if !self.services.contains_key(dep) {
                    tracing::warn!(
                        service = %name,
                        dependency = %dep,
                        "depends on a service that is not declared; it will be skipped unless it registers later"
                    );
                }
            }
        }

        if self.health.failure_threshold == 0 {
            return Err(Error::Validation(
                "health.failure_threshold must be at least 1".to_string(),
            ));
        }

        if self.health.interval.is_zero() || self.registry.sweep_interval.is_zero() {
            return Err(Error::Validation(
                "health.interval and registry.sweep_interval must be greater than zero".to_string(),
            ));
        }

        if self.recovery.enabled && self.recovery.backoff.is_empty() {
            return Err(Error::Validation(
                "recovery.backoff must list at least one delay when recovery is enabled".to_string(),
            ));
        }

        self.dependency_graph().topological_order()?;

        Ok(())
    }

    /// Startup order over the declared services.
    ///
    /// With `only` empty every service is included; otherwise the named
    /// services plus everything they transitively depend on.
    pub fn startup_order(&self, only: &[String]) -> Result<Vec<String>> {
        let graph = self.dependency_graph();
        let order = graph.topological_order()?;
        if only.is_empty() {
            return Ok(order);
        }

        let mut wanted = BTreeSet::new();
        let mut stack = Vec::new();
        for name in only {
            if !self.services.contains_key(name) {
                return Err(Error::ServiceNotFound(name.clone()));
            }
            stack.push(name.clone());
        }
        while let Some(name) = stack.pop() {
            if wanted.insert(name.clone()) {
                stack.extend(graph.dependencies_of(&name));
            }
        }
        Ok(order.into_iter().filter(|n| wanted.contains(n)).collect())
    }

    /// Dependency graph over declared services. Edges to undeclared services are dropped.
    pub fn dependency_graph(&self) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for (name, service) in &self.services {
            graph.add_node(name);
            for dep in &service.depends_on {
                if self.services.contains_key(dep) {
                    graph.add_edge(name, dep);
                }
            }
        }
        graph
    }
}
