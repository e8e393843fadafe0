use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Dependency graph over service names.
///
/// `edges[A] = {B, C}` means A depends on B and C. Ordered maps keep the
/// resolved order deterministic for equal-rank services.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
    /// `reverse[A] = {B, C}` means B and C depend on A
    reverse: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_adjacency(adjacency: &BTreeMap<String, BTreeSet<String>>) -> Self {
        let mut graph = Self::new();
        for (node, deps) in adjacency {
            graph.add_node(node);
            for dep in deps {
                graph.add_edge(node, dep);
            }
        }
        graph
    }

    pub fn add_node(&mut self, name: &str) {
        self.edges.entry(name.to_string()).or_default();
        self.reverse.entry(name.to_string()).or_default();
    }

    /// `from` depends on `to`.
    pub fn add_edge(&mut self, from: &str, to: &str) {
        self.add_node(from);
        self.add_node(to);
        self.edges.entry(from.to_string()).or_default().insert(to.to_string());
        self.reverse.entry(to.to_string()).or_default().insert(from.to_string());
    }

    pub fn dependencies_of(&self, node: &str) -> BTreeSet<String> {
        self.edges.get(node).cloned().unwrap_or_default()
    }

    pub fn dependents_of(&self, node: &str) -> BTreeSet<String> {
        self.reverse.get(node).cloned().unwrap_or_default()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &String> {
        self.edges.keys()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn adjacency(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.edges
    }

    /// Kahn's algorithm: dependencies first.
    ///
    /// Nodes left over once no zero in-degree node remains form (or sit
    /// behind) a cycle. They are reported sorted and no order is guessed.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .edges
            .iter()
            .map(|(node, deps)| (node.as_str(), deps.len()))
            .collect();

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(node, _)| *node)
            .collect();

        let mut order = Vec::with_capacity(self.edges.len());

        while let Some(node) = ready.pop_first() {
            order.push(node.to_string());
            in_degree.remove(node);

            if let Some(dependents) = self.reverse.get(node) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.insert(dependent.as_str());
                        }
                    }
                }
            }
        }

        if !in_degree.is_empty() {
            let remaining: Vec<String> = in_degree.keys().map(|s| s.to_string()).collect();
            return Err(Error::CircularDependency(remaining));
        }

        Ok(order)
    }

    pub fn has_cycle(&self) -> bool {
        self.topological_order().is_err()
    }
}
