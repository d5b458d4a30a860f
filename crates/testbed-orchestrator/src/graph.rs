//! Service dependency graph using `petgraph`.
//!
//! Builds a directed graph from `depends_on` declarations and resolves the
//! start order before anything is started, so a cycle fails fast instead of
//! recursing forever.

use std::collections::{BTreeMap, HashMap};

use petgraph::graph::NodeIndex;
use testbed_common::error::{Result, TestbedError};
use testbed_common::types::ServiceConfig;

/// A dependency graph of services.
#[derive(Debug)]
pub struct DependencyGraph {
    graph: petgraph::Graph<String, ()>,
    nodes: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Creates an empty dependency graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: petgraph::Graph::new(),
            nodes: HashMap::new(),
        }
    }

    /// Builds the graph of an environment's services.
    ///
    /// # Errors
    ///
    /// Returns an error if a service depends on a service that is not part
    /// of the environment.
    pub fn from_services(services: &BTreeMap<String, ServiceConfig>) -> Result<Self> {
        let mut graph = Self::new();
        for name in services.keys() {
            let _ = graph.add_service(name);
        }
        for (name, service) in services {
            for dependency in &service.depends_on {
                if !services.contains_key(dependency) {
                    return Err(TestbedError::Config {
                        message: format!("service {name} depends on unknown service {dependency}"),
                    });
                }
                graph.add_dependency(name, dependency);
            }
        }
        Ok(graph)
    }

    /// Adds a service node, returning the existing node for known names.
    pub fn add_service(&mut self, name: &str) -> NodeIndex {
        if let Some(&idx) = self.nodes.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(name.to_string());
        let _ = self.nodes.insert(name.to_string(), idx);
        idx
    }

    /// Adds a dependency edge: `dependent` depends on `dependency`.
    ///
    /// The graph edge points from `dependency` to `dependent`
    /// so that topological sort yields dependencies first.
    pub fn add_dependency(&mut self, dependent: &str, dependency: &str) {
        let from = self.add_service(dependency);
        let to = self.add_service(dependent);
        let _ = self.graph.add_edge(from, to, ());
    }

    /// Returns the start order: every service after all of its dependencies.
    ///
    /// # Errors
    ///
    /// Returns [`TestbedError::CyclicDependency`] if the graph contains a cycle.
    pub fn resolve_order(&self) -> Result<Vec<String>> {
        match petgraph::algo::toposort(&self.graph, None) {
            Ok(indices) => Ok(indices
                .iter()
                .filter_map(|&idx| self.graph.node_weight(idx).cloned())
                .collect()),
            Err(cycle) => Err(TestbedError::CyclicDependency {
                service: self
                    .graph
                    .node_weight(cycle.node_id())
                    .cloned()
                    .unwrap_or_default(),
            }),
        }
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}
