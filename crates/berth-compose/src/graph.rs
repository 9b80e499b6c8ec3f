//! Service dependency graph using `petgraph`.
//!
//! Edges point from a dependency to its dependent so that a topological
//! walk yields dependencies first.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};

use berth_common::error::{BerthError, ParseErrorKind, Result};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::model::Deployment;

/// A dependency graph of services.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    nodes: BTreeMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Creates an empty dependency graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the graph for every service in a deployment.
    ///
    /// # Errors
    ///
    /// Returns an unknown-reference error if a dependency names a service
    /// that is not declared.
    pub fn from_deployment(deployment: &Deployment) -> Result<Self> {
        let mut graph = Self::new();
        for service in &deployment.services {
            let _ = graph.add_service(&service.name);
        }
        for service in &deployment.services {
            for dependency in &service.depends_on {
                if !graph.nodes.contains_key(dependency) {
                    return Err(BerthError::parse(
                        ParseErrorKind::UnknownReference,
                        format!(
                            "service \"{}\" depends on undefined service \"{dependency}\"",
                            service.name
                        ),
                    ));
                }
                graph.add_dependency(&service.name, dependency);
            }
        }
        Ok(graph)
    }

    /// Adds a service node, returning the existing node if already present.
    pub fn add_service(&mut self, name: &str) -> NodeIndex {
        if let Some(&idx) = self.nodes.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(name.to_string());
        let _ = self.nodes.insert(name.to_string(), idx);
        idx
    }

    /// Records that `dependent` depends on `dependency`, adding nodes as needed.
    pub fn add_dependency(&mut self, dependent: &str, dependency: &str) {
        let from = self.add_service(dependency);
        let to = self.add_service(dependent);
        let _ = self.graph.update_edge(from, to, ());
    }

    /// Number of services in the graph.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Whether the graph has no services.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Direct dependencies of a service, sorted by name.
    #[must_use]
    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Direct dependents of a service, sorted by name.
    #[must_use]
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Outgoing)
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<&str> {
        let Some(&idx) = self.nodes.get(name) else {
            return Vec::new();
        };
        let mut names: Vec<&str> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n].as_str())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Returns a deterministic startup order, dependencies first.
    ///
    /// Among services whose dependencies are all satisfied, the
    /// lexicographically smallest name goes next.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::CyclicDependency`] if the graph has a cycle.
    /// No partial order is produced in that case.
    pub fn resolve_order(&self) -> Result<Vec<String>> {
        let mut pending: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                let deps = self
                    .graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .count();
                (idx, deps)
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<(&str, NodeIndex)>> = pending
            .iter()
            .filter(|(_, deps)| **deps == 0)
            .map(|(&idx, _)| Reverse((self.graph[idx].as_str(), idx)))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse((name, idx))) = ready.pop() {
            order.push(name.to_string());
            for dependent in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(count) = pending.get_mut(&dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(Reverse((self.graph[dependent].as_str(), dependent)));
                    }
                }
            }
        }

        if order.len() == self.graph.node_count() {
            Ok(order)
        } else {
            Err(BerthError::CyclicDependency {
                cycle: self.find_cycle().unwrap_or_default(),
            })
        }
    }

    /// Finds one dependency cycle, if any.
    ///
    /// The path starts and ends at the lexicographically smallest service of
    /// the first cyclic component and reads "depends on" left to right.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut components: Vec<Vec<NodeIndex>> = petgraph::algo::tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
            .collect();
        for scc in &mut components {
            scc.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
        }
        components.sort_by(|a, b| self.graph[a[0]].cmp(&self.graph[b[0]]));

        let scc = components.first()?;
        let members: HashSet<NodeIndex> = scc.iter().copied().collect();
        let start = scc[0];
        let mut path = vec![start];
        let mut visited = HashSet::from([start]);
        if !self.walk_dependencies(start, start, &members, &mut visited, &mut path) {
            return None;
        }
        path.push(start);
        Some(path.iter().map(|&idx| self.graph[idx].clone()).collect())
    }

    fn walk_dependencies(
        &self,
        current: NodeIndex,
        start: NodeIndex,
        members: &HashSet<NodeIndex>,
        visited: &mut HashSet<NodeIndex>,
        path: &mut Vec<NodeIndex>,
    ) -> bool {
        let mut next: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(current, Direction::Incoming)
            .filter(|n| members.contains(n))
            .collect();
        next.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));

        for candidate in next {
            if candidate == start {
                return true;
            }
            if visited.insert(candidate) {
                path.push(candidate);
                if self.walk_dependencies(candidate, start, members, visited, path) {
                    return true;
                }
                let _ = path.pop();
            }
        }
        false
    }
}
