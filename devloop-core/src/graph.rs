//! Target dependency graph.
//!
//! Edges run from a dependency to its dependent, so a topological order is
//! a valid build order: image targets come before the Kubernetes targets
//! that consume them.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::error::ConfigError;
use crate::types::{TargetDefinition, TargetName};

/// A validated, acyclic graph of target dependencies.
pub struct TargetGraph {
    graph: DiGraph<TargetName, ()>,
    nodes: HashMap<TargetName, NodeIndex>,
    order: Vec<TargetName>,
}

impl TargetGraph {
    /// Build the graph for `targets`.
    ///
    /// # Errors
    ///
    /// - `DuplicateTarget` if two targets share a name
    /// - `UnknownDependency` if a dependency names no declared target
    /// - `DependencyCycle` if the dependencies are not acyclic (including a
    ///   target that depends on itself)
    pub fn build(targets: &[TargetDefinition]) -> Result<Self, ConfigError> {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();

        for def in targets {
            if nodes.contains_key(&def.name) {
                return Err(ConfigError::DuplicateTarget {
                    name: def.name.0.clone(),
                });
            }
            let idx = graph.add_node(def.name.clone());
            nodes.insert(def.name.clone(), idx);
        }

        for def in targets {
            let dependent = nodes[&def.name];
            for dep in &def.deps {
                let Some(&dependency) = nodes.get(dep) else {
                    return Err(ConfigError::UnknownDependency {
                        target: def.name.0.clone(),
                        dependency: dep.0.clone(),
                    });
                };
                if dependency == dependent {
                    return Err(ConfigError::DependencyCycle {
                        target: def.name.0.clone(),
                    });
                }
                graph.update_edge(dependency, dependent, ());
            }
        }

        let order = toposort(&graph, None)
            .map_err(|cycle| ConfigError::DependencyCycle {
                target: graph[cycle.node_id()].0.clone(),
            })?
            .into_iter()
            .map(|idx| graph[idx].clone())
            .collect();

        Ok(Self {
            graph,
            nodes,
            order,
        })
    }

    /// Targets in dependency order (dependencies first).
    pub fn topo_order(&self) -> &[TargetName] {
        &self.order
    }

    /// Targets that list `name` directly in their `deps`.
    pub fn direct_dependents(&self, name: &TargetName) -> Vec<TargetName> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// Every target `name` depends on, directly or transitively.
    pub fn ancestors(&self, name: &TargetName) -> Vec<TargetName> {
        let Some(&start) = self.nodes.get(name) else {
            return vec![];
        };
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            for parent in self.graph.neighbors_directed(idx, Direction::Incoming) {
                if seen.insert(parent) {
                    stack.push(parent);
                }
            }
        }
        let mut out: Vec<TargetName> = seen.into_iter().map(|idx| self.graph[idx].clone()).collect();
        out.sort();
        out
    }

    fn neighbors(&self, name: &TargetName, direction: Direction) -> Vec<TargetName> {
        let Some(&idx) = self.nodes.get(name) else {
            return vec![];
        };
        let mut out: Vec<TargetName> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        out.sort();
        out
    }
}
