//! Dependency graph over task IDs.
//!
//! Edges point from a dependency to its dependent, so "A depends on B" is
//! stored as `B -> A`. Every mutation keeps the graph acyclic: an edge
//! that would close a cycle is rejected before it is applied.

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::debug;

/// Summary counts for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct GraphStats {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub nodes_without_dependencies: usize,
    pub nodes_without_dependents: usize,
}

/// The task dependency graph.
///
/// Node indices follow insertion order, which is what every ordering
/// operation uses to break ties.
pub struct DependencyGraph {
    /// The underlying directed graph.
    graph: DiGraph<TaskId, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    index: HashMap<TaskId, NodeIndex>,
}

impl DependencyGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Add a node. Adding an existing ID returns its current index.
    pub fn add_node(&mut self, id: TaskId) -> NodeIndex {
        if let Some(&index) = self.index.get(&id) {
            return index;
        }

        let index = self.graph.add_node(id);
        self.index.insert(id, index);
        debug!(task = %id.short(), "graph node added");
        index
    }

    /// Record that `node` depends on `depends_on`.
    ///
    /// Missing endpoints are added. The edge is rejected with
    /// [`Error::Cycle`] when `node` already reaches `depends_on` through
    /// dependent edges; a self-dependency is always rejected.
    pub fn add_dependency(&mut self, node: TaskId, depends_on: TaskId) -> Result<()> {
        let node_idx = self.add_node(node);
        let dep_idx = self.add_node(depends_on);

        if self.graph.find_edge(dep_idx, node_idx).is_some() {
            return Ok(());
        }

        if has_path_connecting(&self.graph, node_idx, dep_idx, None) {
            return Err(Error::Cycle { node, depends_on });
        }

        self.graph.add_edge(dep_idx, node_idx, ());
        debug!(
            task = %node.short(),
            depends_on = %depends_on.short(),
            "dependency added"
        );
        Ok(())
    }

    /// Remove the edge `node` depends on `depends_on`. Returns whether it
    /// existed.
    pub fn remove_dependency(&mut self, node: &TaskId, depends_on: &TaskId) -> bool {
        let (Some(&node_idx), Some(&dep_idx)) = (self.index.get(node), self.index.get(depends_on))
        else {
            return false;
        };

        match self.graph.find_edge(dep_idx, node_idx) {
            Some(edge) => {
                self.graph.remove_edge(edge);
                debug!(task = %node.short(), depends_on = %depends_on.short(), "dependency removed");
                true
            }
            None => false,
        }
    }

    /// Remove a node together with all of its edges.
    ///
    /// petgraph moves the last node into the freed slot, so the index of
    /// that node is patched up afterwards.
    pub fn remove_node(&mut self, id: &TaskId) -> bool {
        let Some(index) = self.index.remove(id) else {
            return false;
        };

        self.graph.remove_node(index);
        if let Some(&moved) = self.graph.node_weight(index) {
            self.index.insert(moved, index);
        }
        true
    }

    /// Tasks that `id` depends on.
    pub fn get_dependencies(&self, id: &TaskId) -> BTreeSet<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that depend on `id`.
    pub fn get_dependents(&self, id: &TaskId) -> BTreeSet<TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> BTreeSet<TaskId> {
        match self.index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .map(|n| self.graph[n])
                .collect(),
            None => BTreeSet::new(),
        }
    }

    fn deps_satisfied(&self, index: NodeIndex, completed: &HashSet<TaskId>) -> bool {
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .all(|dep| completed.contains(&self.graph[dep]))
    }

    /// Check whether every dependency of `id` is in `completed`.
    ///
    /// Unknown IDs have no dependencies and are therefore executable.
    pub fn can_execute(&self, id: &TaskId, completed: &HashSet<TaskId>) -> bool {
        match self.index.get(id) {
            Some(&index) => self.deps_satisfied(index, completed),
            None => true,
        }
    }

    /// Nodes not yet completed whose dependencies are all completed,
    /// in insertion order.
    pub fn get_ready_nodes(&self, completed: &HashSet<TaskId>) -> Vec<TaskId> {
        self.graph
            .node_indices()
            .filter(|&index| {
                !completed.contains(&self.graph[index]) && self.deps_satisfied(index, completed)
            })
            .map(|index| self.graph[index])
            .collect()
    }

    /// Order every node after all of its dependencies (Kahn's algorithm).
    ///
    /// Zero in-degree nodes are taken in insertion order.
    pub fn topological_sort(&self) -> Result<Vec<TaskId>> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|index| {
                self.graph
                    .neighbors_directed(index, Direction::Incoming)
                    .count()
            })
            .collect();

        let mut queue: VecDeque<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|index| in_degree[index.index()] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.graph.node_count());

        while let Some(index) = queue.pop_front() {
            order.push(self.graph[index]);

            // petgraph yields neighbors newest-edge first; sort to keep
            // discovery order stable.
            let mut dependents: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(index, Direction::Outgoing)
                .collect();
            dependents.sort();
            for dependent in dependents {
                let degree = &mut in_degree[dependent.index()];
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if order.len() != self.graph.node_count() {
            return Err(Error::CycleDetected(format!(
                "{} of {} tasks could not be ordered",
                self.graph.node_count() - order.len(),
                self.graph.node_count()
            )));
        }

        Ok(order)
    }

    /// Group nodes into layers; every node in a layer depends only on
    /// nodes in earlier layers, so a layer can run in parallel.
    pub fn get_execution_layers(&self) -> Result<Vec<Vec<TaskId>>> {
        let mut layers = Vec::new();
        let mut completed: HashSet<TaskId> = HashSet::new();

        while completed.len() < self.graph.node_count() {
            let ready = self.get_ready_nodes(&completed);
            if ready.is_empty() {
                return Err(Error::CycleDetected(
                    "cannot build execution layers, remaining tasks form a cycle".to_string(),
                ));
            }
            completed.extend(ready.iter().copied());
            layers.push(ready);
        }

        Ok(layers)
    }

    /// Check whether the graph contains a cycle.
    pub fn has_cycle(&self) -> bool {
        self.topological_sort().is_err()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// Get the number of nodes.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Get the number of dependency edges.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All node IDs in insertion order.
    pub fn nodes(&self) -> Vec<TaskId> {
        self.graph.node_weights().copied().collect()
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            total_nodes: self.graph.node_count(),
            total_edges: self.graph.edge_count(),
            nodes_without_dependencies: self
                .graph
                .externals(Direction::Incoming)
                .count(),
            nodes_without_dependents: self.graph.externals(Direction::Outgoing).count(),
        }
    }

    pub fn clear(&mut self) {
        self.graph.clear();
        self.index.clear();
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("nodes", &self.len())
            .field("edges", &self.edge_count())
            .finish()
    }
}
