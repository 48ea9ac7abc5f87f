//! Graph analysis: dependency structure, cycle detection, execution phases
//!
//! Phases are computed with a level-grouped variant of Kahn's algorithm. Phase
//! 0 holds every node without incoming edges; phase `k + 1` holds the nodes
//! whose in-degree drops to zero once phase `k` is removed. Nodes inside one
//! phase never depend on each other.

use std::collections::{HashMap, HashSet};

use crate::error::GraphError;
use crate::types::{NodeId, WorkflowGraph};

/// Ordered execution phases of a graph
pub type Phases = Vec<Vec<NodeId>>;

/// Adjacency and in-degree view of a graph snapshot
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Node ids in snapshot order
    order: Vec<NodeId>,
    /// Downstream neighbours per node, one entry per edge
    adjacency: HashMap<NodeId, Vec<NodeId>>,
    /// Number of incoming edges per node
    in_degree: HashMap<NodeId, usize>,
}

impl DependencyGraph {
    /// Build the dependency view.
    ///
    /// Edges whose source or target is not a node of the snapshot carry no
    /// dependency and are skipped.
    pub fn build(graph: &WorkflowGraph) -> Result<Self, GraphError> {
        let mut order = Vec::with_capacity(graph.nodes.len());
        let mut adjacency: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();

        for node in &graph.nodes {
            if in_degree.insert(node.id.clone(), 0).is_some() {
                return Err(GraphError::DuplicateNodeId(node.id.clone()));
            }
            adjacency.insert(node.id.clone(), Vec::new());
            order.push(node.id.clone());
        }

        for edge in &graph.edges {
            if !in_degree.contains_key(&edge.source) || !in_degree.contains_key(&edge.target) {
                log::warn!(
                    "Ignoring edge '{}' ({} -> {}): endpoint not in graph",
                    edge.id,
                    edge.source,
                    edge.target
                );
                continue;
            }
            if let Some(neighbours) = adjacency.get_mut(&edge.source) {
                neighbours.push(edge.target.clone());
            }
            if let Some(deg) = in_degree.get_mut(&edge.target) {
                *deg += 1;
            }
        }

        Ok(Self {
            order,
            adjacency,
            in_degree,
        })
    }

    /// Number of nodes
    pub fn node_count(&self) -> usize {
        self.order.len()
    }

    /// Number of incoming edges of a node
    pub fn in_degree(&self, node_id: &str) -> Option<usize> {
        self.in_degree.get(node_id).copied()
    }

    /// Downstream neighbours of a node (one entry per edge)
    pub fn neighbours(&self, node_id: &str) -> &[NodeId] {
        self.adjacency
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Group nodes into execution phases.
    ///
    /// Fails with [`GraphError::CycleDetected`] if any node cannot be placed;
    /// no partial phases are returned in that case.
    pub fn phases(&self) -> Result<Phases, GraphError> {
        let mut in_degree = self.in_degree.clone();
        let mut phases: Phases = Vec::new();
        let mut visited = 0usize;

        let mut current: Vec<NodeId> = self
            .order
            .iter()
            .filter(|id| in_degree.get(*id) == Some(&0))
            .cloned()
            .collect();

        while !current.is_empty() {
            visited += current.len();

            let mut next = Vec::new();
            for node_id in &current {
                for neighbour in self.neighbours(node_id) {
                    if let Some(deg) = in_degree.get_mut(neighbour) {
                        *deg -= 1;
                        if *deg == 0 {
                            next.push(neighbour.clone());
                        }
                    }
                }
            }

            phases.push(current);
            current = next;
        }

        if visited < self.order.len() {
            let placed: HashSet<&NodeId> = phases.iter().flatten().collect();
            let unvisited = self
                .order
                .iter()
                .filter(|id| !placed.contains(id))
                .cloned()
                .collect();
            return Err(GraphError::CycleDetected { unvisited });
        }

        Ok(phases)
    }
}

/// Compute the execution phases of a graph
pub fn execution_phases(graph: &WorkflowGraph) -> Result<Phases, GraphError> {
    DependencyGraph::build(graph)?.phases()
}

/// A flat topological order of the graph (phases concatenated)
pub fn topological_order(graph: &WorkflowGraph) -> Result<Vec<NodeId>, GraphError> {
    Ok(execution_phases(graph)?.into_iter().flatten().collect())
}

/// Check that a graph can be executed, without keeping the phases
pub fn validate_dag(graph: &WorkflowGraph) -> Result<(), GraphError> {
    execution_phases(graph).map(|_| ())
}
