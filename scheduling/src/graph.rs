//! Dependency graph shared by the task DAG and the resource DAG.

use crate::{containers::RandomState, error::SchedulerError};
use petgraph::{
    Directed, Direction,
    algo::{self, DfsSpace},
    graphmap::GraphMap,
};
use std::{fmt, hash::Hash};

/// A directed acyclic graph over dense integer identifiers.
///
/// Generalized so the same adjacency bookkeeping backs both the task
/// dependency graph and the resource dependency graph, grounded on
/// `impact_scheduling`'s inline `TaskDependencyGraph`: a
/// `petgraph::graphmap::GraphMap` plus a reusable `DfsSpace` for
/// `algo::toposort`.
pub(crate) struct Dag<Id: Copy + Ord + Hash> {
    graph: GraphMap<Id, (), Directed, RandomState>,
    space: DfsSpace<Id, hashbrown::HashSet<Id>>,
}

impl<Id: Copy + Ord + Hash> fmt::Debug for Dag<Id> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dag")
            .field("n_nodes", &self.graph.node_count())
            .field("n_edges", &self.graph.edge_count())
            .finish()
    }
}

impl<Id: Copy + Ord + Hash> Dag<Id> {
    pub fn new() -> Self {
        let graph = GraphMap::new();
        let space = DfsSpace::new(&graph);
        Self { graph, space }
    }

    pub fn add_node(&mut self, id: Id) {
        self.graph.add_node(id);
    }

    /// Adds an edge from `parent` to `child`. Rejects a self-edge. Adding
    /// the same edge twice is a no-op beyond the first time, since the
    /// underlying graph is already set-valued per node pair.
    pub fn add_edge(&mut self, parent: Id, child: Id) -> Result<(), SchedulerError> {
        if parent == child {
            return Err(SchedulerError::SelfEdge);
        }
        self.graph.add_edge(parent, child, ());
        Ok(())
    }

    /// Ids with an edge directed into `id`, i.e. the nodes `id` depends on.
    pub fn parents(&self, id: Id) -> impl Iterator<Item = Id> + '_ {
        self.graph.neighbors_directed(id, Direction::Incoming)
    }

    /// Ids with an edge directed out of `id`, i.e. the nodes depending on
    /// `id`. Used only to decide whether `id` is a leaf (has no children);
    /// never relied upon for iteration order.
    pub fn children(&self, id: Id) -> impl Iterator<Item = Id> + '_ {
        self.graph.neighbors_directed(id, Direction::Outgoing)
    }

    /// Returns ids in topological order: every id comes after every id it
    /// depends on. Fails if the graph contains a cycle.
    pub fn toposort(&mut self) -> Result<Vec<Id>, SchedulerError> {
        algo::toposort(&self.graph, Some(&mut self.space)).map_err(|_cycle| SchedulerError::CycleDetected)
    }
}

impl<Id: Copy + Ord + Hash> Default for Dag<Id> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TaskId;

    fn id(n: u64) -> TaskId {
        TaskId::new(0, n)
    }

    #[test]
    fn self_edge_is_rejected() {
        let mut dag = Dag::new();
        dag.add_node(id(0));
        assert!(matches!(dag.add_edge(id(0), id(0)), Err(SchedulerError::SelfEdge)));
    }

    #[test]
    fn toposort_orders_dependencies_before_dependents() {
        let mut dag: Dag<TaskId> = Dag::new();
        for n in 0..3 {
            dag.add_node(id(n));
        }
        dag.add_edge(id(0), id(1)).unwrap();
        dag.add_edge(id(1), id(2)).unwrap();

        let order = dag.toposort().unwrap();
        let position = |needle: TaskId| order.iter().position(|&i| i == needle).unwrap();
        assert!(position(id(0)) < position(id(1)));
        assert!(position(id(1)) < position(id(2)));
    }

    #[test]
    fn cycle_is_detected() {
        let mut dag: Dag<TaskId> = Dag::new();
        dag.add_node(id(0));
        dag.add_node(id(1));
        dag.add_edge(id(0), id(1)).unwrap();
        dag.add_edge(id(1), id(0)).unwrap();

        assert!(matches!(dag.toposort(), Err(SchedulerError::CycleDetected)));
    }

    #[test]
    fn adding_the_same_edge_twice_is_idempotent() {
        let mut dag: Dag<TaskId> = Dag::new();
        dag.add_node(id(0));
        dag.add_node(id(1));
        dag.add_edge(id(0), id(1)).unwrap();
        dag.add_edge(id(0), id(1)).unwrap();
        assert_eq!(dag.parents(id(1)).count(), 1);
        assert_eq!(dag.children(id(0)).count(), 1);
    }

    #[test]
    fn parents_and_children_are_queryable() {
        let mut dag: Dag<TaskId> = Dag::new();
        for n in 0..3 {
            dag.add_node(id(n));
        }
        dag.add_edge(id(0), id(2)).unwrap();
        dag.add_edge(id(1), id(2)).unwrap();

        let mut parents: Vec<_> = dag.parents(id(2)).collect();
        parents.sort();
        assert_eq!(parents, vec![id(0), id(1)]);
        assert_eq!(dag.children(id(2)).count(), 0);
    }
}
