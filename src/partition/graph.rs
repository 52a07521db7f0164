//! Dependency ordering between partitions.
//!
//! Dependency edges point from a partition to the partitions it waits for.
//! Cycles never fail a render: the edge that closes a cycle is dropped,
//! logged and kept in [`DependencyGraph::cycles`] for inspection.

use super::{Partition, PartitionId};
use crate::task::TaskPriority;
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

#[derive(Debug, Clone)]
struct GraphNode {
    priority: TaskPriority,
    dependencies: Vec<PartitionId>,
}

/// Dispatch ordering for a partition set
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: BTreeMap<PartitionId, GraphNode>,
    order: Vec<PartitionId>,
    cycles: Vec<(PartitionId, PartitionId)>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl DependencyGraph {
    pub fn new(partitions: &[Partition]) -> Self {
        let mut nodes: BTreeMap<PartitionId, GraphNode> = partitions
            .iter()
            .map(|p| {
                (
                    p.id,
                    GraphNode {
                        priority: p.priority,
                        dependencies: p.dependencies.clone(),
                    },
                )
            })
            .collect();

        let known: HashSet<PartitionId> = nodes.keys().copied().collect();
        for (id, node) in nodes.iter_mut() {
            node.dependencies.retain(|dep| {
                let exists = known.contains(dep);
                if !exists {
                    warn!(partition = %id, dependency = %dep, "Ignoring dependency on unknown partition");
                }
                exists
            });
        }

        let (order, cycles) = topological_sort(&nodes);
        for (from, to) in &cycles {
            warn!(partition = %from, dependency = %to, "Breaking dependency cycle");
            if let Some(node) = nodes.get_mut(from) {
                node.dependencies.retain(|dep| dep != to);
            }
        }

        Self { nodes, order, cycles }
    }

    /// Partitions ordered so that dependencies come first
    pub fn topological_order(&self) -> &[PartitionId] {
        &self.order
    }

    /// Edges `(partition, dependency)` dropped to break cycles
    pub fn cycles(&self) -> &[(PartitionId, PartitionId)] {
        &self.cycles
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Partitions not yet completed whose dependencies all are, highest
    /// priority first, ties broken by id.
    pub fn ready_partitions(&self, completed: &HashSet<PartitionId>) -> Vec<PartitionId> {
        let mut ready: Vec<(TaskPriority, PartitionId)> = self
            .nodes
            .iter()
            .filter(|(id, node)| !completed.contains(*id) && node.dependencies.iter().all(|d| completed.contains(d)))
            .map(|(id, node)| (node.priority, *id))
            .collect();
        ready.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        ready.into_iter().map(|(_, id)| id).collect()
    }
}

/// Iterative depth-first post-order; returns the order and back edges.
fn topological_sort(nodes: &BTreeMap<PartitionId, GraphNode>) -> (Vec<PartitionId>, Vec<(PartitionId, PartitionId)>) {
    let mut marks: BTreeMap<PartitionId, Mark> = nodes.keys().map(|id| (*id, Mark::Unvisited)).collect();
    let mut order = Vec::with_capacity(nodes.len());
    let mut cycles = Vec::new();

    for &start in nodes.keys() {
        if marks[&start] != Mark::Unvisited {
            continue;
        }
        marks.insert(start, Mark::InProgress);
        let mut stack = vec![(start, 0usize)];

        while let Some((id, next)) = stack.last_mut() {
            let id = *id;
            let deps = &nodes[&id].dependencies;
            if *next < deps.len() {
                let dep = deps[*next];
                *next += 1;
                match marks[&dep] {
                    Mark::Unvisited => {
                        marks.insert(dep, Mark::InProgress);
                        stack.push((dep, 0));
                    }
                    Mark::InProgress => cycles.push((id, dep)),
                    Mark::Done => {}
                }
            } else {
                marks.insert(id, Mark::Done);
                order.push(id);
                stack.pop();
            }
        }
    }
    (order, cycles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::NodePath;

    fn partition(id: u32, priority: TaskPriority, deps: &[u32]) -> Partition {
        Partition {
            id: PartitionId(id),
            roots: vec![NodePath::from(vec![id])],
            estimated_work: 10,
            depth: 1,
            parent_id: None,
            child_ids: Vec::new(),
            dependencies: deps.iter().copied().map(PartitionId).collect(),
            priority,
        }
    }

    #[test]
    fn test_dependencies_come_first() {
        let graph = DependencyGraph::new(&[
            partition(0, TaskPriority::Normal, &[2]),
            partition(1, TaskPriority::Normal, &[0]),
            partition(2, TaskPriority::Normal, &[]),
        ]);
        let order = graph.topological_order();
        let pos = |id| order.iter().position(|p| *p == PartitionId(id)).unwrap();
        assert!(pos(2) < pos(0));
        assert!(pos(0) < pos(1));
        assert!(graph.cycles().is_empty());
    }

    #[test]
    fn test_cycle_is_broken_not_fatal() {
        let graph = DependencyGraph::new(&[
            partition(0, TaskPriority::Normal, &[1]),
            partition(1, TaskPriority::Normal, &[0]),
        ]);
        assert_eq!(graph.topological_order().len(), 2);
        assert_eq!(graph.cycles(), &[(PartitionId(1), PartitionId(0))]);

        // With the closing edge dropped, partition 1 is dispatchable
        let ready = graph.ready_partitions(&HashSet::new());
        assert_eq!(ready, vec![PartitionId(1)]);
    }

    #[test]
    fn test_ready_sorted_by_priority_then_id() {
        let graph = DependencyGraph::new(&[
            partition(0, TaskPriority::Low, &[]),
            partition(1, TaskPriority::High, &[]),
            partition(2, TaskPriority::Normal, &[]),
            partition(3, TaskPriority::High, &[]),
            partition(4, TaskPriority::High, &[0]),
        ]);
        let ready = graph.ready_partitions(&HashSet::new());
        assert_eq!(ready, vec![PartitionId(1), PartitionId(3), PartitionId(2), PartitionId(0)]);

        let completed: HashSet<_> = [PartitionId(0)].into_iter().collect();
        assert_eq!(graph.ready_partitions(&completed)[0], PartitionId(1));
        assert!(graph.ready_partitions(&completed).contains(&PartitionId(4)));
    }

    #[test]
    fn test_unknown_dependency_ignored() {
        let graph = DependencyGraph::new(&[partition(0, TaskPriority::Normal, &[9])]);
        assert_eq!(graph.ready_partitions(&HashSet::new()), vec![PartitionId(0)]);
    }
}
