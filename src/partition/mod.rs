//! Tree partitioning.
//!
//! A [`TreePartitioner`] splits a render tree into independently renderable
//! [`Partition`]s. Every strategy produces a covering set:
//!
//! - the root partition owns the root and every node outside a cut subtree
//! - every other partition owns one cut subtree, or a batch of them
//!
//! so each node is owned by exactly one partition. Partitions address the
//! tree through [`NodePath`]s and never mutate it.

pub mod analysis;
pub mod graph;
pub mod payload;
mod strategy;

pub use analysis::{PartitionQuality, analyze, analyze_work};
pub use graph::DependencyGraph;
pub use payload::{PartitionOutput, PartitionPayload, PartitionRoot};

use crate::config::PartitionStrategy;
use crate::error::PartitionError;
use crate::task::TaskPriority;
use crate::tree::{Node, NodePath};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tracing::debug;

/// Partition identifier, unique within one partitioning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub u32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// An independently renderable piece of the tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub id: PartitionId,
    /// Root paths; more than one means a batch rendered as one fragment
    pub roots: Vec<NodePath>,
    pub estimated_work: u64,
    pub depth: u32,
    pub parent_id: Option<PartitionId>,
    pub child_ids: Vec<PartitionId>,
    /// Partitions whose results must exist before this one is dispatched
    pub dependencies: Vec<PartitionId>,
    pub priority: TaskPriority,
}

impl Partition {
    /// Whether this partition owns the tree root
    pub fn is_root(&self) -> bool {
        self.roots.iter().any(NodePath::is_root)
    }

    /// Whether this partition batches several subtrees
    pub fn is_batch(&self) -> bool {
        self.roots.len() > 1
    }
}

/// A subtree (or batch of subtrees) selected by a strategy
#[derive(Debug, Clone)]
pub(crate) struct Cut {
    pub roots: Vec<NodePath>,
    pub work: u64,
    pub depth: u32,
    pub priority: TaskPriority,
}

/// Splits trees according to a [`PartitionStrategy`]
#[derive(Debug, Clone)]
pub struct TreePartitioner {
    strategy: PartitionStrategy,
    target_partitions: usize,
}

impl TreePartitioner {
    pub fn new(strategy: PartitionStrategy) -> Self {
        Self {
            strategy,
            target_partitions: num_cpus::get().max(1),
        }
    }

    /// Number of partitions the caller hopes to keep busy (usually the pool
    /// size). A target of 1 makes hybrid partitioning return the whole tree.
    pub fn with_target_partitions(mut self, target: usize) -> Self {
        self.target_partitions = target.max(1);
        self
    }

    pub fn strategy(&self) -> PartitionStrategy {
        self.strategy
    }

    pub fn target_partitions(&self) -> usize {
        self.target_partitions
    }

    fn validate(&self) -> Result<(), PartitionError> {
        let invalid = |reason| PartitionError::InvalidStrategy {
            strategy: self.strategy.name(),
            reason,
        };
        match self.strategy {
            PartitionStrategy::Depth { .. } => Ok(()),
            PartitionStrategy::Size { threshold } if threshold == 0 => Err(invalid("threshold must be positive")),
            PartitionStrategy::Size { .. } => Ok(()),
            PartitionStrategy::Hybrid { min_size, max_size, .. } if min_size > max_size => {
                Err(invalid("min_size exceeds max_size"))
            }
            PartitionStrategy::Hybrid { max_size, .. } if max_size == 0 => Err(invalid("max_size must be positive")),
            PartitionStrategy::Hybrid { .. } => Ok(()),
            PartitionStrategy::WorkBalanced { target_work } if target_work == 0 => {
                Err(invalid("target_work must be positive"))
            }
            PartitionStrategy::WorkBalanced { .. } => Ok(()),
        }
    }

    /// Partitions `tree`. The result always has at least one partition, and
    /// the root partition is always first.
    pub fn partition(&self, tree: &Node) -> Result<Vec<Partition>, PartitionError> {
        self.validate()?;

        let total_work = tree.estimated_work();
        let (cuts, root_priority) = strategy::select(self.strategy, tree, total_work, self.target_partitions);
        let partitions = assemble(total_work, cuts, root_priority);

        debug!(
            strategy = self.strategy.name(),
            partitions = partitions.len(),
            total_work,
            "Partitioned tree"
        );
        Ok(partitions)
    }

    /// Paths of every node `id` owns, in document order.
    pub fn owned_paths(tree: &Node, partitions: &[Partition], id: PartitionId) -> Result<Vec<NodePath>, PartitionError> {
        let partition = find(partitions, id)?;
        let holes = foreign_roots(partitions, id);

        let mut owned = Vec::new();
        for root in &partition.roots {
            let Some(node) = tree.at(root) else {
                continue;
            };
            let mut stack = vec![(root.clone(), node)];
            while let Some((path, node)) = stack.pop() {
                owned.push(path.clone());
                for (i, child) in node.children.iter().enumerate().rev() {
                    let child_path = path.child(i as u32);
                    if !holes.contains_key(&child_path) {
                        stack.push((child_path, child));
                    }
                }
            }
        }
        Ok(owned)
    }
}

/// Turns strategy cuts into a covering partition set.
fn assemble(total_work: u64, cuts: Vec<Cut>, root_priority: TaskPriority) -> Vec<Partition> {
    let cut_work: u64 = cuts.iter().map(|c| c.work).sum();
    let root_id = PartitionId(0);

    let mut partitions = Vec::with_capacity(cuts.len() + 1);
    partitions.push(Partition {
        id: root_id,
        roots: vec![NodePath::root()],
        estimated_work: total_work.saturating_sub(cut_work),
        depth: 0,
        parent_id: None,
        child_ids: (1..=cuts.len() as u32).map(PartitionId).collect(),
        dependencies: Vec::new(),
        priority: root_priority,
    });

    for (i, cut) in cuts.into_iter().enumerate() {
        partitions.push(Partition {
            id: PartitionId(i as u32 + 1),
            roots: cut.roots,
            estimated_work: cut.work,
            depth: cut.depth,
            parent_id: Some(root_id),
            child_ids: Vec::new(),
            dependencies: Vec::new(),
            priority: cut.priority,
        });
    }
    partitions
}

pub(crate) fn find(partitions: &[Partition], id: PartitionId) -> Result<&Partition, PartitionError> {
    partitions
        .iter()
        .find(|p| p.id == id)
        .ok_or(PartitionError::UnknownPartition { partition: id.0 })
}

/// Root paths owned by partitions other than `id`
pub(crate) fn foreign_roots(partitions: &[Partition], id: PartitionId) -> BTreeMap<NodePath, PartitionId> {
    partitions
        .iter()
        .filter(|p| p.id != id)
        .flat_map(|p| p.roots.iter().map(move |r| (r.clone(), p.id)))
        .filter(|(path, _)| !path.is_root())
        .collect()
}

/// Checks that `partitions` own every node of `tree` exactly once.
pub fn is_exact_cover(tree: &Node, partitions: &[Partition]) -> bool {
    let mut seen = HashSet::new();
    for partition in partitions {
        let Ok(paths) = TreePartitioner::owned_paths(tree, partitions, partition.id) else {
            return false;
        };
        for path in paths {
            if !seen.insert(path) {
                return false;
            }
        }
    }
    seen.len() == tree.node_count()
}
