//! Cut selection for each partitioning strategy.
//!
//! Strategies only choose which subtrees become their own partitions; the
//! root itself is never cut. Returning no cuts means "render as a single
//! partition".

use super::Cut;
use crate::config::PartitionStrategy;
use crate::task::TaskPriority;
use crate::tree::{Node, NodePath};

/// Returns the cuts for `tree` and the root partition's priority.
pub(crate) fn select(
    strategy: PartitionStrategy,
    tree: &Node,
    total_work: u64,
    target_partitions: usize,
) -> (Vec<Cut>, TaskPriority) {
    match strategy {
        PartitionStrategy::Depth { level } => (by_depth(tree, level), TaskPriority::Normal),
        PartitionStrategy::Size { threshold } => (by_size(tree, threshold), TaskPriority::Normal),
        PartitionStrategy::Hybrid {
            max_depth,
            min_size,
            max_size,
        } => {
            if target_partitions <= 1 || total_work < min_size {
                return (Vec::new(), TaskPriority::High);
            }
            (hybrid(tree, max_depth, max_size), hybrid_priority(0))
        }
        PartitionStrategy::WorkBalanced { target_work } => {
            if total_work <= target_work {
                return (Vec::new(), TaskPriority::Normal);
            }
            (work_balanced(tree, target_work), TaskPriority::Normal)
        }
    }
}

fn single(path: NodePath, node: &Node, priority: TaskPriority) -> Cut {
    Cut {
        depth: path.depth(),
        roots: vec![path],
        work: node.estimated_work(),
        priority,
    }
}

fn children_of<'a>(node: &'a Node, path: &NodePath) -> impl DoubleEndedIterator<Item = (NodePath, &'a Node)> + use<'a> {
    let path = path.clone();
    node.children
        .iter()
        .enumerate()
        .map(move |(i, child)| (path.child(i as u32), child))
}

/// Cuts every node at exactly `level`.
fn by_depth(tree: &Node, level: u32) -> Vec<Cut> {
    if level == 0 {
        return Vec::new();
    }
    let mut cuts = Vec::new();
    let mut stack = vec![(NodePath::root(), tree)];
    while let Some((path, node)) = stack.pop() {
        if path.depth() == level {
            cuts.push(single(path, node, TaskPriority::Normal));
            continue;
        }
        stack.extend(children_of(node, &path).rev());
    }
    cuts
}

/// Cuts the topmost subtrees whose work reaches `threshold`.
fn by_size(tree: &Node, threshold: u64) -> Vec<Cut> {
    let mut cuts = Vec::new();
    let mut stack: Vec<_> = children_of(tree, &NodePath::root()).rev().collect();
    while let Some((path, node)) = stack.pop() {
        if node.estimated_work() >= threshold {
            cuts.push(single(path, node, TaskPriority::Normal));
        } else {
            stack.extend(children_of(node, &path).rev());
        }
    }
    cuts
}

fn hybrid_priority(depth: u32) -> TaskPriority {
    if depth < 2 {
        TaskPriority::High
    } else {
        TaskPriority::Normal
    }
}

/// Cuts large subtrees early and everything at `max_depth`.
///
/// At `max_depth` every subtree is cut whatever its size, so `min_size` only
/// matters for the whole-tree degenerate case in [`select`].
fn hybrid(tree: &Node, max_depth: u32, max_size: u64) -> Vec<Cut> {
    let mut cuts = Vec::new();
    let mut stack: Vec<_> = children_of(tree, &NodePath::root()).rev().collect();
    while let Some((path, node)) = stack.pop() {
        let depth = path.depth();
        if depth >= max_depth || node.estimated_work() >= max_size {
            cuts.push(single(path, node, hybrid_priority(depth)));
        } else {
            stack.extend(children_of(node, &path).rev());
        }
    }
    cuts
}

struct Batcher {
    target: u64,
    roots: Vec<NodePath>,
    work: u64,
    depth: u32,
    cuts: Vec<Cut>,
}

impl Batcher {
    fn add(&mut self, path: NodePath, work: u64) {
        if !self.roots.is_empty() && self.work + work > self.target {
            self.flush();
        }
        self.depth = if self.roots.is_empty() {
            path.depth()
        } else {
            self.depth.min(path.depth())
        };
        self.work += work;
        self.roots.push(path);
    }

    fn flush(&mut self) {
        if self.roots.is_empty() {
            return;
        }
        self.cuts.push(Cut {
            roots: std::mem::take(&mut self.roots),
            work: std::mem::take(&mut self.work),
            depth: self.depth,
            priority: TaskPriority::Normal,
        });
    }
}

/// Batches subtrees in document order up to `target` work each.
///
/// A subtree heavier than `target` is not batched whole: its node stays with
/// the root partition and its children are offered to the batcher instead.
/// Leaves heavier than `target` form a batch of their own.
fn work_balanced(tree: &Node, target: u64) -> Vec<Cut> {
    let mut batcher = Batcher {
        target,
        roots: Vec::new(),
        work: 0,
        depth: 0,
        cuts: Vec::new(),
    };

    let mut stack: Vec<_> = children_of(tree, &NodePath::root()).rev().collect();
    while let Some((path, node)) = stack.pop() {
        let work = node.estimated_work();
        if work > target && !node.children.is_empty() {
            stack.extend(children_of(node, &path).rev());
        } else {
            batcher.add(path, work);
        }
    }
    batcher.flush();
    batcher.cuts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wide() -> Node {
        // root(3) -> 6 text leaves (2 each)
        Node::element("ul").with_children((0..6).map(|i| Node::text(format!("item {i}"))))
    }

    #[test]
    fn test_work_balanced_batches_in_document_order() {
        let cuts = work_balanced(&wide(), 4);
        let roots: Vec<Vec<String>> = cuts
            .iter()
            .map(|c| c.roots.iter().map(|p| p.to_string()).collect())
            .collect();
        assert_eq!(
            roots,
            vec![vec!["/0", "/1"], vec!["/2", "/3"], vec!["/4", "/5"]]
        );
        assert!(cuts.iter().all(|c| c.work == 4 && c.depth == 1));
    }

    #[test]
    fn test_work_balanced_flushes_partial_batch() {
        let cuts = work_balanced(&wide(), 5);
        assert_eq!(cuts.len(), 3);
        assert_eq!(cuts.last().map(|c| c.roots.len()), Some(2));
    }

    #[test]
    fn test_size_stops_at_first_heavy_subtree() {
        let tree = Node::element("div")
            .with_child(Node::component("Heavy").with_children((0..4).map(|_| Node::component("Leaf"))))
            .with_child(Node::text("light"));
        let cuts = by_size(&tree, 20);
        assert_eq!(cuts.len(), 1);
        assert_eq!(cuts[0].roots[0].to_string(), "/0");
        assert_eq!(cuts[0].work, 30);
    }

    #[test]
    fn test_hybrid_forces_cut_at_max_depth() {
        let tree = Node::element("div").with_child(Node::element("p").with_child(Node::text("x")));
        let cuts = hybrid(&tree, 2, 1_000);
        assert_eq!(cuts.len(), 1);
        assert_eq!(cuts[0].roots[0].to_string(), "/0/0");
        assert_eq!(cuts[0].priority, TaskPriority::Normal);
    }

    #[test]
    fn test_hybrid_cuts_heavy_subtree_early() {
        let heavy = Node::element("ul").with_children((0..40).map(|i| Node::text(format!("item {i}"))));
        let light = Node::element("p").with_child(Node::text("x"));
        let tree = Node::element("div").with_child(heavy.clone()).with_child(light);
        let cuts = hybrid(&tree, 2, heavy.estimated_work());

        assert_eq!(cuts[0].roots[0].to_string(), "/0");
        assert_eq!(cuts[0].priority, TaskPriority::High);
        // The light branch is only cut once it reaches max_depth
        assert_eq!(cuts.len(), 2);
        assert_eq!(cuts[1].roots[0].to_string(), "/1/0");
        assert_eq!(cuts[1].priority, TaskPriority::Normal);
    }
}
