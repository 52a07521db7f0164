//! Reassembles rendered partitions into one tree.
//!
//! The output covering the root becomes the base; every other root subtree is
//! then written over the placeholder at its recorded path. Shallower paths are
//! placed first so a deeper root always lands inside an already placed
//! subtree.

use crate::error::MergeError;
use crate::partition::{PartitionOutput, PartitionRoot};
use crate::tree::Node;
use tracing::trace;

/// Merges partition outputs into a full tree.
pub fn merge_outputs(outputs: Vec<PartitionOutput>) -> Result<Node, MergeError> {
    let mut roots: Vec<PartitionRoot> = outputs.into_iter().flat_map(|o| o.roots).collect();
    roots.sort_by(|a, b| a.path.depth().cmp(&b.path.depth()).then_with(|| a.path.cmp(&b.path)));

    let mut roots = roots.into_iter();
    let mut tree = match roots.next() {
        Some(first) if first.path.is_root() => first.node,
        _ => return Err(MergeError::MissingRoot),
    };

    for root in roots {
        trace!(path = %root.path, "Placing partition root");
        if tree.replace_at(&root.path, root.node).is_none() {
            return Err(MergeError::InvalidPath(root.path));
        }
    }
    Ok(tree)
}
