//! Serialized partition inputs and outputs.
//!
//! A partition's payload carries copies of its root subtrees with every
//! subtree owned by another partition replaced by a placeholder fragment.
//! Workers render the payload and return the same shape as a
//! [`PartitionOutput`], which the merge step places back by path.

use super::{Partition, PartitionId, find, foreign_roots};
use crate::error::PartitionError;
use crate::tree::{Node, NodePath, Rebuild};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One root subtree of a partition, with its position in the full tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRoot {
    pub path: NodePath,
    #[serde(with = "flat")]
    pub node: Node,
}

/// Input for rendering one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPayload {
    pub partition_id: PartitionId,
    pub roots: Vec<PartitionRoot>,
}

/// Rendered partition, same shape as its payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOutput {
    pub partition_id: PartitionId,
    pub roots: Vec<PartitionRoot>,
}

impl PartitionPayload {
    /// Builds the payload for partition `id` of `tree`.
    pub fn extract(tree: &Node, partitions: &[Partition], id: PartitionId) -> Result<Self, PartitionError> {
        let partition = find(partitions, id)?;
        let holes = foreign_roots(partitions, id);

        let roots = partition
            .roots
            .iter()
            .map(|path| {
                let node = tree
                    .at(path)
                    .ok_or(PartitionError::UnknownPartition { partition: id.0 })?;
                Ok(PartitionRoot {
                    path: path.clone(),
                    node: copy_with_holes(node, path, &holes),
                })
            })
            .collect::<Result<Vec<_>, PartitionError>>()?;

        Ok(Self {
            partition_id: id,
            roots,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PartitionError> {
        serde_json::to_vec(self).map_err(|e| PartitionError::Serialize {
            partition: self.partition_id.0,
            reason: e.to_string(),
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl PartitionOutput {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Copy of `node` with foreign partition roots replaced by placeholders.
fn copy_with_holes(node: &Node, path: &NodePath, holes: &BTreeMap<NodePath, PartitionId>) -> Node {
    node.rebuild(path, |at, original| match holes.get(at) {
        Some(owner) if at != path => Rebuild::Replace(Node::placeholder(owner.0)),
        _ => Rebuild::Descend(original.shallow_copy()),
    })
}

/// Subtrees travel as a flat pre-order list so nesting depth never reaches
/// the decoder's recursion limit.
mod flat {
    use crate::tree::{Node, NodeKind};
    use serde::de::Error as _;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    /// One node; its `children` direct children follow it in the list.
    #[derive(Serialize)]
    struct FlatRef<'a> {
        kind: NodeKind,
        #[serde(skip_serializing_if = "no_name")]
        name: &'a str,
        #[serde(skip_serializing_if = "no_props")]
        props: &'a BTreeMap<String, String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<&'a str>,
        #[serde(skip_serializing_if = "is_zero")]
        children: usize,
    }

    #[derive(Deserialize)]
    struct FlatNode {
        kind: NodeKind,
        #[serde(default)]
        name: String,
        #[serde(default)]
        props: BTreeMap<String, String>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        children: usize,
    }

    fn no_name(name: &&str) -> bool {
        name.is_empty()
    }

    fn no_props(props: &&BTreeMap<String, String>) -> bool {
        props.is_empty()
    }

    fn is_zero(n: &usize) -> bool {
        *n == 0
    }

    pub fn serialize<S: Serializer>(node: &Node, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(None)?;
        let mut stack = vec![node];
        while let Some(node) = stack.pop() {
            seq.serialize_element(&FlatRef {
                kind: node.kind,
                name: &node.name,
                props: &node.props,
                text: node.text.as_deref(),
                children: node.children.len(),
            })?;
            stack.extend(node.children.iter().rev());
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Node, D::Error> {
        let flat = Vec::<FlatNode>::deserialize(deserializer)?;
        let mut open: Vec<(Node, usize)> = Vec::new();
        let mut root = None;

        for entry in flat {
            if root.is_some() {
                return Err(D::Error::custom("nodes after the end of the subtree"));
            }
            let pending = entry.children;
            let mut node = Node {
                kind: entry.kind,
                name: entry.name,
                props: entry.props,
                text: entry.text,
                children: Vec::with_capacity(pending.min(1024)),
            };
            if pending > 0 {
                open.push((node, pending));
                continue;
            }
            // Attach the finished node, closing every parent it completes
            loop {
                match open.last_mut() {
                    None => {
                        root = Some(node);
                        break;
                    }
                    Some((parent, remaining)) => {
                        parent.children.push(node);
                        *remaining -= 1;
                        if *remaining > 0 {
                            break;
                        }
                    }
                }
                let Some((done, _)) = open.pop() else {
                    break;
                };
                node = done;
            }
        }
        root.ok_or_else(|| D::Error::custom("truncated subtree"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PartitionStrategy;
    use crate::partition::TreePartitioner;
    use crate::tree::synthetic_tree;

    #[test]
    fn test_root_payload_has_placeholders() {
        let tree = synthetic_tree(3, 2);
        let partitions = TreePartitioner::new(PartitionStrategy::Depth { level: 1 })
            .partition(&tree)
            .unwrap();
        assert_eq!(partitions.len(), 3);

        let payload = PartitionPayload::extract(&tree, &partitions, PartitionId(0)).unwrap();
        let root = &payload.roots[0].node;
        assert_eq!(root.children.len(), 2);
        assert!(root.children.iter().all(Node::is_placeholder));
        assert_eq!(root.children[1].props["partition"], "2");
    }

    #[test]
    fn test_leaf_payload_is_full_subtree() {
        let tree = synthetic_tree(3, 2);
        let partitions = TreePartitioner::new(PartitionStrategy::Depth { level: 1 })
            .partition(&tree)
            .unwrap();
        let payload = PartitionPayload::extract(&tree, &partitions, PartitionId(2)).unwrap();
        assert_eq!(payload.roots.len(), 1);
        assert_eq!(payload.roots[0].path, NodePath::from(vec![1]));
        assert_eq!(&payload.roots[0].node, &tree.children[1]);

        let bytes = payload.to_bytes().unwrap();
        assert_eq!(PartitionPayload::from_bytes(&bytes).unwrap(), payload);
    }

    fn chain(depth: usize) -> Node {
        let mut node = Node::text("bottom");
        for level in (0..depth).rev() {
            node = Node::element("div").with_prop("level", level.to_string()).with_child(node);
        }
        node
    }

    #[test]
    fn test_deep_subtree_round_trips() {
        let tree = Node::fragment(vec![chain(400), Node::text("sibling")]);
        let partitions = TreePartitioner::new(PartitionStrategy::Depth { level: 1 })
            .partition(&tree)
            .unwrap();
        let payload = PartitionPayload::extract(&tree, &partitions, PartitionId(1)).unwrap();
        assert_eq!(payload.roots[0].node.max_depth(), 400);

        let bytes = payload.to_bytes().unwrap();
        let decoded = PartitionPayload::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(decoded.roots[0].node.node_count(), 401);
    }

    #[test]
    fn test_wire_format_is_flat() {
        let node = Node::element("ul")
            .with_child(Node::element("li").with_child(Node::text("a")))
            .with_child(Node::text("b"));
        let root = PartitionRoot {
            path: NodePath::root(),
            node,
        };
        let json = serde_json::to_value(&root).unwrap();
        let flat = json["node"].as_array().unwrap();
        assert_eq!(flat.len(), 4);
        assert_eq!(flat[0]["children"], 2);
        assert_eq!(flat[1]["name"], "li");
        assert_eq!(flat[2]["text"], "a");
        assert_eq!(flat[3]["text"], "b");
        assert!(flat[3].get("children").is_none());

        let back: PartitionRoot = serde_json::from_value(json).unwrap();
        assert_eq!(back, root);
    }

    #[test]
    fn test_truncated_subtree_rejected() {
        let json = r#"{"path":[],"node":[{"kind":"element","name":"ul","children":2},{"kind":"text","text":"a"}]}"#;
        assert!(serde_json::from_str::<PartitionRoot>(json).is_err());
        let trailing = r#"{"path":[],"node":[{"kind":"text","text":"a"},{"kind":"text","text":"b"}]}"#;
        assert!(serde_json::from_str::<PartitionRoot>(trailing).is_err());
    }

    #[test]
    fn test_unknown_partition() {
        let tree = synthetic_tree(1, 1);
        let partitions = TreePartitioner::new(PartitionStrategy::Depth { level: 1 })
            .partition(&tree)
            .unwrap();
        assert_eq!(
            PartitionPayload::extract(&tree, &partitions, PartitionId(7)),
            Err(PartitionError::UnknownPartition { partition: 7 })
        );
    }
}
