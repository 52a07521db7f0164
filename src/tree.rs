//! Render tree input model.
//!
//! Nodes are plain owned values; partitions and merges refer to them through
//! [`NodePath`]s (child-index paths from the root) rather than pointers, so a
//! path stays meaningful across serialization boundaries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of a render tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Element,
    Text,
    Component,
    Fragment,
}

impl NodeKind {
    /// Per-kind work weight
    pub fn weight(&self) -> u64 {
        match self {
            NodeKind::Element => 2,
            NodeKind::Text => 1,
            NodeKind::Component => 5,
            NodeKind::Fragment => 0,
        }
    }
}

/// A render tree node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub props: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Node>,
}

/// Name carried by placeholder fragments standing in for another partition
pub const PLACEHOLDER_NAME: &str = "partition-slot";

impl Node {
    fn bare(kind: NodeKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            props: BTreeMap::new(),
            text: None,
            children: Vec::new(),
        }
    }

    pub fn element(name: impl Into<String>) -> Self {
        Self::bare(NodeKind::Element, name)
    }

    pub fn component(name: impl Into<String>) -> Self {
        Self::bare(NodeKind::Component, name)
    }

    pub fn text(content: impl Into<String>) -> Self {
        let mut node = Self::bare(NodeKind::Text, "");
        node.text = Some(content.into());
        node
    }

    pub fn fragment(children: Vec<Node>) -> Self {
        let mut node = Self::bare(NodeKind::Fragment, "");
        node.children = children;
        node
    }

    /// Empty fragment marking where partition `id`'s output belongs
    pub fn placeholder(id: u32) -> Self {
        Self::bare(NodeKind::Fragment, PLACEHOLDER_NAME).with_prop("partition", id.to_string())
    }

    /// Whether this node is a partition placeholder
    pub fn is_placeholder(&self) -> bool {
        self.kind == NodeKind::Fragment && self.name == PLACEHOLDER_NAME && self.children.is_empty()
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = Node>) -> Self {
        self.children.extend(children);
        self
    }

    /// Work of this node alone: `1 + weight`, elements add one per prop.
    pub fn own_work(&self) -> u64 {
        let props = match self.kind {
            NodeKind::Element => self.props.len() as u64,
            _ => 0,
        };
        1 + self.kind.weight() + props
    }

    /// Work of the whole subtree rooted here
    pub fn estimated_work(&self) -> u64 {
        let mut total = 0;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            total += node.own_work();
            stack.extend(node.children.iter());
        }
        total
    }

    /// Number of nodes in the subtree rooted here
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(node.children.iter());
        }
        count
    }

    /// Depth of the deepest node (root is 0)
    pub fn max_depth(&self) -> u32 {
        let mut deepest = 0;
        let mut stack = vec![(self, 0u32)];
        while let Some((node, depth)) = stack.pop() {
            deepest = deepest.max(depth);
            stack.extend(node.children.iter().map(|c| (c, depth + 1)));
        }
        deepest
    }

    /// Node at `path`, if it exists
    pub fn at(&self, path: &NodePath) -> Option<&Node> {
        path.0
            .iter()
            .try_fold(self, |node, &i| node.children.get(i as usize))
    }

    /// Mutable node at `path`, if it exists
    pub fn at_mut(&mut self, path: &NodePath) -> Option<&mut Node> {
        path.0
            .iter()
            .try_fold(self, |node, &i| node.children.get_mut(i as usize))
    }

    /// Replaces the node at `path`, returning the old node.
    pub fn replace_at(&mut self, path: &NodePath, node: Node) -> Option<Node> {
        self.at_mut(path).map(|slot| std::mem::replace(slot, node))
    }

    /// This node without its children
    pub fn shallow_copy(&self) -> Node {
        Node {
            kind: self.kind,
            name: self.name.clone(),
            props: self.props.clone(),
            text: self.text.clone(),
            children: Vec::new(),
        }
    }

    /// Builds a new tree from this one without recursing.
    ///
    /// `visit` sees every node with its path (relative to `base`) in document
    /// order. [`Rebuild::Descend`] keeps the returned node and rebuilds the
    /// original's children under it; [`Rebuild::Replace`] uses the returned
    /// node as is and skips the subtree.
    pub fn rebuild(&self, base: &NodePath, mut visit: impl FnMut(&NodePath, &Node) -> Rebuild) -> Node {
        struct Frame<'a> {
            out: Node,
            source: &'a Node,
            path: NodePath,
            next: usize,
        }

        let mut root = match visit(base, self) {
            Rebuild::Replace(node) => return node,
            Rebuild::Descend(node) => Frame {
                out: node,
                source: self,
                path: base.clone(),
                next: 0,
            },
        };
        let mut stack: Vec<Frame<'_>> = Vec::new();
        loop {
            let top = match stack.last_mut() {
                Some(frame) => frame,
                None => &mut root,
            };
            let source = top.source;
            if let Some(child) = source.children.get(top.next) {
                let path = top.path.child(top.next as u32);
                top.next += 1;
                match visit(&path, child) {
                    Rebuild::Replace(node) => top.out.children.push(node),
                    Rebuild::Descend(node) => stack.push(Frame {
                        out: node,
                        source: child,
                        path,
                        next: 0,
                    }),
                }
                continue;
            }
            match stack.pop() {
                Some(done) => match stack.last_mut() {
                    Some(parent) => parent.out.children.push(done.out),
                    None => root.out.children.push(done.out),
                },
                None => return root.out,
            }
        }
    }

    /// Visits every node in document order with its path.
    pub fn walk<'a>(&'a self, mut visit: impl FnMut(&NodePath, &'a Node)) {
        let mut stack = vec![(NodePath::root(), self)];
        while let Some((path, node)) = stack.pop() {
            visit(&path, node);
            for (i, child) in node.children.iter().enumerate().rev() {
                stack.push((path.child(i as u32), child));
            }
        }
    }
}

/// What [`Node::rebuild`] does with one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rebuild {
    /// Use this node and rebuild the original children beneath it
    Descend(Node),
    /// Use this node in place of the whole subtree
    Replace(Node),
}

/// Child-index path from the tree root; the empty path is the root itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodePath(pub Vec<u32>);

impl NodePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of edges from the root
    pub fn depth(&self) -> u32 {
        self.0.len() as u32
    }

    /// Path of child `index` of this node
    pub fn child(&self, index: u32) -> Self {
        let mut indices = Vec::with_capacity(self.0.len() + 1);
        indices.extend_from_slice(&self.0);
        indices.push(index);
        Self(indices)
    }

    /// Whether `self` is a strict ancestor of `other`
    pub fn is_ancestor_of(&self, other: &NodePath) -> bool {
        self.0.len() < other.0.len() && other.0.starts_with(&self.0)
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for index in &self.0 {
            write!(f, "/{index}")?;
        }
        Ok(())
    }
}

impl From<Vec<u32>> for NodePath {
    fn from(indices: Vec<u32>) -> Self {
        Self(indices)
    }
}

/// Builds a uniform tree of elements with text leaves.
///
/// Every internal node has `branching` children down to `depth`; leaves are
/// text nodes. Useful for demos and benchmarks.
pub fn synthetic_tree(depth: u32, branching: u32) -> Node {
    fn build(level: u32, depth: u32, branching: u32, index: u32) -> Node {
        if level == depth {
            return Node::text(format!("leaf {level}.{index}"));
        }
        let name = if level % 2 == 0 { "div" } else { "section" };
        Node::element(name)
            .with_prop("class", format!("level-{level}"))
            .with_children((0..branching).map(|i| build(level + 1, depth, branching, i)))
    }
    build(0, depth, branching, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Node {
        Node::element("div")
            .with_prop("id", "app")
            .with_child(Node::text("hello"))
            .with_child(Node::component("Button").with_child(Node::text("ok")))
            .with_child(Node::fragment(vec![Node::element("span")]))
    }

    #[test]
    fn test_work_estimate() {
        let tree = sample();
        // div(1+2+1) + text(2) + Button(6) + text(2) + fragment(1) + span(3)
        assert_eq!(tree.estimated_work(), 18);
        assert_eq!(tree.node_count(), 6);
        assert_eq!(tree.max_depth(), 2);
    }

    #[test]
    fn test_path_navigation() {
        let mut tree = sample();
        let path = NodePath::from(vec![1, 0]);
        assert_eq!(tree.at(&path).and_then(|n| n.text.clone()), Some("ok".to_string()));
        assert!(tree.at(&NodePath::from(vec![5])).is_none());

        let old = tree.replace_at(&path, Node::text("done"));
        assert_eq!(old.map(|n| n.text), Some(Some("ok".to_string())));
        assert_eq!(tree.at(&path).unwrap().text.as_deref(), Some("done"));
        assert_eq!(path.to_string(), "/1/0");
        assert!(NodePath::from(vec![1]).is_ancestor_of(&path));
        assert!(!path.is_ancestor_of(&path));
    }

    #[test]
    fn test_walk_is_document_order() {
        let tree = sample();
        let mut paths = Vec::new();
        tree.walk(|path, _| paths.push(path.to_string()));
        assert_eq!(paths, vec!["/", "/0", "/1", "/1/0", "/2", "/2/0"]);
    }

    #[test]
    fn test_synthetic_tree_shape() {
        let tree = synthetic_tree(5, 4);
        assert_eq!(tree.node_count(), 1 + 4 + 16 + 64 + 256 + 1024);
        assert_eq!(tree.max_depth(), 5);
    }

    #[test]
    fn test_rebuild_replaces_and_keeps_order() {
        let tree = sample();
        let copy = tree.rebuild(&NodePath::root(), |_, node| Rebuild::Descend(node.shallow_copy()));
        assert_eq!(copy, tree);

        let pruned = tree.rebuild(&NodePath::root(), |path, node| {
            if path == &NodePath::from(vec![1]) {
                Rebuild::Replace(Node::placeholder(9))
            } else {
                Rebuild::Descend(node.shallow_copy())
            }
        });
        assert_eq!(pruned.children.len(), 3);
        assert!(pruned.children[1].is_placeholder());
        assert_eq!(pruned.children[2], tree.children[2]);
    }

    #[test]
    fn test_rebuild_deep_chain() {
        let mut tree = Node::text("bottom");
        for level in (0..1_000).rev() {
            tree = Node::element("div").with_prop("level", level.to_string()).with_child(tree);
        }
        let mut seen = 0;
        let copy = tree.rebuild(&NodePath::from(vec![3]), |path, node| {
            seen += 1;
            assert_eq!(path.depth() as usize, seen);
            Rebuild::Descend(node.shallow_copy())
        });
        assert_eq!(seen, 1_001);
        assert_eq!(copy.max_depth(), 1_000);
        assert_eq!(copy.estimated_work(), tree.estimated_work());
    }

    #[test]
    fn test_serde_skips_empty_fields() {
        let json = serde_json::to_string(&Node::text("hi")).unwrap();
        assert_eq!(json, r#"{"kind":"text","text":"hi"}"#);
        assert!(Node::placeholder(3).is_placeholder());
    }
}
