//! What a worker actually runs.
//!
//! A [`TaskExecutor`] turns a task into result bytes. [`RenderExecutor`] is
//! the built-in one for `Render` tasks: it decodes a partition payload, runs a
//! [`NodeRenderer`] over every node and encodes the partition output.

use crate::partition::{PartitionOutput, PartitionPayload, PartitionRoot};
use crate::task::{TaskType, WorkerTask};
use crate::tree::{Node, NodePath, Rebuild};
use std::sync::Arc;

/// Executes tasks on a worker thread
pub trait TaskExecutor: Send + Sync {
    /// Runs `task`, returning result bytes or a failure reason.
    fn execute(&self, task: &WorkerTask) -> Result<Vec<u8>, String>;
}

impl<F> TaskExecutor for F
where
    F: Fn(&WorkerTask) -> Result<Vec<u8>, String> + Send + Sync,
{
    fn execute(&self, task: &WorkerTask) -> Result<Vec<u8>, String> {
        self(task)
    }
}

/// Renders a single node.
///
/// Implementations receive the node without its children and return the
/// rendered node; children are rendered separately and reattached, so tree
/// structure is always preserved.
pub trait NodeRenderer: Send + Sync {
    fn render_node(&self, node: &Node) -> Node;
}

/// Renderer that returns every node unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityRenderer;

impl NodeRenderer for IdentityRenderer {
    fn render_node(&self, node: &Node) -> Node {
        node.clone()
    }
}

/// Renders a whole subtree, leaving partition placeholders untouched.
///
/// Walks the tree with an explicit stack, so depth is bounded only by memory.
pub fn render_tree(renderer: &dyn NodeRenderer, node: &Node) -> Node {
    node.rebuild(&NodePath::root(), |_, original| {
        if original.is_placeholder() {
            return Rebuild::Replace(original.clone());
        }
        let mut rendered = renderer.render_node(&original.shallow_copy());
        rendered.children.clear();
        Rebuild::Descend(rendered)
    })
}

/// Executor for `Render` tasks carrying a [`PartitionPayload`]
#[derive(Clone)]
pub struct RenderExecutor {
    renderer: Arc<dyn NodeRenderer>,
}

impl RenderExecutor {
    pub fn new(renderer: Arc<dyn NodeRenderer>) -> Self {
        Self { renderer }
    }
}

impl TaskExecutor for RenderExecutor {
    fn execute(&self, task: &WorkerTask) -> Result<Vec<u8>, String> {
        if task.task_type != TaskType::Render {
            return Err(format!("unsupported task type {:?}", task.task_type));
        }
        let payload = PartitionPayload::from_bytes(&task.payload.data).map_err(|e| format!("bad payload: {e}"))?;

        let output = PartitionOutput {
            partition_id: payload.partition_id,
            roots: payload
                .roots
                .iter()
                .map(|root| PartitionRoot {
                    path: root.path.clone(),
                    node: render_tree(self.renderer.as_ref(), &root.node),
                })
                .collect(),
        };
        output.to_bytes().map_err(|e| format!("cannot encode output: {e}"))
    }
}
