//! Supervisor ↔ worker message protocol.
//!
//! Messages are JSON objects of the form `{"type": ..., "payload": ...}`.
//! The shared region itself never appears in a message: it travels next to
//! the `initialize` message as a transfer, the way a host hands shared memory
//! to a new execution context.

use crate::error::ProtocolError;
use crate::task::{TaskResult, WorkerTask};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Where a worker finds its queues inside the transferred region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializePayload {
    pub worker_id: usize,
    pub deque_offset: usize,
    pub deque_capacity: u32,
    pub doorbell_offset: usize,
    pub doorbell_capacity: u32,
    pub heartbeat_interval_ms: u64,
}

/// A task plus the handle under which it sits in the worker's deque
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub handle: u32,
    pub task: WorkerTask,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub worker_id: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub worker_id: usize,
    pub timestamp_ms: u64,
    pub tasks_completed: u64,
}

/// All messages exchanged with worker contexts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Supervisor → worker: bind queues and start
    Initialize(InitializePayload),
    /// Supervisor → worker: task payload for a handle in the deque
    Task(TaskEnvelope),
    /// Supervisor → worker: the handle moved to another worker, drop it
    Release { handle: u32 },
    /// Supervisor → worker: the task was cancelled, do not run it
    Cancel { handle: u32 },
    /// Supervisor → worker: finish queued work and exit
    Terminate,
    /// Worker → supervisor: queues bound, accepting work
    Ready { worker_id: usize },
    /// Worker → supervisor: task finished
    Result(TaskResult),
    /// Worker → supervisor: something went wrong
    Error(ErrorPayload),
    /// Worker → supervisor: still alive
    Heartbeat(HeartbeatPayload),
}

impl WorkerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Initialize(_) => "initialize",
            WorkerMessage::Task(_) => "task",
            WorkerMessage::Release { .. } => "release",
            WorkerMessage::Cancel { .. } => "cancel",
            WorkerMessage::Terminate => "terminate",
            WorkerMessage::Ready { .. } => "ready",
            WorkerMessage::Result(_) => "result",
            WorkerMessage::Error(_) => "error",
            WorkerMessage::Heartbeat(_) => "heartbeat",
        }
    }

    pub fn encode(&self) -> Result<Value, ProtocolError> {
        serde_json::to_value(self).map_err(|e| ProtocolError::Encode {
            kind: self.kind(),
            reason: e.to_string(),
        })
    }

    pub fn decode(value: Value) -> Result<Self, ProtocolError> {
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}
