//! Task definitions shared by the supervisor and the workers.
//!
//! A [`WorkerTask`] is the unit of work dispatched to a worker. It travels as
//! JSON inside a `task` message, so everything here is serde-serializable and
//! free of pointers; large inputs are referenced by [`BufferRef`]s into the
//! pool's shared region instead of being copied.

use crate::error::TaskError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// What a task asks the worker to do
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Render,
    Diff,
    Layout,
    Paint,
    Compute,
    Custom(String),
}

/// Scheduling priority, ordered `Idle < Low < Normal < High`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Idle,
    Low,
    #[default]
    Normal,
    High,
}

/// Lifecycle of a task.
///
/// `Pending → Running → {Completed | Failed | Cancelled}`; a pending task may
/// also be cancelled or failed directly. Terminal states are final.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the state is final
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte range inside the pool's shared region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferRef {
    pub offset: usize,
    pub length: usize,
}

/// Task input
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buffer_refs: Vec<BufferRef>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// A unit of work for a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerTask {
    pub id: Uuid,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub payload: TaskPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    /// Preferred worker slot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<usize>,
    /// Creation time, ms since epoch
    pub created_at: u64,
    /// Absolute deadline, ms since epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<u64>,
    #[serde(default)]
    pub status: TaskStatus,
}

impl WorkerTask {
    /// Creates a pending task with a fresh id.
    pub fn new(task_type: TaskType, data: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type,
            priority: TaskPriority::Normal,
            payload: TaskPayload {
                data,
                ..TaskPayload::default()
            },
            parent_id: None,
            affinity: None,
            created_at: now_ms(),
            deadline: None,
            status: TaskStatus::Pending,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_buffer(mut self, buffer: BufferRef) -> Self {
        self.payload.buffer_refs.push(buffer);
        self
    }

    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_id = Some(parent);
        self
    }

    pub fn with_affinity(mut self, worker: usize) -> Self {
        self.affinity = Some(worker);
        self
    }

    pub fn with_deadline(mut self, deadline_ms: u64) -> Self {
        self.deadline = Some(deadline_ms);
        self
    }

    /// Moves the task to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(next) {
            return Err(TaskError::InvalidTransition {
                id: self.id,
                from: self.status.as_str(),
                to: next.as_str(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Whether the deadline has passed at `now` (ms since epoch)
    pub fn is_past_deadline(&self, now: u64) -> bool {
        self.deadline.is_some_and(|deadline| now > deadline)
    }
}

/// Outcome reported by a worker for one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: f64,
    pub worker_id: usize,
}

impl TaskResult {
    pub fn success(task_id: Uuid, worker_id: usize, data: Vec<u8>, duration_ms: f64) -> Self {
        Self {
            task_id,
            success: true,
            data: Some(data),
            error: None,
            duration_ms,
            worker_id,
        }
    }

    pub fn failure(task_id: Uuid, worker_id: usize, error: impl Into<String>, duration_ms: f64) -> Self {
        Self {
            task_id,
            success: false,
            data: None,
            error: Some(error.into()),
            duration_ms,
            worker_id,
        }
    }
}
