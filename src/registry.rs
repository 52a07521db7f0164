//! Bookkeeping for every task the supervisor has accepted.
//!
//! The registry allocates the `u32` handles that travel through the deques,
//! tracks which worker owns each task, and keeps terminal outcomes until the
//! submitter takes them. It is only touched under the supervisor's control
//! lock.

use crate::error::TaskError;
use crate::task::{TaskResult, TaskStatus, WorkerTask};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Final outcome of a task
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The worker returned a result (which may report failure)
    Completed(TaskResult),
    /// The task failed without a worker result
    Failed(String),
    /// Cancelled by the submitter
    Cancelled,
    /// Ran longer than the task timeout
    TimedOut,
}

/// What recording a worker result did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// Result stored; the task had been assigned to this worker
    Accepted { worker: Option<usize> },
    /// Task already terminal (cancelled, timed out, ...) so the result was dropped
    Ignored,
    /// No such task
    Unknown,
}

#[derive(Debug)]
struct Entry {
    task: WorkerTask,
    handle: u32,
    worker: Option<usize>,
    dispatched_at: Option<Instant>,
    outcome: Option<TaskOutcome>,
}

/// Task registry
#[derive(Debug, Default)]
pub struct TaskRegistry {
    next_handle: u32,
    entries: HashMap<Uuid, Entry>,
    handles: HashMap<u32, Uuid>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending task and allocates its handle.
    pub fn register(&mut self, task: WorkerTask) -> u32 {
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);
        self.handles.insert(handle, task.id);
        self.entries.insert(
            task.id,
            Entry {
                task,
                handle,
                worker: None,
                dispatched_at: None,
                outcome: None,
            },
        );
        handle
    }

    /// Forgets a task along with any outcome it has.
    pub fn unregister(&mut self, task_id: &Uuid) {
        if let Some(entry) = self.entries.remove(task_id) {
            self.handles.remove(&entry.handle);
        }
    }

    /// Marks a task running on `worker`.
    pub fn mark_dispatched(&mut self, task_id: &Uuid, worker: usize) -> Result<(), TaskError> {
        if let Some(entry) = self.entries.get_mut(task_id) {
            entry.task.transition(TaskStatus::Running)?;
            entry.worker = Some(worker);
            entry.dispatched_at = Some(Instant::now());
        }
        Ok(())
    }

    /// Moves a running task to another worker (work stealing).
    pub fn reassign(&mut self, handle: u32, worker: usize) -> Option<&WorkerTask> {
        let id = self.handles.get(&handle)?;
        let entry = self.entries.get_mut(id)?;
        if entry.task.status.is_terminal() {
            return None;
        }
        entry.worker = Some(worker);
        Some(&entry.task)
    }

    pub fn handle_of(&self, task_id: &Uuid) -> Option<u32> {
        self.entries.get(task_id).map(|e| e.handle)
    }

    pub fn task_for_handle(&self, handle: u32) -> Option<&WorkerTask> {
        self.handles.get(&handle).and_then(|id| self.entries.get(id)).map(|e| &e.task)
    }

    pub fn worker_of(&self, task_id: &Uuid) -> Option<usize> {
        self.entries.get(task_id).and_then(|e| e.worker)
    }

    pub fn status(&self, task_id: &Uuid) -> Option<TaskStatus> {
        self.entries.get(task_id).map(|e| e.task.status)
    }

    pub fn contains(&self, task_id: &Uuid) -> bool {
        self.entries.contains_key(task_id)
    }

    fn finish(&mut self, task_id: &Uuid, status: TaskStatus, outcome: TaskOutcome) -> Result<Option<usize>, TaskError> {
        let Some(entry) = self.entries.get_mut(task_id) else {
            return Ok(None);
        };
        entry.task.transition(status)?;
        entry.outcome = Some(outcome);
        self.handles.remove(&entry.handle);
        Ok(entry.worker)
    }

    /// Records a worker result.
    pub fn complete(&mut self, result: TaskResult) -> Recorded {
        let task_id = result.task_id;
        let Some(entry) = self.entries.get(&task_id) else {
            return Recorded::Unknown;
        };
        if entry.task.status.is_terminal() {
            debug!(task = %task_id, status = %entry.task.status, "Ignoring late result");
            return Recorded::Ignored;
        }
        let status = if result.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        match self.finish(&task_id, status, TaskOutcome::Completed(result)) {
            Ok(worker) => Recorded::Accepted { worker },
            Err(e) => {
                warn!(task = %task_id, error = %e, "Result rejected");
                Recorded::Ignored
            }
        }
    }

    /// Fails a non-terminal task. Returns the worker it was assigned to.
    pub fn fail(&mut self, task_id: &Uuid, reason: impl Into<String>) -> Result<Option<usize>, TaskError> {
        self.finish(task_id, TaskStatus::Failed, TaskOutcome::Failed(reason.into()))
    }

    /// Fails a task that exceeded its running time.
    pub fn time_out(&mut self, task_id: &Uuid) -> Result<Option<usize>, TaskError> {
        self.finish(task_id, TaskStatus::Failed, TaskOutcome::TimedOut)
    }

    /// Cancels a non-terminal task. Returns the worker it was assigned to.
    pub fn cancel(&mut self, task_id: &Uuid) -> Result<Option<usize>, TaskError> {
        self.finish(task_id, TaskStatus::Cancelled, TaskOutcome::Cancelled)
    }

    /// Outcome of a terminal task, removing it from the registry.
    ///
    /// Returns `None` while the task is still in flight.
    pub fn take_outcome(&mut self, task_id: &Uuid) -> Option<TaskOutcome> {
        if self.entries.get(task_id)?.outcome.is_none() {
            return None;
        }
        self.entries.remove(task_id).and_then(|e| e.outcome)
    }

    /// Tasks held, terminal ones included until their outcome is taken
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tasks not yet terminal
    pub fn pending_count(&self) -> usize {
        self.entries.values().filter(|e| !e.task.status.is_terminal()).count()
    }

    /// Non-terminal tasks assigned to `worker`
    pub fn assigned_to(&self, worker: usize) -> Vec<Uuid> {
        self.entries
            .values()
            .filter(|e| e.worker == Some(worker) && !e.task.status.is_terminal())
            .map(|e| e.task.id)
            .collect()
    }

    /// Non-terminal tasks
    pub fn in_flight(&self) -> Vec<Uuid> {
        self.entries
            .values()
            .filter(|e| !e.task.status.is_terminal())
            .map(|e| e.task.id)
            .collect()
    }

    /// Running tasks dispatched more than `timeout` before `now`
    pub fn overdue(&self, now: Instant, timeout: Duration) -> Vec<Uuid> {
        self.entries
            .values()
            .filter(|e| e.task.status == TaskStatus::Running)
            .filter(|e| e.dispatched_at.is_some_and(|at| now.saturating_duration_since(at) >= timeout))
            .map(|e| e.task.id)
            .collect()
    }
}
