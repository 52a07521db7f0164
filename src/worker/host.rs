//! Worker execution contexts.
//!
//! The supervisor never creates threads itself: it asks a [`WorkerHost`] for
//! an isolated [`WorkerContext`] per slot, talks to it only through posted
//! messages, and hears back through a [`WorkerEventSink`]. [`ThreadWorkerHost`]
//! backs each context with a dedicated OS thread running the worker runtime.

use super::executor::TaskExecutor;
use super::runtime;
use crate::config::HostConfig;
use crate::error::SupervisorError;
use crate::region::TransferableRegion;
use crossbeam::channel::{self, Receiver, Sender};
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Something a worker context reported
#[derive(Debug, Clone)]
pub enum WorkerEventKind {
    /// A protocol message from the worker
    Message(Value),
    /// The context failed outside the protocol (crash, spawn failure)
    Error(String),
    /// The context stopped running
    Exited,
}

/// Event tagged with the slot and context generation that produced it
#[derive(Debug, Clone)]
pub struct WorkerEvent {
    pub slot: usize,
    pub generation: u32,
    pub kind: WorkerEventKind,
}

/// Channel end a context uses to report back to the supervisor
#[derive(Debug, Clone)]
pub struct WorkerEventSink {
    slot: usize,
    generation: u32,
    sender: Sender<WorkerEvent>,
}

impl WorkerEventSink {
    pub fn new(slot: usize, generation: u32, sender: Sender<WorkerEvent>) -> Self {
        Self {
            slot,
            generation,
            sender,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    fn emit(&self, kind: WorkerEventKind) -> bool {
        self.sender
            .send(WorkerEvent {
                slot: self.slot,
                generation: self.generation,
                kind,
            })
            .is_ok()
    }

    /// Delivers a protocol message; `false` once the supervisor is gone.
    pub fn message(&self, message: Value) -> bool {
        self.emit(WorkerEventKind::Message(message))
    }

    pub fn error(&self, reason: impl Into<String>) -> bool {
        self.emit(WorkerEventKind::Error(reason.into()))
    }

    pub fn exited(&self) -> bool {
        self.emit(WorkerEventKind::Exited)
    }
}

/// A message delivered into a worker context
#[derive(Debug)]
pub struct Inbound {
    pub message: Value,
    pub transfer: Option<TransferableRegion>,
}

/// Handle to one isolated worker execution context
pub trait WorkerContext: Send {
    /// Posts a message, optionally transferring shared memory along with it.
    fn post_message(&self, message: Value, transfer: Option<TransferableRegion>) -> Result<(), SupervisorError>;

    /// Stops the context. Must not block on a wedged worker.
    fn terminate(&mut self);
}

/// Creates worker contexts
pub trait WorkerHost: Send + Sync {
    fn spawn(&self, slot: usize, events: WorkerEventSink) -> Result<Box<dyn WorkerContext>, SupervisorError>;
}

/// Host that runs each worker on its own OS thread
pub struct ThreadWorkerHost {
    executor: Arc<dyn TaskExecutor>,
    config: HostConfig,
}

impl ThreadWorkerHost {
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self::with_config(executor, HostConfig::default())
    }

    pub fn with_config(executor: Arc<dyn TaskExecutor>, config: HostConfig) -> Self {
        Self { executor, config }
    }
}

impl WorkerHost for ThreadWorkerHost {
    fn spawn(&self, slot: usize, events: WorkerEventSink) -> Result<Box<dyn WorkerContext>, SupervisorError> {
        let (sender, receiver): (Sender<Inbound>, Receiver<Inbound>) = channel::unbounded();
        let executor = Arc::clone(&self.executor);
        let pin_to_core = self.config.pin_to_core;

        let handle = thread::Builder::new()
            .name(format!("{}-{}", self.config.thread_name_prefix, slot))
            .spawn(move || {
                // Pin worker to its core for better cache locality
                if pin_to_core {
                    if let Some(core_ids) = core_affinity::get_core_ids() {
                        if let Some(core) = core_ids.get(slot % core_ids.len().max(1)) {
                            core_affinity::set_for_current(*core);
                        }
                    }
                }

                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    runtime::run(slot, receiver, events.clone(), executor);
                }));
                if outcome.is_err() {
                    error!(worker = slot, "Worker runtime panicked");
                    events.error("worker runtime panicked");
                }
                events.exited();
            })
            .map_err(|e| SupervisorError::Spawn {
                slot,
                reason: e.to_string(),
            })?;

        Ok(Box::new(ThreadWorkerContext {
            slot,
            sender: Some(sender),
            thread: Some(handle),
        }))
    }
}

struct ThreadWorkerContext {
    slot: usize,
    sender: Option<Sender<Inbound>>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerContext for ThreadWorkerContext {
    fn post_message(&self, message: Value, transfer: Option<TransferableRegion>) -> Result<(), SupervisorError> {
        let sender = self.sender.as_ref().ok_or(SupervisorError::PostFailed { slot: self.slot })?;
        sender
            .send(Inbound { message, transfer })
            .map_err(|_| SupervisorError::PostFailed { slot: self.slot })
    }

    fn terminate(&mut self) {
        // Disconnecting the inbox makes the runtime exit at its next check
        self.sender = None;
        if let Some(handle) = self.thread.take() {
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!(worker = self.slot, "Worker thread panicked");
                }
            } else {
                debug!(worker = self.slot, "Detaching worker thread that is still running");
            }
        }
    }
}

impl Drop for ThreadWorkerContext {
    fn drop(&mut self) {
        self.terminate();
    }
}
