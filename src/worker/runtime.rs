//! Worker-side loop.
//!
//! After `initialize` the worker binds its deque and the completion doorbell
//! inside the transferred region, answers `ready`, and then:
//!
//! 1. drains its inbox (task payloads, releases, cancellations, terminate)
//! 2. steals the oldest handle from its own deque and runs the matching task
//! 3. reports the result and rings the doorbell with the handle
//! 4. when the deque is empty, sleeps on the deque's `bottom` word until the
//!    supervisor pushes or the heartbeat interval elapses
//!
//! A panicking executor produces a failed result; the worker keeps going.

use super::executor::TaskExecutor;
use super::host::{Inbound, WorkerEventSink};
use crate::deque::WorkStealingDeque;
use crate::error::QueueError;
use crate::protocol::{ErrorPayload, HeartbeatPayload, InitializePayload, WorkerMessage};
use crate::region::{SharedRegion, TransferableRegion};
use crate::ring_queue::BoundedRingQueue;
use crate::task::{TaskResult, WorkerTask, now_ms};
use crossbeam::channel::{Receiver, TryRecvError};
use crossbeam::utils::Backoff;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Runs a worker until it is told to terminate or its inbox disconnects.
pub fn run(slot: usize, inbox: Receiver<Inbound>, events: WorkerEventSink, executor: Arc<dyn TaskExecutor>) {
    let Some(mut worker) = WorkerRuntime::initialize(slot, inbox, events, executor) else {
        return;
    };
    worker.run_loop();
    debug!(worker = slot, completed = worker.completed, "Worker exiting");
}

struct WorkerRuntime {
    id: usize,
    inbox: Receiver<Inbound>,
    events: WorkerEventSink,
    executor: Arc<dyn TaskExecutor>,
    _region: SharedRegion,
    deque: WorkStealingDeque,
    doorbell: BoundedRingQueue,
    heartbeat_interval: Duration,
    last_heartbeat: Instant,
    tasks: HashMap<u32, WorkerTask>,
    completed: u64,
    draining: bool,
}

impl WorkerRuntime {
    /// Blocks until a valid `initialize` arrives, then reports `ready`.
    fn initialize(
        slot: usize,
        inbox: Receiver<Inbound>,
        events: WorkerEventSink,
        executor: Arc<dyn TaskExecutor>,
    ) -> Option<Self> {
        loop {
            let inbound = inbox.recv().ok()?;
            let message = match WorkerMessage::decode(inbound.message) {
                Ok(message) => message,
                Err(e) => {
                    send_error(&events, slot, None, e.to_string());
                    continue;
                }
            };
            let (init, transfer) = match (message, inbound.transfer) {
                (WorkerMessage::Initialize(init), Some(transfer)) => (init, transfer),
                (WorkerMessage::Terminate, _) => return None,
                (WorkerMessage::Initialize(_), None) => {
                    send_error(&events, slot, None, "initialize without shared region".to_string());
                    continue;
                }
                (other, _) => {
                    send_error(&events, slot, None, format!("{} before initialize", other.kind()));
                    continue;
                }
            };

            let (region, deque, doorbell) = match bind(&init, transfer) {
                Ok(bound) => bound,
                Err(e) => {
                    send_error(&events, slot, None, format!("cannot bind queues: {e}"));
                    return None;
                }
            };

            let worker = Self {
                id: init.worker_id,
                inbox,
                events,
                executor,
                _region: region,
                deque,
                doorbell,
                heartbeat_interval: Duration::from_millis(init.heartbeat_interval_ms.max(1)),
                last_heartbeat: Instant::now(),
                tasks: HashMap::new(),
                completed: 0,
                draining: false,
            };
            worker.send(WorkerMessage::Ready {
                worker_id: worker.id,
            });
            debug!(worker = worker.id, "Worker ready");
            return Some(worker);
        }
    }

    fn run_loop(&mut self) {
        let backoff = Backoff::new();
        loop {
            if !self.drain_inbox() {
                return;
            }

            let observed = self.deque.bottom_snapshot();
            match self.deque.steal() {
                Some(handle) => {
                    backoff.reset();
                    self.run_handle(handle);
                }
                // Lost a race with another thief; the deque still has work
                None if !self.deque.is_empty() => backoff.spin(),
                None if self.draining => return,
                None => {
                    let wait = self
                        .heartbeat_interval
                        .saturating_sub(self.last_heartbeat.elapsed())
                        .max(Duration::from_millis(1));
                    self.deque.wait_for_work(observed, wait);
                }
            }
            self.maybe_heartbeat();
        }
    }

    /// Applies every queued message. Returns `false` when the inbox is gone.
    fn drain_inbox(&mut self) -> bool {
        loop {
            match self.inbox.try_recv() {
                Ok(inbound) => self.handle_message(inbound.message),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn handle_message(&mut self, raw: serde_json::Value) {
        let message = match WorkerMessage::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                send_error(&self.events, self.id, None, e.to_string());
                return;
            }
        };
        match message {
            WorkerMessage::Task(envelope) => {
                self.tasks.insert(envelope.handle, envelope.task);
            }
            WorkerMessage::Release { handle } | WorkerMessage::Cancel { handle } => {
                self.tasks.remove(&handle);
            }
            WorkerMessage::Terminate => {
                debug!(worker = self.id, queued = self.deque.len(), "Draining before exit");
                self.draining = true;
            }
            other => {
                send_error(&self.events, self.id, None, format!("unexpected {} message", other.kind()));
            }
        }
    }

    fn run_handle(&mut self, handle: u32) {
        // Payloads and releases are posted before the push that made the
        // handle visible, so the inbox is up to date after this drain
        self.drain_inbox();
        let Some(task) = self.tasks.remove(&handle) else {
            trace!(worker = self.id, handle, "Skipping released handle");
            return;
        };

        let start = Instant::now();
        let result = if task.is_past_deadline(now_ms()) {
            TaskResult::failure(task.id, self.id, "deadline exceeded before start", 0.0)
        } else {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.executor.execute(&task)));
            let elapsed = start.elapsed().as_secs_f64() * 1000.0;
            match outcome {
                Ok(Ok(data)) => TaskResult::success(task.id, self.id, data, elapsed),
                Ok(Err(reason)) => TaskResult::failure(task.id, self.id, reason, elapsed),
                Err(payload) => {
                    let reason = format!("executor panicked: {}", panic_message(payload.as_ref()));
                    warn!(worker = self.id, task = %task.id, "{reason}");
                    TaskResult::failure(task.id, self.id, reason, elapsed)
                }
            }
        };

        self.completed += 1;
        self.send(WorkerMessage::Result(result));
        if !self.doorbell.try_enqueue(handle) {
            trace!(worker = self.id, handle, "Doorbell full");
        }
    }

    fn maybe_heartbeat(&mut self) {
        if self.last_heartbeat.elapsed() < self.heartbeat_interval {
            return;
        }
        self.last_heartbeat = Instant::now();
        self.send(WorkerMessage::Heartbeat(HeartbeatPayload {
            worker_id: self.id,
            timestamp_ms: now_ms(),
            tasks_completed: self.completed,
        }));
    }

    fn send(&self, message: WorkerMessage) {
        match message.encode() {
            Ok(value) => {
                self.events.message(value);
            }
            Err(e) => {
                self.events.error(e.to_string());
            }
        }
    }
}

fn bind(
    init: &InitializePayload,
    transfer: TransferableRegion,
) -> Result<(SharedRegion, WorkStealingDeque, BoundedRingQueue), QueueError> {
    let region = SharedRegion::from_transferable(transfer);
    let deque = WorkStealingDeque::attach(&region, init.deque_offset, init.deque_capacity)?;
    let doorbell = BoundedRingQueue::attach(&region, init.doorbell_offset, init.doorbell_capacity)?;
    Ok((region, deque, doorbell))
}

fn send_error(events: &WorkerEventSink, worker_id: usize, task_id: Option<Uuid>, message: String) {
    let error = WorkerMessage::Error(ErrorPayload {
        worker_id,
        task_id,
        message,
    });
    match error.encode() {
        Ok(value) => {
            events.message(value);
        }
        Err(e) => {
            events.error(e.to_string());
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TaskEnvelope;
    use crate::task::TaskType;
    use crate::worker::host::{WorkerEvent, WorkerEventKind};
    use crossbeam::channel::{self, Sender};
    use std::thread;

    struct Harness {
        region: SharedRegion,
        deque: WorkStealingDeque,
        doorbell: BoundedRingQueue,
        inbox: Sender<Inbound>,
        events: Receiver<WorkerEvent>,
        thread: Option<thread::JoinHandle<()>>,
    }

    const DOORBELL: usize = 0;
    const DEQUE: usize = 1024;

    fn start(executor: Arc<dyn TaskExecutor>) -> Harness {
        let region = SharedRegion::new(4096).unwrap();
        let doorbell = BoundedRingQueue::new(&region, DOORBELL, 16).unwrap();
        let deque = WorkStealingDeque::new(&region, DEQUE, 16).unwrap();
        let (inbox, inbox_rx) = channel::unbounded();
        let (events_tx, events) = channel::unbounded();
        let sink = WorkerEventSink::new(0, 0, events_tx);
        let thread = thread::spawn(move || run(0, inbox_rx, sink, executor));

        let init = WorkerMessage::Initialize(InitializePayload {
            worker_id: 0,
            deque_offset: DEQUE,
            deque_capacity: 16,
            doorbell_offset: DOORBELL,
            doorbell_capacity: 16,
            heartbeat_interval_ms: 50,
        });
        inbox
            .send(Inbound {
                message: init.encode().unwrap(),
                transfer: Some(region.transferable()),
            })
            .unwrap();

        Harness {
            region,
            deque,
            doorbell,
            inbox,
            events,
            thread: Some(thread),
        }
    }

    impl Harness {
        fn next_message(&self) -> WorkerMessage {
            let event = self.events.recv_timeout(Duration::from_secs(5)).expect("no event");
            match event.kind {
                WorkerEventKind::Message(value) => WorkerMessage::decode(value).unwrap(),
                other => panic!("unexpected event {other:?}"),
            }
        }

        fn next_non_heartbeat(&self) -> WorkerMessage {
            loop {
                match self.next_message() {
                    WorkerMessage::Heartbeat(_) => continue,
                    other => return other,
                }
            }
        }

        fn post(&self, message: WorkerMessage) {
            self.inbox
                .send(Inbound {
                    message: message.encode().unwrap(),
                    transfer: None,
                })
                .unwrap();
        }

        fn dispatch(&self, handle: u32, task: WorkerTask) {
            self.post(WorkerMessage::Task(TaskEnvelope { handle, task }));
            assert!(self.deque.push(handle));
            self.deque.notify_work();
        }

        fn stop(mut self) {
            self.post(WorkerMessage::Terminate);
            self.deque.notify_work();
            if let Some(thread) = self.thread.take() {
                thread.join().unwrap();
            }
            assert!(self.region.byte_length() > 0);
        }
    }

    fn echo() -> Arc<dyn TaskExecutor> {
        Arc::new(|task: &WorkerTask| -> Result<Vec<u8>, String> { Ok(task.payload.data.clone()) })
    }

    #[test]
    fn test_ready_then_result() {
        let harness = start(echo());
        assert_eq!(harness.next_message(), WorkerMessage::Ready { worker_id: 0 });

        let task = WorkerTask::new(TaskType::Compute, vec![4, 2]);
        let id = task.id;
        harness.dispatch(7, task);

        match harness.next_non_heartbeat() {
            WorkerMessage::Result(result) => {
                assert_eq!(result.task_id, id);
                assert!(result.success);
                assert_eq!(result.data, Some(vec![4, 2]));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(harness.doorbell.dequeue(Some(Duration::from_secs(1))), Some(7));
        harness.stop();
    }

    #[test]
    fn test_heartbeat_when_idle() {
        let harness = start(echo());
        assert_eq!(harness.next_message(), WorkerMessage::Ready { worker_id: 0 });
        assert!(matches!(harness.next_message(), WorkerMessage::Heartbeat(_)));
        harness.stop();
    }

    #[test]
    fn test_released_handle_is_skipped() {
        let harness = start(echo());
        assert_eq!(harness.next_message(), WorkerMessage::Ready { worker_id: 0 });

        let released = WorkerTask::new(TaskType::Compute, vec![1]);
        harness.post(WorkerMessage::Task(TaskEnvelope {
            handle: 1,
            task: released,
        }));
        harness.post(WorkerMessage::Release { handle: 1 });
        assert!(harness.deque.push(1));

        let kept = WorkerTask::new(TaskType::Compute, vec![2]);
        let kept_id = kept.id;
        harness.dispatch(2, kept);

        match harness.next_non_heartbeat() {
            WorkerMessage::Result(result) => assert_eq!(result.task_id, kept_id),
            other => panic!("unexpected {other:?}"),
        }
        harness.stop();
    }

    #[test]
    fn test_panicking_executor_reports_failure() {
        let executor: Arc<dyn TaskExecutor> = Arc::new(|task: &WorkerTask| -> Result<Vec<u8>, String> {
            if task.payload.data.is_empty() {
                panic!("empty payload");
            }
            Ok(vec![])
        });
        let harness = start(executor);
        assert_eq!(harness.next_message(), WorkerMessage::Ready { worker_id: 0 });

        harness.dispatch(0, WorkerTask::new(TaskType::Compute, vec![]));
        match harness.next_non_heartbeat() {
            WorkerMessage::Result(result) => {
                assert!(!result.success);
                assert!(result.error.unwrap().contains("empty payload"));
            }
            other => panic!("unexpected {other:?}"),
        }

        // Still alive
        harness.dispatch(1, WorkerTask::new(TaskType::Compute, vec![1]));
        match harness.next_non_heartbeat() {
            WorkerMessage::Result(result) => assert!(result.success),
            other => panic!("unexpected {other:?}"),
        }
        harness.stop();
    }

    #[test]
    fn test_malformed_message_reports_error() {
        let harness = start(echo());
        assert_eq!(harness.next_message(), WorkerMessage::Ready { worker_id: 0 });
        harness
            .inbox
            .send(Inbound {
                message: serde_json::json!({"type": "nonsense"}),
                transfer: None,
            })
            .unwrap();
        harness.deque.notify_work();
        assert!(matches!(harness.next_non_heartbeat(), WorkerMessage::Error(_)));
        harness.stop();
    }
}
