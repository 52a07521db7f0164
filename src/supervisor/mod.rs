//! Worker pool supervision.
//!
//! The [`WorkerSupervisor`] owns one [`SharedRegion`] holding the completion
//! doorbell followed by one work-stealing deque per worker slot. It is the
//! only context that pushes or pops those deques; workers and the
//! rebalancer only steal.
//!
//! Every task travels twice: its payload is posted to the owning worker as a
//! `task` message, then its handle is pushed into the worker's deque. The
//! message is always posted first, so a worker that steals a handle already
//! has (or is about to drain) the payload for it.

mod scheduler;
mod slot;

pub use slot::{SlotState, WorkerInfo};

use crate::config::SupervisorConfig;
use crate::deque::WorkStealingDeque;
use crate::error::{ConfigError, ProtocolError, RegionError, SupervisorError, SupervisorResult};
use crate::protocol::{InitializePayload, TaskEnvelope, WorkerMessage};
use crate::region::SharedRegion;
use crate::registry::{Recorded, TaskOutcome, TaskRegistry};
use crate::ring_queue::BoundedRingQueue;
use crate::stats::{PoolMetrics, PoolStats};
use crate::task::{TaskResult, WorkerTask};
use crate::worker::{WorkerContext, WorkerEvent, WorkerEventKind, WorkerEventSink, WorkerHost};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use scheduler::Background;
use slot::WorkerSlot;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Callback invoked for every worker-level or dispatch failure
pub type ErrorHandler = Arc<dyn Fn(&SupervisorError) + Send + Sync>;

/// Byte offset of the completion doorbell inside the shared region
pub const DOORBELL_OFFSET: usize = 0;

/// Upper bound on a single wait between outcome polls
const COMPLETION_POLL: Duration = Duration::from_millis(10);

const fn align8(bytes: usize) -> usize {
    (bytes + 7) & !7
}

/// Byte offset of `slot`'s deque for the given configuration.
pub fn deque_offset(config: &SupervisorConfig, slot: usize) -> usize {
    let doorbell = align8(BoundedRingQueue::required_bytes(config.doorbell_capacity));
    doorbell + slot * align8(WorkStealingDeque::required_bytes(config.deque_capacity))
}

/// Total shared region size for the given configuration.
pub fn region_bytes(config: &SupervisorConfig) -> usize {
    deque_offset(config, config.worker_count)
}

struct ControlState {
    slots: Vec<WorkerSlot>,
    registry: TaskRegistry,
    region: Option<SharedRegion>,
    doorbell: Option<Arc<BoundedRingQueue>>,
}

struct Inner {
    config: SupervisorConfig,
    host: Arc<dyn WorkerHost>,
    control: Mutex<ControlState>,
    metrics: PoolMetrics,
    error_handler: RwLock<Option<ErrorHandler>>,
    running: AtomicBool,
    next_generation: AtomicU32,
    events_tx: Sender<WorkerEvent>,
    events_rx: Receiver<WorkerEvent>,
}

#[derive(Default)]
struct Threads {
    intake: Option<Background>,
    timers: Option<Background>,
}

/// Supervises a pool of isolated worker contexts
pub struct WorkerSupervisor {
    inner: Arc<Inner>,
    threads: Mutex<Threads>,
}

impl WorkerSupervisor {
    /// Creates a supervisor. No worker is spawned until [`start`](Self::start).
    pub fn new(config: SupervisorConfig, host: Arc<dyn WorkerHost>) -> Result<Self, ConfigError> {
        config.validate()?;
        let (events_tx, events_rx) = channel::unbounded();
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                host,
                control: Mutex::new(ControlState {
                    slots: Vec::new(),
                    registry: TaskRegistry::new(),
                    region: None,
                    doorbell: None,
                }),
                metrics: PoolMetrics::new(),
                error_handler: RwLock::new(None),
                running: AtomicBool::new(false),
                next_generation: AtomicU32::new(0),
                events_tx,
                events_rx,
            }),
            threads: Mutex::new(Threads::default()),
        })
    }

    /// Lays out shared memory, spawns every worker and waits for `ready`.
    pub fn start(&self) -> SupervisorResult<()> {
        let mut threads = self.threads.lock();
        if self.inner.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !SharedRegion::is_shared_memory_supported() || !SharedRegion::is_isolation_granted() {
            return Err(RegionError::Unsupported("shared memory with 32-bit atomics").into());
        }

        let config = &self.inner.config;
        info!(
            workers = config.worker_count,
            deque_capacity = config.deque_capacity,
            "Starting worker supervisor"
        );
        self.inner.lay_out()?;
        if threads.intake.is_none() {
            threads.intake = Some(scheduler::start_intake(Arc::clone(&self.inner))?);
        }

        let mut reports = Vec::new();
        if let Err(e) = self.inner.spawn_all(&mut reports) {
            self.abort_start(&mut threads);
            return Err(e);
        }

        let timed_out = self.inner.wait_for_ready();
        if let Some(&slot) = timed_out.first() {
            let timeout_ms = config.init_timeout.as_millis() as u64;
            if config.require_all_workers {
                warn!(worker = slot, timeout_ms, "Worker never became ready");
                self.abort_start(&mut threads);
                return Err(SupervisorError::WorkerInitTimeout { slot, timeout_ms });
            }
            let mut state = self.inner.control.lock();
            for &slot in &timed_out {
                if let Some(worker) = state.slots.get_mut(slot) {
                    retire(worker);
                }
                reports.push(SupervisorError::WorkerInitTimeout { slot, timeout_ms });
            }
        }

        let ready = self.available_workers();
        if ready == 0 {
            self.abort_start(&mut threads);
            return Err(SupervisorError::NoAvailableWorkers);
        }

        self.inner.running.store(true, Ordering::SeqCst);
        match scheduler::start_timers(Arc::clone(&self.inner)) {
            Ok(timers) => threads.timers = Some(timers),
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                self.abort_start(&mut threads);
                return Err(e);
            }
        }
        self.inner.report(reports);
        info!(ready, "Worker supervisor started");
        Ok(())
    }

    fn abort_start(&self, threads: &mut Threads) {
        self.inner.teardown();
        if let Some(mut intake) = threads.intake.take() {
            intake.stop();
        }
    }

    fn ensure_running(&self) -> SupervisorResult<()> {
        if self.inner.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SupervisorError::PoolNotRunning)
        }
    }

    /// Routes a task to the task's affinity slot if eligible, else to the
    /// least busy worker.
    pub fn submit(&self, task: WorkerTask) -> SupervisorResult<Uuid> {
        self.ensure_running()?;
        let mut state = self.inner.control.lock();
        let now = Instant::now();
        let worker = match task.affinity {
            Some(slot)
                if state
                    .slots
                    .get(slot)
                    .is_some_and(|s| s.is_eligible(now, self.inner.config.heartbeat_timeout)) =>
            {
                slot
            }
            _ => self.inner.least_busy(&state)?,
        };
        let ids = self.inner.dispatch(&mut state, worker, vec![task])?;
        ids.into_iter().next().ok_or(SupervisorError::NoAvailableWorkers)
    }

    /// Dispatches a task to a specific worker.
    pub fn post_task(&self, worker: usize, task: WorkerTask) -> SupervisorResult<Uuid> {
        self.ensure_running()?;
        let mut state = self.inner.control.lock();
        let ids = self.inner.dispatch(&mut state, worker, vec![task])?;
        ids.into_iter().next().ok_or(SupervisorError::NoAvailableWorkers)
    }

    /// Dispatches several tasks to one worker.
    ///
    /// Either every task is accepted or none is.
    pub fn post_batch(&self, worker: usize, tasks: Vec<WorkerTask>) -> SupervisorResult<Vec<Uuid>> {
        self.ensure_running()?;
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        let mut state = self.inner.control.lock();
        self.inner.dispatch(&mut state, worker, tasks)
    }

    /// Index of the eligible worker with the fewest active tasks.
    pub fn least_busy_worker(&self) -> SupervisorResult<usize> {
        let state = self.inner.control.lock();
        self.inner.least_busy(&state)
    }

    /// Cancels a task. A result that arrives afterwards is ignored.
    ///
    /// The cancelled outcome stays in the registry until it is taken.
    pub fn cancel(&self, task_id: &Uuid) -> SupervisorResult<()> {
        let mut state = self.inner.control.lock();
        self.inner.cancel_task(&mut state, task_id)
    }

    /// Cancels a task if it is still in flight and forgets it, dropping any
    /// outcome. A result that arrives afterwards is treated as unknown.
    pub fn discard(&self, task_id: &Uuid) -> SupervisorResult<()> {
        let mut state = self.inner.control.lock();
        self.inner.cancel_task(&mut state, task_id)?;
        state.registry.unregister(task_id);
        Ok(())
    }

    /// Takes the outcome of a finished task. `Ok(None)` while it is in flight.
    pub fn try_take_outcome(&self, task_id: &Uuid) -> SupervisorResult<Option<TaskOutcome>> {
        let mut state = self.inner.control.lock();
        if !state.registry.contains(task_id) {
            return Err(SupervisorError::TaskNotFound(*task_id));
        }
        Ok(state.registry.take_outcome(task_id))
    }

    /// Blocks until the task finishes or `timeout` elapses.
    pub fn wait_for(&self, task_id: &Uuid, timeout: Duration) -> SupervisorResult<TaskResult> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(outcome) = self.try_take_outcome(task_id)? {
                return match outcome {
                    TaskOutcome::Completed(result) if result.success => Ok(result),
                    TaskOutcome::Completed(result) => Err(SupervisorError::TaskFailed(
                        result.error.unwrap_or_else(|| "task failed".to_string()),
                    )),
                    TaskOutcome::Failed(reason) => Err(SupervisorError::TaskFailed(reason)),
                    TaskOutcome::Cancelled => Err(SupervisorError::Cancelled(*task_id)),
                    TaskOutcome::TimedOut => Err(SupervisorError::Timeout),
                };
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SupervisorError::Timeout);
            }
            self.wait_for_completion_signal(COMPLETION_POLL.min(deadline - now));
        }
    }

    /// Waits for any worker to ring the completion doorbell.
    ///
    /// Returns the finished handle, or `None` on timeout.
    pub fn wait_for_completion_signal(&self, timeout: Duration) -> Option<u32> {
        let doorbell = self.inner.control.lock().doorbell.clone();
        match doorbell {
            Some(doorbell) => doorbell.dequeue(Some(timeout)),
            None => {
                thread::sleep(timeout);
                None
            }
        }
    }

    /// Registers the error handler, replacing any previous one.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&SupervisorError) + Send + Sync + 'static,
    {
        *self.inner.error_handler.write() = Some(Arc::new(handler));
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.control.lock();
        let now = Instant::now();
        let loads: Vec<_> = state
            .slots
            .iter()
            .map(|s| s.load(now, self.inner.config.heartbeat_timeout))
            .collect();
        self.inner.metrics.snapshot(&loads)
    }

    pub fn worker_info(&self) -> Vec<WorkerInfo> {
        let state = self.inner.control.lock();
        let now = Instant::now();
        state
            .slots
            .iter()
            .map(|s| s.info(now, self.inner.config.heartbeat_timeout))
            .collect()
    }

    /// Configured number of worker slots
    pub fn worker_count(&self) -> usize {
        self.inner.config.worker_count
    }

    /// Workers currently able to take tasks
    pub fn available_workers(&self) -> usize {
        let state = self.inner.control.lock();
        let now = Instant::now();
        state
            .slots
            .iter()
            .filter(|s| s.is_eligible(now, self.inner.config.heartbeat_timeout))
            .count()
    }

    /// Tasks accepted but not yet finished
    pub fn pending_tasks(&self) -> usize {
        self.inner.control.lock().registry.pending_count()
    }

    /// Tasks the registry still holds, finished ones included until their
    /// outcome is taken or discarded
    pub fn tracked_tasks(&self) -> usize {
        self.inner.control.lock().registry.len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Stops the timers, lets workers drain their deques, then terminates
    /// every context.
    ///
    /// Returns [`SupervisorError::Timeout`] when tasks were still outstanding
    /// after `shutdown_timeout`; those tasks are failed.
    pub fn shutdown(&self) -> SupervisorResult<()> {
        let mut threads = self.threads.lock();
        let was_running = self.inner.running.swap(false, Ordering::SeqCst);
        if let Some(mut timers) = threads.timers.take() {
            timers.stop();
        }

        let mut drained = true;
        if was_running {
            info!("Shutting down worker supervisor");
            self.inner.broadcast_terminate();
            drained = self.inner.drain();
        }
        self.inner.teardown();
        if let Some(mut intake) = threads.intake.take() {
            intake.stop();
        }

        if drained {
            Ok(())
        } else {
            Err(SupervisorError::Timeout)
        }
    }

    #[cfg(test)]
    fn run_rebalance(&self) {
        self.inner.rebalance();
    }

    #[cfg(test)]
    fn run_health_check(&self) {
        self.inner.health_check();
    }
}

impl Drop for WorkerSupervisor {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "Supervisor dropped with unfinished tasks");
        }
    }
}

impl Inner {
    fn lay_out(&self) -> SupervisorResult<()> {
        let config = &self.config;
        let region = SharedRegion::new(region_bytes(config))?;
        let doorbell = BoundedRingQueue::new(&region, DOORBELL_OFFSET, config.doorbell_capacity)?;
        let mut slots = Vec::with_capacity(config.worker_count);
        for slot in 0..config.worker_count {
            let offset = deque_offset(config, slot);
            let deque = WorkStealingDeque::new(&region, offset, config.deque_capacity)?;
            slots.push(WorkerSlot::new(slot, deque, offset));
        }
        debug!(bytes = region.byte_length(), "Shared region laid out");

        let mut state = self.control.lock();
        state.slots = slots;
        state.region = Some(region);
        state.doorbell = Some(Arc::new(doorbell));
        Ok(())
    }

    fn spawn_all(&self, reports: &mut Vec<SupervisorError>) -> SupervisorResult<()> {
        let mut guard = self.control.lock();
        let state = &mut *guard;
        for slot in 0..state.slots.len() {
            if let Err(e) = self.spawn_slot(state, slot) {
                if self.config.require_all_workers {
                    return Err(e);
                }
                retire(&mut state.slots[slot]);
                reports.push(e);
            }
        }
        Ok(())
    }

    /// Creates a fresh context for `slot` and posts `initialize`.
    fn spawn_slot(&self, state: &mut ControlState, slot: usize) -> SupervisorResult<()> {
        let transfer = state
            .region
            .as_ref()
            .map(SharedRegion::transferable)
            .ok_or(SupervisorError::PoolNotRunning)?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let worker = &mut state.slots[slot];

        let sink = WorkerEventSink::new(slot, generation, self.events_tx.clone());
        let context = self.host.spawn(slot, sink)?;
        let init = WorkerMessage::Initialize(InitializePayload {
            worker_id: slot,
            deque_offset: worker.deque_offset,
            deque_capacity: self.config.deque_capacity,
            doorbell_offset: DOORBELL_OFFSET,
            doorbell_capacity: self.config.doorbell_capacity,
            heartbeat_interval_ms: self.config.heartbeat_interval.as_millis() as u64,
        });
        let posted = init
            .encode()
            .map_err(SupervisorError::from)
            .and_then(|message| context.post_message(message, Some(transfer)));

        let now = Instant::now();
        worker.generation = generation;
        worker.context = Some(context);
        worker.init_started = Some(now);
        worker.last_heartbeat = now;
        worker.transition(SlotState::Initializing);
        debug!(worker = slot, generation, "Worker spawned");
        posted
    }

    /// Polls until no slot is initializing or `init_timeout` elapses.
    /// Returns the slots that never became ready.
    fn wait_for_ready(&self) -> Vec<usize> {
        let deadline = Instant::now() + self.config.init_timeout;
        loop {
            let waiting: Vec<usize> = self
                .control
                .lock()
                .slots
                .iter()
                .filter(|s| s.state == SlotState::Initializing)
                .map(|s| s.id)
                .collect();
            let now = Instant::now();
            if waiting.is_empty() || now >= deadline {
                return waiting;
            }
            thread::sleep(self.config.ready_poll_interval.min(deadline - now));
        }
    }

    fn least_busy(&self, state: &ControlState) -> SupervisorResult<usize> {
        let now = Instant::now();
        state
            .slots
            .iter()
            .filter(|s| s.is_eligible(now, self.config.heartbeat_timeout))
            .min_by_key(|s| s.active)
            .map(|s| s.id)
            .ok_or(SupervisorError::NoAvailableWorkers)
    }

    fn dispatch(
        &self,
        state: &mut ControlState,
        worker: usize,
        tasks: Vec<WorkerTask>,
    ) -> SupervisorResult<Vec<Uuid>> {
        let ControlState { slots, registry, .. } = state;
        let slot = slots.get_mut(worker).ok_or(SupervisorError::NoAvailableWorkers)?;
        if !slot.state.accepts_work() {
            return Err(SupervisorError::NoAvailableWorkers);
        }
        if slot.free_capacity() < tasks.len() {
            return Err(SupervisorError::QueueFull { worker });
        }
        let context = slot
            .context
            .as_deref()
            .ok_or(SupervisorError::PostFailed { slot: worker })?;

        let mut dispatched = Vec::with_capacity(tasks.len());
        let mut failure = None;
        for task in tasks {
            match dispatch_one(context, &slot.deque, registry, worker, task) {
                Ok(entry) => dispatched.push(entry),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(error) = failure {
            for (id, handle) in &dispatched {
                if registry.cancel(id).is_ok() {
                    post_quietly(context, worker, WorkerMessage::Cancel { handle: *handle });
                }
                registry.take_outcome(id);
            }
            slot.deque.notify_work();
            return Err(error);
        }

        slot.task_started(dispatched.len());
        slot.deque.notify_work();
        self.metrics
            .tasks_submitted
            .fetch_add(dispatched.len() as u64, Ordering::Relaxed);
        trace!(worker, count = dispatched.len(), "Tasks dispatched");
        Ok(dispatched.into_iter().map(|(id, _)| id).collect())
    }

    fn handle_event(&self, event: WorkerEvent) {
        let mut reports = Vec::new();
        {
            let mut guard = self.control.lock();
            let state = &mut *guard;
            let Some(slot) = state.slots.get(event.slot) else {
                return;
            };
            if slot.generation != event.generation {
                trace!(worker = event.slot, generation = event.generation, "Ignoring event from replaced context");
                return;
            }

            match event.kind {
                WorkerEventKind::Message(value) => match WorkerMessage::decode(value) {
                    Ok(message) => self.handle_message(state, event.slot, message, &mut reports),
                    Err(e) => {
                        state.slots[event.slot].failed += 1;
                        reports.push(SupervisorError::WorkerError {
                            slot: event.slot,
                            message: e.to_string(),
                        });
                    }
                },
                WorkerEventKind::Error(message) => {
                    state.slots[event.slot].failed += 1;
                    reports.push(SupervisorError::WorkerError {
                        slot: event.slot,
                        message,
                    });
                }
                WorkerEventKind::Exited => {
                    let slot = &mut state.slots[event.slot];
                    if self.running.load(Ordering::SeqCst)
                        && !matches!(slot.state, SlotState::Terminated | SlotState::Restarting)
                    {
                        warn!(worker = slot.id, "Worker context exited unexpectedly");
                        slot.transition(SlotState::Unresponsive);
                    }
                }
            }
        }
        self.report(reports);
    }

    fn handle_message(
        &self,
        state: &mut ControlState,
        slot: usize,
        message: WorkerMessage,
        reports: &mut Vec<SupervisorError>,
    ) {
        state.slots[slot].last_heartbeat = Instant::now();
        match message {
            WorkerMessage::Ready { worker_id } => {
                let worker = &mut state.slots[slot];
                if worker.transition(SlotState::Ready) {
                    worker.init_started = None;
                    info!(worker = slot, worker_id, generation = worker.generation, "Worker ready");
                }
            }
            WorkerMessage::Heartbeat(beat) => {
                trace!(worker = slot, completed = beat.tasks_completed, "Heartbeat");
            }
            WorkerMessage::Result(result) => {
                let task_id = result.task_id;
                let success = result.success;
                let duration_ms = result.duration_ms;
                match state.registry.complete(result) {
                    Recorded::Accepted { worker } => {
                        self.metrics.record_result(success, duration_ms);
                        if let Some(owner) = worker.and_then(|w| state.slots.get_mut(w)) {
                            owner.task_finished(success);
                        }
                        debug!(worker = slot, task = %task_id, success, duration_ms, "Task finished");
                    }
                    Recorded::Ignored => {}
                    Recorded::Unknown => debug!(worker = slot, task = %task_id, "Result for unknown task"),
                }
            }
            WorkerMessage::Error(payload) => {
                match payload.task_id {
                    Some(task_id) => {
                        self.fail_task(state, &task_id, &payload.message);
                    }
                    None => state.slots[slot].failed += 1,
                }
                reports.push(SupervisorError::WorkerError {
                    slot,
                    message: payload.message,
                });
            }
            other => {
                state.slots[slot].failed += 1;
                reports.push(SupervisorError::WorkerError {
                    slot,
                    message: ProtocolError::Unexpected(other.kind()).to_string(),
                });
            }
        }
    }

    fn cancel_task(&self, state: &mut ControlState, task_id: &Uuid) -> SupervisorResult<()> {
        let handle = state
            .registry
            .handle_of(task_id)
            .ok_or(SupervisorError::TaskNotFound(*task_id))?;
        match state.registry.cancel(task_id) {
            Ok(Some(worker)) => {
                if let Some(slot) = state.slots.get_mut(worker) {
                    slot.task_dropped();
                    if let Some(context) = slot.context.as_deref() {
                        post_quietly(context, worker, WorkerMessage::Cancel { handle });
                    }
                }
                debug!(task = %task_id, worker, "Task cancelled");
            }
            Ok(None) => debug!(task = %task_id, "Task cancelled before dispatch"),
            Err(e) => debug!(task = %task_id, error = %e, "Task already finished"),
        }
        Ok(())
    }

    /// Fails a task and releases its worker's active count.
    fn fail_task(&self, state: &mut ControlState, task_id: &Uuid, reason: &str) -> bool {
        match state.registry.fail(task_id, reason) {
            Ok(worker) => {
                if let Some(slot) = worker.and_then(|w| state.slots.get_mut(w)) {
                    slot.task_finished(false);
                }
                self.metrics.tasks_failed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                debug!(task = %task_id, error = %e, "Task already finished");
                false
            }
        }
    }

    /// Health timer: init timeouts, stale heartbeats, exited contexts and
    /// overdue tasks.
    fn health_check(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        let mut reports = Vec::new();
        {
            let mut guard = self.control.lock();
            let state = &mut *guard;
            for slot in 0..state.slots.len() {
                let worker = &state.slots[slot];
                let failure = match worker.state {
                    SlotState::Initializing => worker
                        .init_started
                        .is_some_and(|at| now.saturating_duration_since(at) >= self.config.init_timeout)
                        .then(|| SupervisorError::WorkerInitTimeout {
                            slot,
                            timeout_ms: self.config.init_timeout.as_millis() as u64,
                        }),
                    SlotState::Ready | SlotState::Busy if !worker.is_healthy(now, self.config.heartbeat_timeout) => {
                        Some(SupervisorError::WorkerUnresponsive {
                            slot,
                            silent_ms: now.saturating_duration_since(worker.last_heartbeat).as_millis() as u64,
                        })
                    }
                    SlotState::Unresponsive => Some(SupervisorError::WorkerError {
                        slot,
                        message: "worker context exited".to_string(),
                    }),
                    _ => None,
                };
                if let Some(error) = failure {
                    reports.push(error);
                    self.restart(state, slot, &mut reports);
                }
            }
            self.expire_overdue(state, now);
        }
        self.report(reports);
    }

    /// Replaces the context of `slot`. Tasks it owned are failed, never
    /// resubmitted.
    fn restart(&self, state: &mut ControlState, slot: usize, reports: &mut Vec<SupervisorError>) {
        let worker = &mut state.slots[slot];
        worker.transition(SlotState::Unresponsive);
        worker.transition(SlotState::Restarting);
        if let Some(mut context) = worker.context.take() {
            context.terminate();
        }
        worker.deque.notify_work();
        let mut drained = 0usize;
        while worker.deque.pop().is_some() {
            drained += 1;
        }
        warn!(worker = slot, drained, "Restarting worker");

        let reason = format!("worker {slot} restarted");
        for task_id in state.registry.assigned_to(slot) {
            if state.registry.fail(&task_id, reason.as_str()).is_ok() {
                self.metrics.tasks_failed.fetch_add(1, Ordering::Relaxed);
                state.slots[slot].failed += 1;
            }
        }
        state.slots[slot].active = 0;
        self.metrics.worker_restarts.fetch_add(1, Ordering::Relaxed);

        match self.spawn_slot(state, slot) {
            Ok(()) => info!(worker = slot, "Worker respawned"),
            Err(e) => {
                error!(worker = slot, error = %e, "Worker could not be respawned");
                retire(&mut state.slots[slot]);
                reports.push(e);
            }
        }
    }

    fn expire_overdue(&self, state: &mut ControlState, now: Instant) {
        for task_id in state.registry.overdue(now, self.config.task_timeout) {
            let handle = state.registry.handle_of(&task_id);
            let Ok(worker) = state.registry.time_out(&task_id) else {
                continue;
            };
            self.metrics.tasks_failed.fetch_add(1, Ordering::Relaxed);
            warn!(task = %task_id, worker, "Task timed out");
            let Some(slot) = worker.and_then(|w| state.slots.get_mut(w)) else {
                continue;
            };
            slot.task_finished(false);
            if let (Some(handle), Some(context)) = (handle, slot.context.as_deref()) {
                post_quietly(context, slot.id, WorkerMessage::Cancel { handle });
            }
        }
    }

    /// Rebalance timer: feeds deques below `steal_threshold` from the fullest
    /// other deque, one handle per needy worker per tick.
    fn rebalance(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        let threshold = self.config.steal_threshold;
        let mut guard = self.control.lock();
        let state = &mut *guard;

        let eligible: Vec<usize> = state
            .slots
            .iter()
            .filter(|s| s.is_eligible(now, self.config.heartbeat_timeout))
            .map(|s| s.id)
            .collect();
        if eligible.len() < 2 {
            return;
        }

        for &needy in &eligible {
            if state.slots[needy].deque.len() >= threshold {
                continue;
            }
            let Some(donor) = eligible
                .iter()
                .copied()
                .filter(|&d| d != needy)
                .max_by_key(|&d| state.slots[d].deque.len())
            else {
                continue;
            };
            if state.slots[donor].deque.len() <= threshold {
                continue;
            }

            self.metrics.steal_attempts.fetch_add(1, Ordering::Relaxed);
            let Some(handle) = state.slots[donor].deque.steal() else {
                continue;
            };
            if self.move_handle(state, handle, donor, needy) {
                self.metrics.steal_successes.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn move_handle(&self, state: &mut ControlState, handle: u32, donor: usize, needy: usize) -> bool {
        let Some(task) = state.registry.reassign(handle, needy).cloned() else {
            trace!(handle, "Dropping handle of finished task");
            return false;
        };
        let task_id = task.id;

        let target = &state.slots[needy];
        let delivered = match (WorkerMessage::Task(TaskEnvelope { handle, task }).encode(), target.context.as_deref()) {
            (Ok(message), Some(context)) => context.post_message(message, None).is_ok(),
            _ => false,
        };
        if !delivered || !target.deque.push(handle) {
            if delivered && let Some(context) = target.context.as_deref() {
                post_quietly(context, needy, WorkerMessage::Release { handle });
            }
            state.registry.reassign(handle, donor);
            if !state.slots[donor].deque.push(handle) {
                self.fail_task(state, &task_id, "stolen handle could not be requeued");
            }
            return false;
        }
        target.deque.notify_work();

        if let Some(context) = state.slots[donor].context.as_deref() {
            post_quietly(context, donor, WorkerMessage::Release { handle });
        }
        state.slots[donor].task_dropped();
        state.slots[needy].task_started(1);
        debug!(handle, from = donor, to = needy, "Moved task");
        true
    }

    fn broadcast_terminate(&self) {
        let state = self.control.lock();
        for slot in &state.slots {
            if let Some(context) = slot.context.as_deref() {
                post_quietly(context, slot.id, WorkerMessage::Terminate);
            }
            slot.deque.notify_work();
        }
    }

    /// Waits for in-flight tasks, failing leftovers at `shutdown_timeout`.
    fn drain(&self) -> bool {
        let deadline = Instant::now() + self.config.shutdown_timeout;
        loop {
            let pending = self.control.lock().registry.pending_count();
            if pending == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(pending, "Shutdown timed out with tasks outstanding");
                let mut guard = self.control.lock();
                let state = &mut *guard;
                for task_id in state.registry.in_flight() {
                    self.fail_task(state, &task_id, "supervisor shut down");
                }
                return false;
            }
            debug!(pending, "Waiting for tasks to drain");
            thread::sleep(self.config.drain_poll_interval.min(deadline - now));
        }
    }

    fn teardown(&self) {
        let mut state = self.control.lock();
        for slot in &mut state.slots {
            retire(slot);
        }
        state.slots.clear();
        state.region = None;
        state.doorbell = None;
    }

    /// Hands failures to the log and the error handler, outside the lock.
    fn report(&self, errors: Vec<SupervisorError>) {
        if errors.is_empty() {
            return;
        }
        let handler = self.error_handler.read().clone();
        for error in errors {
            if error.is_worker_level() {
                warn!(error = %error, "Worker failure");
            } else {
                error!(error = %error, "Supervisor failure");
            }
            if let Some(handler) = &handler {
                handler(&error);
            }
        }
    }
}

/// Registers one task, posts its payload, then makes its handle visible.
fn dispatch_one(
    context: &dyn WorkerContext,
    deque: &WorkStealingDeque,
    registry: &mut TaskRegistry,
    worker: usize,
    task: WorkerTask,
) -> SupervisorResult<(Uuid, u32)> {
    let task_id = task.id;
    let handle = registry.register(task.clone());
    let posted = WorkerMessage::Task(TaskEnvelope { handle, task })
        .encode()
        .map_err(SupervisorError::from)
        .and_then(|message| context.post_message(message, None));
    if let Err(e) = posted {
        registry.unregister(&task_id);
        return Err(e);
    }
    if !deque.push(handle) {
        registry.unregister(&task_id);
        post_quietly(context, worker, WorkerMessage::Release { handle });
        return Err(SupervisorError::QueueFull { worker });
    }
    if let Err(e) = registry.mark_dispatched(&task_id, worker) {
        warn!(task = %task_id, error = %e, "Cannot mark task running");
    }
    Ok((task_id, handle))
}

fn post_quietly(context: &dyn WorkerContext, slot: usize, message: WorkerMessage) {
    let kind = message.kind();
    let delivered = message
        .encode()
        .map_err(SupervisorError::from)
        .and_then(|value| context.post_message(value, None));
    if let Err(e) = delivered {
        debug!(worker = slot, kind, error = %e, "Message not delivered");
    }
}

fn retire(slot: &mut WorkerSlot) {
    if let Some(mut context) = slot.context.take() {
        context.terminate();
    }
    slot.deque.notify_work();
    slot.transition(SlotState::Terminated);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskType;
    use crate::worker::{ThreadWorkerHost, TaskExecutor};
    use crate::region::TransferableRegion;
    use std::sync::atomic::AtomicUsize;

    /// Host whose contexts answer `initialize` and then never run anything
    struct StalledHost {
        ready: fn(usize) -> bool,
    }

    struct StalledContext {
        slot: usize,
        ready: bool,
        events: WorkerEventSink,
    }

    impl WorkerHost for StalledHost {
        fn spawn(&self, slot: usize, events: WorkerEventSink) -> SupervisorResult<Box<dyn WorkerContext>> {
            Ok(Box::new(StalledContext {
                slot,
                ready: (self.ready)(slot),
                events,
            }))
        }
    }

    impl WorkerContext for StalledContext {
        fn post_message(&self, message: serde_json::Value, _: Option<TransferableRegion>) -> SupervisorResult<()> {
            if self.ready && message["type"] == "initialize" {
                let ready = WorkerMessage::Ready { worker_id: self.slot }.encode()?;
                self.events.message(ready);
            }
            Ok(())
        }

        fn terminate(&mut self) {}
    }

    fn stalled(workers: usize) -> WorkerSupervisor {
        let config = SupervisorConfig::default()
            .with_workers(workers)
            .with_deque_capacity(4)
            .with_init_timeout(Duration::from_millis(500))
            .with_steal_interval(Duration::from_secs(3600))
            .with_health_check_interval(Duration::from_secs(3600))
            .with_shutdown_timeout(Duration::from_millis(50));
        let supervisor = WorkerSupervisor::new(config, Arc::new(StalledHost { ready: |_| true })).unwrap();
        supervisor.start().unwrap();
        supervisor
    }

    fn echo_supervisor(workers: usize) -> WorkerSupervisor {
        let executor: Arc<dyn TaskExecutor> =
            Arc::new(|task: &WorkerTask| -> Result<Vec<u8>, String> { Ok(task.payload.data.clone()) });
        let config = SupervisorConfig::default()
            .with_workers(workers)
            .with_deque_capacity(16)
            .with_init_timeout(Duration::from_secs(5));
        let supervisor = WorkerSupervisor::new(config, Arc::new(ThreadWorkerHost::new(executor))).unwrap();
        supervisor.start().unwrap();
        supervisor
    }

    fn task(byte: u8) -> WorkerTask {
        WorkerTask::new(TaskType::Compute, vec![byte])
    }

    #[test]
    fn test_region_layout() {
        let config = SupervisorConfig::default()
            .with_workers(2)
            .with_deque_capacity(16)
            .with_doorbell_capacity(16);
        assert_eq!(deque_offset(&config, 0), 144);
        assert_eq!(deque_offset(&config, 1), 144 + 72);
        assert_eq!(region_bytes(&config), 144 + 2 * 72);
    }

    #[test]
    fn test_submit_before_start() {
        let supervisor =
            WorkerSupervisor::new(SupervisorConfig::default().with_workers(1), Arc::new(StalledHost { ready: |_| true }))
                .unwrap();
        assert!(matches!(supervisor.submit(task(1)), Err(SupervisorError::PoolNotRunning)));
    }

    #[test]
    fn test_submit_and_wait() {
        let supervisor = echo_supervisor(2);
        let id = supervisor.submit(task(7)).unwrap();
        let result = supervisor.wait_for(&id, Duration::from_secs(5)).unwrap();
        assert_eq!(result.data, Some(vec![7]));

        let stats = supervisor.stats();
        assert_eq!(stats.tasks_submitted, 1);
        assert_eq!(stats.tasks_completed, 1);
        assert_eq!(stats.worker_count, 2);
        supervisor.shutdown().unwrap();
        assert!(!supervisor.is_running());
    }

    #[test]
    fn test_batch_runs_every_task() {
        let supervisor = echo_supervisor(2);
        let ids = supervisor.post_batch(1, (0..8).map(task).collect()).unwrap();
        for (i, id) in ids.iter().enumerate() {
            let result = supervisor.wait_for(id, Duration::from_secs(5)).unwrap();
            assert_eq!(result.data, Some(vec![i as u8]));
        }
        supervisor.shutdown().unwrap();
    }

    #[test]
    fn test_queue_full_rejects_task() {
        let supervisor = stalled(1);
        for i in 0..4 {
            supervisor.post_task(0, task(i)).unwrap();
        }
        assert!(matches!(
            supervisor.post_task(0, task(9)),
            Err(SupervisorError::QueueFull { worker: 0 })
        ));
        assert!(matches!(
            supervisor.post_batch(0, vec![task(1), task(2)]),
            Err(SupervisorError::QueueFull { worker: 0 })
        ));
        assert_eq!(supervisor.pending_tasks(), 4);
    }

    #[test]
    fn test_least_busy_prefers_first_idle() {
        let supervisor = stalled(3);
        assert_eq!(supervisor.least_busy_worker().unwrap(), 0);
        supervisor.post_task(0, task(0)).unwrap();
        supervisor.post_task(1, task(1)).unwrap();
        assert_eq!(supervisor.least_busy_worker().unwrap(), 2);
        supervisor.post_task(2, task(2)).unwrap();
        supervisor.post_task(0, task(3)).unwrap();
        assert_eq!(supervisor.least_busy_worker().unwrap(), 1);
        let info = supervisor.worker_info();
        assert_eq!(info[0].state, SlotState::Busy);
        assert_eq!(info[0].active_tasks, 2);
    }

    #[test]
    fn test_cancel_marks_outcome() {
        let supervisor = stalled(1);
        let id = supervisor.post_task(0, task(1)).unwrap();
        supervisor.cancel(&id).unwrap();
        assert!(matches!(
            supervisor.wait_for(&id, Duration::from_millis(100)),
            Err(SupervisorError::Cancelled(cancelled)) if cancelled == id
        ));
        assert!(matches!(supervisor.cancel(&id), Err(SupervisorError::TaskNotFound(_))));
        assert_eq!(supervisor.worker_info()[0].active_tasks, 0);
    }

    #[test]
    fn test_discard_forgets_task() {
        let supervisor = stalled(1);
        let running = supervisor.post_task(0, task(1)).unwrap();
        let cancelled = supervisor.post_task(0, task(2)).unwrap();
        supervisor.cancel(&cancelled).unwrap();
        assert_eq!(supervisor.tracked_tasks(), 2);

        supervisor.discard(&running).unwrap();
        supervisor.discard(&cancelled).unwrap();
        assert_eq!(supervisor.tracked_tasks(), 0);
        assert_eq!(supervisor.pending_tasks(), 0);
        assert_eq!(supervisor.worker_info()[0].active_tasks, 0);
        assert!(matches!(
            supervisor.try_take_outcome(&running),
            Err(SupervisorError::TaskNotFound(_))
        ));
        assert!(matches!(supervisor.discard(&running), Err(SupervisorError::TaskNotFound(_))));
    }

    #[test]
    fn test_rebalance_moves_one_handle() {
        let supervisor = stalled(2);
        supervisor
            .post_batch(0, vec![task(0), task(1), task(2)])
            .unwrap();
        supervisor.run_rebalance();

        let info = supervisor.worker_info();
        assert_eq!(info[0].queued, 2);
        assert_eq!(info[1].queued, 1);
        assert_eq!(info[1].active_tasks, 1);
        let stats = supervisor.stats();
        assert_eq!(stats.steal_attempts, 1);
        assert_eq!(stats.steal_successes, 1);

        // Both deques now meet the threshold
        supervisor.run_rebalance();
        assert_eq!(supervisor.stats().steal_attempts, 1);
        assert_eq!(supervisor.worker_info()[1].queued, 1);
    }

    #[test]
    fn test_overdue_task_times_out() {
        let config = SupervisorConfig::default()
            .with_workers(1)
            .with_task_timeout(Duration::from_millis(20))
            .with_health_check_interval(Duration::from_secs(3600))
            .with_shutdown_timeout(Duration::from_millis(50));
        let supervisor = WorkerSupervisor::new(config, Arc::new(StalledHost { ready: |_| true })).unwrap();
        supervisor.start().unwrap();
        let id = supervisor.post_task(0, task(0)).unwrap();
        thread::sleep(Duration::from_millis(40));
        supervisor.run_health_check();
        assert!(matches!(supervisor.try_take_outcome(&id), Ok(Some(TaskOutcome::TimedOut))));
        assert_eq!(supervisor.stats().tasks_failed, 1);
    }

    #[test]
    fn test_init_timeout_fails_start() {
        let config = SupervisorConfig::default()
            .with_workers(2)
            .with_init_timeout(Duration::from_millis(100));
        let supervisor = WorkerSupervisor::new(config, Arc::new(StalledHost { ready: |slot| slot == 0 })).unwrap();
        assert!(matches!(
            supervisor.start(),
            Err(SupervisorError::WorkerInitTimeout { slot: 1, timeout_ms: 100 })
        ));
        assert!(!supervisor.is_running());
    }

    #[test]
    fn test_init_timeout_tolerated_when_optional() {
        let config = SupervisorConfig::default()
            .with_workers(2)
            .with_init_timeout(Duration::from_millis(100))
            .with_require_all_workers(false);
        let supervisor = WorkerSupervisor::new(config, Arc::new(StalledHost { ready: |slot| slot == 1 })).unwrap();
        let reported = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&reported);
        supervisor.on_error(move |e| {
            if matches!(e, SupervisorError::WorkerInitTimeout { slot: 0, .. }) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        supervisor.start().unwrap();
        assert_eq!(reported.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.available_workers(), 1);
        assert_eq!(supervisor.worker_info()[0].state, SlotState::Terminated);
        assert_eq!(supervisor.least_busy_worker().unwrap(), 1);
    }
}
