//! Per-slot worker bookkeeping.

use crate::deque::WorkStealingDeque;
use crate::stats::WorkerLoad;
use crate::worker::WorkerContext;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::warn;

/// Lifecycle of a worker slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Created,
    Initializing,
    Ready,
    Busy,
    Unresponsive,
    Restarting,
    Terminated,
}

impl SlotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotState::Created => "created",
            SlotState::Initializing => "initializing",
            SlotState::Ready => "ready",
            SlotState::Busy => "busy",
            SlotState::Unresponsive => "unresponsive",
            SlotState::Restarting => "restarting",
            SlotState::Terminated => "terminated",
        }
    }

    /// Whether the slot may move to `next`.
    pub fn can_transition_to(&self, next: SlotState) -> bool {
        use SlotState::*;
        match (*self, next) {
            (Created, Initializing) => true,
            (Initializing, Ready) | (Initializing, Unresponsive) => true,
            (Ready, Busy) | (Busy, Ready) => true,
            (Ready, Unresponsive) | (Busy, Unresponsive) => true,
            (Unresponsive, Restarting) => true,
            (Restarting, Initializing) => true,
            (Terminated, _) => false,
            (_, Terminated) => true,
            _ => false,
        }
    }

    /// Whether tasks may be routed to a slot in this state
    pub fn accepts_work(&self) -> bool {
        matches!(self, SlotState::Ready | SlotState::Busy)
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public view of one worker slot
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: usize,
    pub state: SlotState,
    /// Incremented every time the slot's context is replaced
    pub generation: u32,
    pub active_tasks: usize,
    pub queued: usize,
    pub completed: u64,
    pub failed: u64,
    pub healthy: bool,
    pub last_heartbeat_ms: u64,
}

pub(crate) struct WorkerSlot {
    pub id: usize,
    pub state: SlotState,
    pub generation: u32,
    pub context: Option<Box<dyn WorkerContext>>,
    pub deque: WorkStealingDeque,
    pub deque_offset: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub last_heartbeat: Instant,
    pub init_started: Option<Instant>,
}

impl WorkerSlot {
    pub fn new(id: usize, deque: WorkStealingDeque, deque_offset: usize) -> Self {
        Self {
            id,
            state: SlotState::Created,
            generation: 0,
            context: None,
            deque,
            deque_offset,
            active: 0,
            completed: 0,
            failed: 0,
            last_heartbeat: Instant::now(),
            init_started: None,
        }
    }

    /// Moves to `next`, refusing (and logging) illegal transitions.
    pub fn transition(&mut self, next: SlotState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_transition_to(next) {
            warn!(worker = self.id, from = %self.state, to = %next, "Illegal worker state transition");
            return false;
        }
        self.state = next;
        true
    }

    /// Keeps `Ready`/`Busy` in step with the active task count.
    pub fn refresh_busy(&mut self) {
        match (self.state, self.active) {
            (SlotState::Ready, n) if n > 0 => self.state = SlotState::Busy,
            (SlotState::Busy, 0) => self.state = SlotState::Ready,
            _ => {}
        }
    }

    pub fn task_started(&mut self, count: usize) {
        self.active += count;
        self.refresh_busy();
    }

    pub fn task_finished(&mut self, success: bool) {
        self.active = self.active.saturating_sub(1);
        if success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        self.refresh_busy();
    }

    /// A task left this slot without a result (moved or cancelled).
    pub fn task_dropped(&mut self) {
        self.active = self.active.saturating_sub(1);
        self.refresh_busy();
    }

    pub fn is_healthy(&self, now: Instant, heartbeat_timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat) < heartbeat_timeout
    }

    /// Ready or busy, with a fresh heartbeat
    pub fn is_eligible(&self, now: Instant, heartbeat_timeout: Duration) -> bool {
        self.state.accepts_work() && self.is_healthy(now, heartbeat_timeout)
    }

    /// Free deque slots
    pub fn free_capacity(&self) -> usize {
        (self.deque.capacity() as usize).saturating_sub(self.deque.len())
    }

    pub fn info(&self, now: Instant, heartbeat_timeout: Duration) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            state: self.state,
            generation: self.generation,
            active_tasks: self.active,
            queued: self.deque.len(),
            completed: self.completed,
            failed: self.failed,
            healthy: self.state.accepts_work() && self.is_healthy(now, heartbeat_timeout),
            last_heartbeat_ms: now.saturating_duration_since(self.last_heartbeat).as_millis() as u64,
        }
    }

    pub fn load(&self, now: Instant, heartbeat_timeout: Duration) -> WorkerLoad {
        WorkerLoad {
            healthy: self.is_eligible(now, heartbeat_timeout),
            active_tasks: self.active,
            queued: self.deque.len(),
            capacity: self.deque.capacity() as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::SharedRegion;

    fn slot() -> WorkerSlot {
        let region = SharedRegion::new(WorkStealingDeque::required_bytes(4)).unwrap();
        WorkerSlot::new(0, WorkStealingDeque::new(&region, 0, 4).unwrap(), 0)
    }

    #[test]
    fn test_restart_cycle_transitions() {
        use SlotState::*;
        let path = [Initializing, Ready, Busy, Unresponsive, Restarting, Initializing, Ready];
        let mut state = Created;
        for next in path {
            assert!(state.can_transition_to(next), "{state} -> {next}");
            state = next;
        }
    }

    #[test]
    fn test_terminated_is_final() {
        for next in [
            SlotState::Created,
            SlotState::Initializing,
            SlotState::Ready,
            SlotState::Restarting,
        ] {
            assert!(!SlotState::Terminated.can_transition_to(next));
        }
        assert!(SlotState::Busy.can_transition_to(SlotState::Terminated));
        assert!(!SlotState::Ready.can_transition_to(SlotState::Restarting));
    }

    #[test]
    fn test_busy_tracks_active_count() {
        let mut slot = slot();
        assert!(slot.transition(SlotState::Initializing));
        assert!(slot.transition(SlotState::Ready));
        slot.task_started(2);
        assert_eq!(slot.state, SlotState::Busy);
        slot.task_finished(true);
        assert_eq!(slot.state, SlotState::Busy);
        slot.task_finished(false);
        assert_eq!(slot.state, SlotState::Ready);
        assert_eq!((slot.completed, slot.failed), (1, 1));
    }

    #[test]
    fn test_illegal_transition_refused() {
        let mut slot = slot();
        assert!(!slot.transition(SlotState::Ready));
        assert_eq!(slot.state, SlotState::Created);
    }

    #[test]
    fn test_stale_heartbeat_is_unhealthy() {
        let mut slot = slot();
        slot.transition(SlotState::Initializing);
        slot.transition(SlotState::Ready);
        let later = slot.last_heartbeat + Duration::from_secs(31);
        assert!(slot.is_eligible(slot.last_heartbeat, Duration::from_secs(30)));
        assert!(!slot.is_eligible(later, Duration::from_secs(30)));
        assert!(!slot.info(later, Duration::from_secs(30)).healthy);
    }
}
