//! Pool-wide counters and point-in-time statistics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters updated by the supervisor as tasks flow through the pool.
#[derive(Debug)]
pub struct PoolMetrics {
    /// Tasks accepted by `submit`/`post_task`/`post_batch`.
    pub tasks_submitted: AtomicU64,
    /// Tasks whose worker reported success.
    pub tasks_completed: AtomicU64,
    /// Tasks that failed, timed out or were lost with a worker.
    pub tasks_failed: AtomicU64,
    /// Rebalancing steal attempts.
    pub steal_attempts: AtomicU64,
    /// Rebalancing steals that moved a handle.
    pub steal_successes: AtomicU64,
    /// Sum of reported task durations in microseconds.
    pub total_task_micros: AtomicU64,
    /// Tasks that reported a duration; failures without a worker result
    /// (restarts, timeouts) are not among them.
    pub timed_tasks: AtomicU64,
    /// Worker slot restarts.
    pub worker_restarts: AtomicU64,
    /// Time when metrics collection started.
    pub start_time: Instant,
}

impl Default for PoolMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Load of one worker slot at snapshot time
#[derive(Debug, Clone, Copy)]
pub struct WorkerLoad {
    pub healthy: bool,
    pub active_tasks: usize,
    pub queued: usize,
    pub capacity: usize,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self {
            tasks_submitted: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            steal_attempts: AtomicU64::new(0),
            steal_successes: AtomicU64::new(0),
            total_task_micros: AtomicU64::new(0),
            timed_tasks: AtomicU64::new(0),
            worker_restarts: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Records a finished task and its reported duration.
    pub fn record_result(&self, success: bool, duration_ms: f64) {
        if success {
            self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        }
        let micros = (duration_ms.max(0.0) * 1000.0) as u64;
        self.total_task_micros.fetch_add(micros, Ordering::Relaxed);
        self.timed_tasks.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot combined with the current per-worker load.
    pub fn snapshot(&self, workers: &[WorkerLoad]) -> PoolStats {
        let tasks_completed = self.tasks_completed.load(Ordering::Relaxed);
        let tasks_failed = self.tasks_failed.load(Ordering::Relaxed);
        let steal_attempts = self.steal_attempts.load(Ordering::Relaxed);
        let steal_successes = self.steal_successes.load(Ordering::Relaxed);
        let timed_tasks = self.timed_tasks.load(Ordering::Relaxed);

        let queued: usize = workers.iter().map(|w| w.queued).sum();
        let capacity: usize = workers.iter().map(|w| w.capacity).sum();

        PoolStats {
            worker_count: workers.len(),
            active_workers: workers.iter().filter(|w| w.active_tasks > 0).count(),
            healthy_workers: workers.iter().filter(|w| w.healthy).count(),
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_completed,
            tasks_failed,
            steal_attempts,
            steal_successes,
            steal_success_rate: if steal_attempts > 0 {
                steal_successes as f64 / steal_attempts as f64
            } else {
                0.0
            },
            average_task_ms: if timed_tasks > 0 {
                self.total_task_micros.load(Ordering::Relaxed) as f64 / 1000.0 / timed_tasks as f64
            } else {
                0.0
            },
            utilization: if capacity > 0 {
                queued as f64 / capacity as f64
            } else {
                0.0
            },
            worker_restarts: self.worker_restarts.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

/// Snapshot of pool statistics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub worker_count: usize,
    pub active_workers: usize,
    pub healthy_workers: usize,
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub steal_attempts: u64,
    pub steal_successes: u64,
    pub steal_success_rate: f64,
    pub average_task_ms: f64,
    /// Queued handles over total deque capacity
    pub utilization: f64,
    pub worker_restarts: u64,
    pub elapsed_seconds: f64,
}

impl PoolStats {
    /// Calculates finished tasks per second.
    pub fn tasks_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            (self.tasks_completed + self.tasks_failed) as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Tasks accepted but not yet finished.
    pub fn in_flight(&self) -> u64 {
        self.tasks_submitted
            .saturating_sub(self.tasks_completed + self.tasks_failed)
    }
}
