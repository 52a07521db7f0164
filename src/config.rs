//! Configuration for the worker pool, the render coordinator and the
//! partitioner.
//!
//! Every struct has a `Default` tuned for interactive rendering, builder-style
//! `with_*` setters and a `validate()` pass that runs before anything is
//! spawned. Durations serialize as whole milliseconds.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on pool size
pub const MAX_WORKERS: usize = 256;

/// Default per-worker deque capacity (power of two)
pub const DEFAULT_DEQUE_CAPACITY: u32 = 256;

/// Default completion doorbell capacity (power of two)
pub const DEFAULT_DOORBELL_CAPACITY: u32 = 1024;

/// Default node count below which rendering stays on the calling thread
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 100;

/// Configuration for [`WorkerSupervisor`](crate::supervisor::WorkerSupervisor)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Number of worker slots
    pub worker_count: usize,

    /// Capacity of each worker's deque (power of two)
    pub deque_capacity: u32,

    /// Capacity of the shared completion doorbell ring (power of two)
    pub doorbell_capacity: u32,

    /// Maximum time to wait for a worker's `ready` message
    #[serde(with = "duration_ms")]
    pub init_timeout: Duration,

    /// Poll interval while waiting for workers to become ready
    #[serde(with = "duration_ms")]
    pub ready_poll_interval: Duration,

    /// How often an idle worker emits a heartbeat
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,

    /// Heartbeat age after which a worker is considered unresponsive
    #[serde(with = "duration_ms")]
    pub heartbeat_timeout: Duration,

    /// Health check timer period
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,

    /// Rebalancing timer period
    #[serde(with = "duration_ms")]
    pub steal_interval: Duration,

    /// Deques with fewer queued handles than this receive stolen work
    pub steal_threshold: usize,

    /// Maximum time a dispatched task may run before it is failed
    #[serde(with = "duration_ms")]
    pub task_timeout: Duration,

    /// Maximum time shutdown waits for outstanding tasks
    #[serde(with = "duration_ms")]
    pub shutdown_timeout: Duration,

    /// Poll interval while draining at shutdown
    #[serde(with = "duration_ms")]
    pub drain_poll_interval: Duration,

    /// Fail `start()` when any worker misses `init_timeout`
    pub require_all_workers: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().clamp(1, MAX_WORKERS),
            deque_capacity: DEFAULT_DEQUE_CAPACITY,
            doorbell_capacity: DEFAULT_DOORBELL_CAPACITY,
            init_timeout: Duration::from_secs(5),
            ready_poll_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(5),
            steal_interval: Duration::from_millis(100),
            steal_threshold: 1,
            task_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            drain_poll_interval: Duration::from_millis(100),
            require_all_workers: true,
        }
    }
}

impl SupervisorConfig {
    /// Set the number of worker slots
    pub fn with_workers(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Set the per-worker deque capacity
    pub fn with_deque_capacity(mut self, capacity: u32) -> Self {
        self.deque_capacity = capacity;
        self
    }

    /// Set the doorbell ring capacity
    pub fn with_doorbell_capacity(mut self, capacity: u32) -> Self {
        self.doorbell_capacity = capacity;
        self
    }

    /// Set the worker initialization timeout
    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// Set the worker heartbeat period
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the heartbeat staleness limit
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Set the health check period
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the rebalancing period
    pub fn with_steal_interval(mut self, interval: Duration) -> Self {
        self.steal_interval = interval;
        self
    }

    /// Set the occupancy below which a deque receives stolen work
    pub fn with_steal_threshold(mut self, threshold: usize) -> Self {
        self.steal_threshold = threshold;
        self
    }

    /// Set the per-task running time limit
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Set the shutdown drain limit
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Tolerate workers that miss the init timeout
    pub fn with_require_all_workers(mut self, require: bool) -> Self {
        self.require_all_workers = require;
        self
    }

    /// Overlay `RENDERSHARD_*` environment variables on the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = env_parse::<usize>("RENDERSHARD_WORKERS")? {
            config.worker_count = v;
        }
        if let Some(v) = env_parse::<u32>("RENDERSHARD_DEQUE_CAPACITY")? {
            config.deque_capacity = v;
        }
        if let Some(v) = env_parse::<u64>("RENDERSHARD_STEAL_INTERVAL_MS")? {
            config.steal_interval = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("RENDERSHARD_HEARTBEAT_TIMEOUT_MS")? {
            config.heartbeat_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("RENDERSHARD_TASK_TIMEOUT_MS")? {
            config.task_timeout = Duration::from_millis(v);
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 || self.worker_count > MAX_WORKERS {
            return Err(ConfigError::InvalidWorkerCount {
                count: self.worker_count,
                max: MAX_WORKERS,
            });
        }
        check_capacity("deque_capacity", self.deque_capacity)?;
        check_capacity("doorbell_capacity", self.doorbell_capacity)?;
        check_interval("init_timeout", self.init_timeout)?;
        check_interval("ready_poll_interval", self.ready_poll_interval)?;
        check_interval("heartbeat_interval", self.heartbeat_interval)?;
        check_interval("heartbeat_timeout", self.heartbeat_timeout)?;
        check_interval("health_check_interval", self.health_check_interval)?;
        check_interval("steal_interval", self.steal_interval)?;
        check_interval("drain_poll_interval", self.drain_poll_interval)?;
        Ok(())
    }
}

/// Partitioning strategy for [`TreePartitioner`](crate::partition::TreePartitioner)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// Cut every node at exactly `level`
    Depth { level: u32 },
    /// Cut subtrees whose estimated work reaches `threshold`
    Size { threshold: u64 },
    /// Depth-bounded cutting with size limits
    Hybrid {
        max_depth: u32,
        min_size: u64,
        max_size: u64,
    },
    /// Greedy batching of sibling subtrees up to `target_work`
    WorkBalanced { target_work: u64 },
}

impl Default for PartitionStrategy {
    fn default() -> Self {
        PartitionStrategy::Hybrid {
            max_depth: 3,
            min_size: 50,
            max_size: 1000,
        }
    }
}

impl PartitionStrategy {
    /// Short name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            PartitionStrategy::Depth { .. } => "depth",
            PartitionStrategy::Size { .. } => "size",
            PartitionStrategy::Hybrid { .. } => "hybrid",
            PartitionStrategy::WorkBalanced { .. } => "work_balanced",
        }
    }
}

/// Configuration for [`ParallelExecutionCoordinator`](crate::coordinator::ParallelExecutionCoordinator)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Trees with fewer nodes render on the calling thread
    pub parallel_threshold: usize,

    /// Maximum time to wait for all partition results
    #[serde(with = "duration_ms")]
    pub worker_timeout: Duration,

    /// Result poll interval
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,

    /// Partitioning strategy for parallel renders
    pub strategy: PartitionStrategy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
            worker_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            strategy: PartitionStrategy::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Set the sequential fallback threshold
    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    /// Set the render deadline
    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    /// Set the partitioning strategy
    pub fn with_strategy(mut self, strategy: PartitionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_interval("worker_timeout", self.worker_timeout)?;
        check_interval("poll_interval", self.poll_interval)?;
        Ok(())
    }
}

/// Configuration for [`ThreadWorkerHost`](crate::worker::ThreadWorkerHost)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Pin each worker thread to the core matching its slot
    pub pin_to_core: bool,

    /// Thread name prefix; the slot index is appended
    pub thread_name_prefix: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            pin_to_core: false,
            thread_name_prefix: "rendershard-worker".to_string(),
        }
    }
}

impl HostConfig {
    /// Enable or disable core pinning
    pub fn with_pin_to_core(mut self, pin: bool) -> Self {
        self.pin_to_core = pin;
        self
    }
}

fn check_capacity(field: &'static str, value: u32) -> Result<(), ConfigError> {
    if value == 0 || !value.is_power_of_two() {
        return Err(ConfigError::InvalidCapacity { field, value });
    }
    Ok(())
}

fn check_interval(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::ZeroInterval { field });
    }
    Ok(())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
        Err(_) => Ok(None),
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
