//! Error types for rendershard
//!
//! The hierarchy follows the failure taxonomy of the scheduler:
//! - Capability and configuration errors (`RegionError`, `QueueError`,
//!   `ConfigError`) are rejected at construction time
//! - Task-level failures (`TaskError`) live on registry entries
//! - Dispatch and worker-level failures (`SupervisorError`) surface to callers
//!   and to the registered error handler
//!
//! Queue saturation is deliberately absent: a full or empty queue is reported
//! through `bool`/`Option` return values, never through these types.

use crate::tree::NodePath;
use thiserror::Error;
use uuid::Uuid;

/// Top-level error type for rendershard
#[derive(Error, Debug)]
pub enum Error {
    /// Shared memory region errors
    #[error("Region error: {0}")]
    Region(#[from] RegionError),

    /// Ring queue / deque layout errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Task state machine errors
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    /// Supervisor / dispatch errors
    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    /// Message protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Partitioning errors
    #[error("Partition error: {0}")]
    Partition(#[from] PartitionError),

    /// Result merge errors
    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Shared memory region errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegionError {
    /// Region length must be positive
    #[error("Shared region length must be greater than zero")]
    ZeroLength,

    /// View offset violates the view's alignment
    #[error("Offset {offset} is not {alignment}-byte aligned")]
    Misaligned { offset: usize, alignment: usize },

    /// View does not fit inside the region
    #[error("View [{offset}, {offset}+{length}) exceeds region of {region_length} bytes")]
    OutOfBounds {
        offset: usize,
        length: usize,
        region_length: usize,
    },

    /// The execution environment cannot provide shared memory or atomics
    #[error("Shared memory is unavailable: {0}")]
    Unsupported(&'static str),
}

/// Queue and deque layout errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Capacity must be a power of two (mask-based indexing)
    #[error("Capacity {capacity} is not a power of two")]
    CapacityNotPowerOfTwo { capacity: u32 },

    /// Layout does not fit in the region after the base offset
    #[error("Layout needs {required} bytes at offset {offset}, region has {available}")]
    RegionTooSmall {
        required: usize,
        offset: usize,
        available: usize,
    },

    /// Region view could not be created
    #[error(transparent)]
    Region(#[from] RegionError),
}

/// Task state machine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Illegal status transition (terminal states are final)
    #[error("Task {id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: &'static str,
        to: &'static str,
    },
}

/// Supervisor, dispatch and worker-level errors
#[derive(Error, Debug, Clone)]
pub enum SupervisorError {
    /// Pool has not been started or was shut down
    #[error("Worker pool is not running")]
    PoolNotRunning,

    /// No ready and healthy worker can take the task
    #[error("No available workers")]
    NoAvailableWorkers,

    /// Worker deque has no free slot
    #[error("Queue for worker {worker} is full")]
    QueueFull { worker: usize },

    /// Unknown task id
    #[error("Task {0} not found")]
    TaskNotFound(Uuid),

    /// Task reported failure
    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// Operation exceeded its deadline
    #[error("Operation timed out")]
    Timeout,

    /// Task was cancelled before producing a result
    #[error("Task {0} was cancelled")]
    Cancelled(Uuid),

    /// Worker did not signal ready in time
    #[error("Worker {slot} did not become ready within {timeout_ms} ms")]
    WorkerInitTimeout { slot: usize, timeout_ms: u64 },

    /// Worker heartbeat went stale
    #[error("Worker {slot} unresponsive for {silent_ms} ms")]
    WorkerUnresponsive { slot: usize, silent_ms: u64 },

    /// Worker reported an error or misbehaved
    #[error("Worker {slot} error: {message}")]
    WorkerError { slot: usize, message: String },

    /// Worker context could not be created
    #[error("Failed to spawn worker {slot}: {reason}")]
    Spawn { slot: usize, reason: String },

    /// Message could not be delivered to a worker context
    #[error("Failed to post message to worker {slot}")]
    PostFailed { slot: usize },

    /// Supervisor background thread could not be started
    #[error("Failed to start {name} thread: {reason}")]
    Thread { name: &'static str, reason: String },

    /// Shared memory layout errors
    #[error(transparent)]
    Region(#[from] RegionError),

    /// Queue layout errors
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Message encoding/decoding errors
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl SupervisorError {
    /// Check if this error concerns one worker slot (handled by restart policy)
    pub fn is_worker_level(&self) -> bool {
        matches!(
            self,
            SupervisorError::WorkerInitTimeout { .. }
                | SupervisorError::WorkerUnresponsive { .. }
                | SupervisorError::WorkerError { .. }
        )
    }
}

/// Message protocol errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Message failed to serialize
    #[error("Failed to encode {kind} message: {reason}")]
    Encode { kind: &'static str, reason: String },

    /// Incoming message is malformed
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Message type is not valid in this direction/state
    #[error("Unexpected {0} message")]
    Unexpected(&'static str),
}

/// Partitioning errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    /// Strategy parameters cannot produce a partitioning
    #[error("Invalid {strategy} strategy: {reason}")]
    InvalidStrategy {
        strategy: &'static str,
        reason: &'static str,
    },

    /// Partition id is not part of the partition set
    #[error("Unknown partition {partition}")]
    UnknownPartition { partition: u32 },

    /// Partition payload could not be serialized
    #[error("Cannot serialize partition {partition}: {reason}")]
    Serialize { partition: u32, reason: String },
}

/// Result merge errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    /// No partition output covers the tree root
    #[error("No partition output covers the root")]
    MissingRoot,

    /// A partition root could not be placed
    #[error("Cannot place partition root at '{0}'")]
    InvalidPath(NodePath),

    /// Partition output could not be decoded
    #[error("Cannot decode output of partition {partition}: {reason}")]
    Decode { partition: u32, reason: String },
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid worker count
    #[error("Invalid worker count {count}: must be between 1 and {max}")]
    InvalidWorkerCount { count: usize, max: usize },

    /// Capacity must be a power of two
    #[error("Invalid {field} {value}: must be a non-zero power of two")]
    InvalidCapacity { field: &'static str, value: u32 },

    /// Interval must be non-zero
    #[error("Invalid {field}: must be greater than zero")]
    ZeroInterval { field: &'static str },

    /// Environment override could not be parsed
    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
}

/// Result type alias for rendershard
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for SupervisorError
pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;
