//! # rendershard - parallel tree rendering over work-stealing workers
//!
//! A render tree is split into partitions, each partition is rendered by an
//! isolated worker context, and the rendered pieces are merged back into one
//! tree. Workers share nothing but a single shared memory region and a
//! message channel with the supervisor.
//!
//! ## Architecture
//!
//! - **SharedRegion / AtomicWordOps**: a shareable byte region with typed
//!   views, sequentially consistent word atomics and futex-style wait/notify
//! - **BoundedRingQueue**: lock-free MPMC ring of `u32` values in shared memory
//! - **WorkStealingDeque**: Chase-Lev deque of task handles in shared memory
//! - **TreePartitioner**: depth, size, hybrid and work-balanced strategies,
//!   quality analysis and a partition dependency graph
//! - **WorkerSupervisor**: worker lifecycle, dispatch, health checks,
//!   restarts and periodic rebalancing
//! - **ParallelExecutionCoordinator**: partition, dispatch, collect, merge
//!
//! ## Example
//!
//! ```no_run
//! use rendershard::{
//!     CoordinatorConfig, IdentityRenderer, ParallelExecutionCoordinator, RenderExecutor,
//!     SupervisorConfig, TaskPriority, ThreadWorkerHost, WorkerSupervisor, synthetic_tree,
//! };
//! use std::sync::Arc;
//!
//! let renderer = Arc::new(IdentityRenderer);
//! let host = ThreadWorkerHost::new(Arc::new(RenderExecutor::new(renderer.clone())));
//! let supervisor = Arc::new(WorkerSupervisor::new(SupervisorConfig::default(), Arc::new(host)).unwrap());
//! supervisor.start().unwrap();
//!
//! let coordinator = ParallelExecutionCoordinator::new(supervisor.clone(), CoordinatorConfig::default(), renderer).unwrap();
//! let output = coordinator.render(&synthetic_tree(5, 4), TaskPriority::Normal).unwrap();
//! println!("{} partitions in {:?}", output.stats.partition_count, output.stats.total);
//! supervisor.shutdown().unwrap();
//! ```

pub mod atomics;
pub mod config;
pub mod coordinator;
pub mod deque;
pub mod error;
pub mod merge;
pub mod partition;
pub mod protocol;
pub mod region;
pub mod registry;
pub mod ring_queue;
pub mod stats;
pub mod supervisor;
pub mod task;
pub mod tree;
pub mod worker;

pub use atomics::{AtomicBackend, AtomicWordOps, WAKE_ALL, WaitResult};
pub use config::{CoordinatorConfig, HostConfig, PartitionStrategy, SupervisorConfig};
pub use coordinator::{ParallelExecutionCoordinator, RenderOutput, RenderStats};
pub use deque::WorkStealingDeque;
pub use error::{Error, Result};
pub use partition::{DependencyGraph, Partition, PartitionId, PartitionQuality, TreePartitioner};
pub use region::{SharedRegion, TransferableRegion};
pub use registry::TaskOutcome;
pub use ring_queue::BoundedRingQueue;
pub use stats::PoolStats;
pub use supervisor::{SlotState, WorkerInfo, WorkerSupervisor};
pub use task::{TaskPriority, TaskResult, TaskStatus, TaskType, WorkerTask};
pub use tree::{Node, NodeKind, NodePath, synthetic_tree};
pub use worker::{IdentityRenderer, NodeRenderer, RenderExecutor, TaskExecutor, ThreadWorkerHost, WorkerHost};
