//! Parallel render coordination.
//!
//! Small trees are rendered on the calling thread. Larger trees are
//! partitioned, dispatched to the worker pool in dependency waves and merged
//! back into one tree.

use crate::config::CoordinatorConfig;
use crate::error::{ConfigError, MergeError, Result, SupervisorError};
use crate::merge::merge_outputs;
use crate::partition::{
    DependencyGraph, Partition, PartitionId, PartitionOutput, PartitionPayload, TreePartitioner, analyze,
};
use crate::registry::TaskOutcome;
use crate::supervisor::WorkerSupervisor;
use crate::task::{TaskPriority, TaskType, WorkerTask, now_ms};
use crate::tree::Node;
use crate::worker::{NodeRenderer, render_tree};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Timing and shape of one render
#[derive(Debug, Clone, PartialEq)]
pub struct RenderStats {
    pub total: Duration,
    pub partition: Duration,
    pub parallel: Duration,
    pub merge: Duration,
    pub partition_count: usize,
    pub node_count: usize,
    /// Workers available to the render; 0 for a sequential render
    pub worker_count: usize,
    /// `parallel × workers / total`
    pub speedup: f64,
    /// `speedup / workers`
    pub efficiency: f64,
}

/// Rendered tree plus statistics
#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub tree: Node,
    pub stats: RenderStats,
    /// Set when the render went through the worker pool
    pub request_id: Option<Uuid>,
}

/// Renders trees, in parallel when they are large enough
pub struct ParallelExecutionCoordinator {
    supervisor: Arc<WorkerSupervisor>,
    config: CoordinatorConfig,
    renderer: Arc<dyn NodeRenderer>,
}

impl ParallelExecutionCoordinator {
    /// Creates a coordinator, rejecting an invalid `config`.
    pub fn new(
        supervisor: Arc<WorkerSupervisor>,
        config: CoordinatorConfig,
        renderer: Arc<dyn NodeRenderer>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            supervisor,
            config,
            renderer,
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Arc<WorkerSupervisor> {
        &self.supervisor
    }

    /// Renders `tree`.
    ///
    /// Fails with `Timeout` when partitions are still outstanding after
    /// `worker_timeout` (they are cancelled) and with `TaskFailed` when any
    /// partition fails.
    pub fn render(&self, tree: &Node, priority: TaskPriority) -> Result<RenderOutput> {
        let started = Instant::now();
        let node_count = tree.node_count();
        if node_count < self.config.parallel_threshold {
            let rendered = render_tree(self.renderer.as_ref(), tree);
            debug!(node_count, "Rendered sequentially");
            return Ok(RenderOutput {
                tree: rendered,
                stats: RenderStats {
                    total: started.elapsed(),
                    partition: Duration::ZERO,
                    parallel: Duration::ZERO,
                    merge: Duration::ZERO,
                    partition_count: 0,
                    node_count,
                    worker_count: 0,
                    speedup: 1.0,
                    efficiency: 1.0,
                },
                request_id: None,
            });
        }

        if !self.supervisor.is_running() {
            return Err(SupervisorError::PoolNotRunning.into());
        }
        let workers = self.supervisor.available_workers();
        if workers == 0 {
            return Err(SupervisorError::NoAvailableWorkers.into());
        }

        let partition_started = Instant::now();
        let partitions = TreePartitioner::new(self.config.strategy)
            .with_target_partitions(workers)
            .partition(tree)?;
        let graph = DependencyGraph::new(&partitions);
        let mut payloads = HashMap::with_capacity(partitions.len());
        for partition in &partitions {
            let payload = PartitionPayload::extract(tree, &partitions, partition.id)?;
            payloads.insert(partition.id, payload.to_bytes()?);
        }
        let partition = partition_started.elapsed();

        let quality = analyze(&partitions);
        debug!(
            partitions = partitions.len(),
            balance = quality.balance_factor,
            balanced = quality.is_well_balanced,
            "Tree partitioned"
        );

        let request_id = Uuid::new_v4();
        let parallel_started = Instant::now();
        let outputs = self.execute(request_id, &partitions, &graph, payloads, priority)?;
        let parallel = parallel_started.elapsed();

        let merge_started = Instant::now();
        let rendered = merge_outputs(outputs)?;
        let merge = merge_started.elapsed();

        let total = started.elapsed();
        let speedup = if total.is_zero() {
            0.0
        } else {
            parallel.as_secs_f64() * workers as f64 / total.as_secs_f64()
        };
        let stats = RenderStats {
            total,
            partition,
            parallel,
            merge,
            partition_count: partitions.len(),
            node_count,
            worker_count: workers,
            speedup,
            efficiency: speedup / workers as f64,
        };
        info!(
            request = %request_id,
            partitions = stats.partition_count,
            workers,
            total_ms = total.as_secs_f64() * 1000.0,
            "Parallel render finished"
        );
        Ok(RenderOutput {
            tree: rendered,
            stats,
            request_id: Some(request_id),
        })
    }

    /// Dispatches partitions wave by wave and collects their outputs.
    fn execute(
        &self,
        request_id: Uuid,
        partitions: &[Partition],
        graph: &DependencyGraph,
        mut payloads: HashMap<PartitionId, Vec<u8>>,
        priority: TaskPriority,
    ) -> Result<Vec<PartitionOutput>> {
        let deadline = Instant::now() + self.config.worker_timeout;
        let priorities: HashMap<PartitionId, TaskPriority> = partitions.iter().map(|p| (p.id, p.priority)).collect();

        let mut completed: HashSet<PartitionId> = HashSet::with_capacity(partitions.len());
        let mut in_flight: HashMap<Uuid, PartitionId> = HashMap::new();
        let mut outputs = Vec::with_capacity(partitions.len());

        loop {
            for id in graph.ready_partitions(&completed) {
                let Some(data) = payloads.remove(&id) else {
                    continue;
                };
                let task_priority = priorities.get(&id).copied().unwrap_or_default().max(priority);
                let task = WorkerTask::new(TaskType::Render, data)
                    .with_priority(task_priority)
                    .with_metadata("request_id", request_id.to_string())
                    .with_metadata("partition_id", id.0.to_string())
                    .with_deadline(now_ms() + self.config.worker_timeout.as_millis() as u64);
                match self.supervisor.submit(task) {
                    Ok(task_id) => {
                        in_flight.insert(task_id, id);
                    }
                    Err(e) => {
                        self.discard_all(&in_flight);
                        return Err(e.into());
                    }
                }
            }

            if in_flight.is_empty() {
                if completed.len() == partitions.len() {
                    return Ok(outputs);
                }
                // Nothing running and nothing dispatchable
                warn!(request = %request_id, "Partitions left without a dispatchable dependency");
                return Err(SupervisorError::TaskFailed("unresolvable partition dependencies".to_string()).into());
            }

            let mut finished = Vec::new();
            for (&task_id, &partition_id) in &in_flight {
                let outcome = match self.supervisor.try_take_outcome(&task_id) {
                    Ok(Some(outcome)) => outcome,
                    Ok(None) => continue,
                    Err(e) => {
                        self.discard_all(&in_flight);
                        return Err(e.into());
                    }
                };
                match decode_outcome(task_id, partition_id, outcome) {
                    Ok(output) => finished.push((task_id, partition_id, output)),
                    Err(e) => {
                        warn!(request = %request_id, partition = %partition_id, error = %e, "Partition failed");
                        self.discard_all(&in_flight);
                        return Err(e);
                    }
                }
            }
            for (task_id, partition_id, output) in finished {
                in_flight.remove(&task_id);
                completed.insert(partition_id);
                outputs.push(output);
            }
            if in_flight.is_empty() {
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    request = %request_id,
                    outstanding = in_flight.len(),
                    "Render timed out waiting for workers"
                );
                self.discard_all(&in_flight);
                return Err(SupervisorError::Timeout.into());
            }
            self.supervisor
                .wait_for_completion_signal(self.config.poll_interval.min(deadline - now));
        }
    }

    /// Cancels what is still running and drops every outcome the render
    /// will no longer take.
    fn discard_all(&self, in_flight: &HashMap<Uuid, PartitionId>) {
        for task_id in in_flight.keys() {
            if let Err(e) = self.supervisor.discard(task_id) {
                debug!(task = %task_id, error = %e, "Discard failed");
            }
        }
    }
}

fn decode_outcome(task_id: Uuid, partition: PartitionId, outcome: TaskOutcome) -> Result<PartitionOutput> {
    let result = match outcome {
        TaskOutcome::Completed(result) if result.success => result,
        TaskOutcome::Completed(result) => {
            let reason = result.error.unwrap_or_else(|| "partition render failed".to_string());
            return Err(SupervisorError::TaskFailed(reason).into());
        }
        TaskOutcome::Failed(reason) => return Err(SupervisorError::TaskFailed(reason).into()),
        TaskOutcome::Cancelled => return Err(SupervisorError::Cancelled(task_id).into()),
        TaskOutcome::TimedOut => return Err(SupervisorError::Timeout.into()),
    };
    let data = result.data.unwrap_or_default();
    let output = PartitionOutput::from_bytes(&data).map_err(|e| MergeError::Decode {
        partition: partition.0,
        reason: e.to_string(),
    })?;
    if output.partition_id != partition {
        return Err(MergeError::Decode {
            partition: partition.0,
            reason: format!("output belongs to {}", output.partition_id),
        }
        .into());
    }
    Ok(output)
}
