use clap::{Parser, ValueEnum};
use rendershard::{
    CoordinatorConfig, IdentityRenderer, ParallelExecutionCoordinator, PartitionStrategy, RenderExecutor,
    SupervisorConfig, TaskPriority, ThreadWorkerHost, TreePartitioner, WorkerSupervisor, partition, synthetic_tree,
};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Strategy {
    Depth,
    Size,
    Hybrid,
    WorkBalanced,
}

/// Renders a synthetic tree on a pool of work-stealing workers
#[derive(Debug, Parser)]
#[command(name = "rendershard", version)]
struct Args {
    /// Worker threads (defaults to RENDERSHARD_WORKERS or the CPU count)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Depth of the synthetic tree
    #[arg(short, long, default_value_t = 6)]
    depth: u32,

    /// Children per node of the synthetic tree
    #[arg(short, long, default_value_t = 4)]
    branching: u32,

    /// Partitioning strategy
    #[arg(short, long, value_enum, default_value_t = Strategy::Hybrid)]
    strategy: Strategy,

    /// Number of renders to run
    #[arg(short, long, default_value_t = 3)]
    iterations: u32,

    /// Per-render worker timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Pin worker threads to cores
    #[arg(long)]
    pin: bool,
}

impl Strategy {
    fn build(self, total_work: u64, workers: usize) -> PartitionStrategy {
        match self {
            Strategy::Depth => PartitionStrategy::Depth { level: 2 },
            Strategy::Size => PartitionStrategy::Size {
                threshold: (total_work / (workers as u64 * 2).max(1)).max(1),
            },
            Strategy::Hybrid => PartitionStrategy::default(),
            Strategy::WorkBalanced => PartitionStrategy::WorkBalanced {
                target_work: (total_work / workers.max(1) as u64).max(1),
            },
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "rendershard failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> rendershard::Result<()> {
    let mut config = SupervisorConfig::from_env()?;
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }
    let workers = config.worker_count;

    let tree = synthetic_tree(args.depth, args.branching);
    let total_work = tree.estimated_work();
    let strategy = args.strategy.build(total_work, workers);
    println!("rendershard - parallel tree rendering\n");
    println!(
        "Tree: {} nodes, depth {}, estimated work {}",
        tree.node_count(),
        tree.max_depth(),
        total_work
    );

    let preview = TreePartitioner::new(strategy)
        .with_target_partitions(workers)
        .partition(&tree)?;
    let quality = partition::analyze(&preview);
    println!(
        "Strategy {}: {} partitions, balance factor {:.2} ({})\n",
        strategy.name(),
        preview.len(),
        quality.balance_factor,
        if quality.is_well_balanced { "balanced" } else { "unbalanced" }
    );

    let renderer = Arc::new(IdentityRenderer);
    let host = ThreadWorkerHost::with_config(
        Arc::new(RenderExecutor::new(renderer.clone())),
        rendershard::HostConfig::default().with_pin_to_core(args.pin),
    );
    let supervisor = Arc::new(WorkerSupervisor::new(config, Arc::new(host))?);
    supervisor.start()?;

    let coordinator = ParallelExecutionCoordinator::new(
        Arc::clone(&supervisor),
        CoordinatorConfig::default()
            .with_strategy(strategy)
            .with_worker_timeout(Duration::from_millis(args.timeout_ms)),
        renderer,
    )?;

    for iteration in 1..=args.iterations {
        let output = coordinator.render(&tree, TaskPriority::Normal)?;
        let stats = &output.stats;
        println!(
            "Render {iteration}: total {:?} (partition {:?}, parallel {:?}, merge {:?}), speedup {:.2}, efficiency {:.2}",
            stats.total, stats.partition, stats.parallel, stats.merge, stats.speedup, stats.efficiency
        );
    }

    let stats = supervisor.stats();
    println!("\nPool: {} workers ({} healthy)", stats.worker_count, stats.healthy_workers);
    println!(
        "  tasks: {} submitted, {} completed, {} failed",
        stats.tasks_submitted, stats.tasks_completed, stats.tasks_failed
    );
    println!(
        "  steals: {}/{} ({:.1}%), average task {:.3} ms",
        stats.steal_successes,
        stats.steal_attempts,
        stats.steal_success_rate * 100.0,
        stats.average_task_ms
    );

    supervisor.shutdown()?;
    Ok(())
}
