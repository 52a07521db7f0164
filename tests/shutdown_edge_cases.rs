use rendershard::error::SupervisorError;
use rendershard::registry::TaskOutcome;
use rendershard::{SupervisorConfig, TaskExecutor, TaskType, ThreadWorkerHost, WorkerSupervisor, WorkerTask};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn sleeping_pool(workers: usize, task_time: Duration, shutdown_timeout: Duration) -> WorkerSupervisor {
    let executor: Arc<dyn TaskExecutor> = Arc::new(move |_: &WorkerTask| -> Result<Vec<u8>, String> {
        thread::sleep(task_time);
        Ok(Vec::new())
    });
    let config = SupervisorConfig::default()
        .with_workers(workers)
        .with_deque_capacity(16)
        .with_shutdown_timeout(shutdown_timeout);
    let supervisor = WorkerSupervisor::new(config, Arc::new(ThreadWorkerHost::new(executor))).unwrap();
    supervisor.start().unwrap();
    supervisor
}

#[test]
fn test_shutdown_during_task_execution() {
    let pool = sleeping_pool(2, Duration::from_millis(10), Duration::from_secs(5));

    for _ in 0..10 {
        pool.submit(WorkerTask::new(TaskType::Compute, Vec::new())).unwrap();
    }

    // Shutdown without waiting; queued tasks still run to completion
    let result = pool.shutdown();
    assert!(result.is_ok(), "Shutdown should succeed after tasks complete");
    assert_eq!(pool.pending_tasks(), 0);
    assert_eq!(pool.stats().tasks_completed, 10);
    assert!(!pool.is_running());
}

#[test]
fn test_shutdown_twice() {
    let pool = sleeping_pool(1, Duration::from_millis(1), Duration::from_secs(1));
    assert!(pool.shutdown().is_ok());
    assert!(pool.shutdown().is_ok());
}

#[test]
fn test_submit_after_shutdown() {
    let pool = sleeping_pool(1, Duration::from_millis(1), Duration::from_secs(1));
    pool.shutdown().unwrap();
    assert!(matches!(
        pool.submit(WorkerTask::new(TaskType::Compute, Vec::new())),
        Err(SupervisorError::PoolNotRunning)
    ));
    assert_eq!(pool.available_workers(), 0);
}

#[test]
fn test_shutdown_timeout_fails_leftovers() {
    let pool = sleeping_pool(1, Duration::from_secs(2), Duration::from_millis(100));
    let id = pool.submit(WorkerTask::new(TaskType::Compute, Vec::new())).unwrap();

    let started = Instant::now();
    assert!(matches!(pool.shutdown(), Err(SupervisorError::Timeout)));
    // A wedged worker is abandoned, not joined
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(pool.pending_tasks(), 0);
    match pool.try_take_outcome(&id) {
        Ok(Some(TaskOutcome::Failed(reason))) => assert_eq!(reason, "supervisor shut down"),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn test_restart_after_shutdown() {
    let pool = sleeping_pool(2, Duration::from_millis(1), Duration::from_secs(1));
    let first = pool.worker_info()[0].generation;
    pool.shutdown().unwrap();

    pool.start().unwrap();
    assert!(pool.is_running());
    assert_ne!(pool.worker_info()[0].generation, first);

    let id = pool.submit(WorkerTask::new(TaskType::Compute, Vec::new())).unwrap();
    assert!(pool.wait_for(&id, Duration::from_secs(5)).is_ok());
    pool.shutdown().unwrap();
}
