use rendershard::error::SupervisorError;
use rendershard::{SupervisorConfig, TaskExecutor, TaskType, ThreadWorkerHost, WorkerSupervisor, WorkerTask};
use std::sync::Arc;
use std::time::Duration;

/// Panics on a zero byte, echoes everything else
fn fragile_pool(workers: usize) -> WorkerSupervisor {
    let executor: Arc<dyn TaskExecutor> = Arc::new(|task: &WorkerTask| -> Result<Vec<u8>, String> {
        if task.payload.data.first() == Some(&0) {
            panic!("Intentional panic for testing");
        }
        Ok(task.payload.data.clone())
    });
    let config = SupervisorConfig::default()
        .with_workers(workers)
        .with_deque_capacity(16)
        .with_shutdown_timeout(Duration::from_secs(2));
    let supervisor = WorkerSupervisor::new(config, Arc::new(ThreadWorkerHost::new(executor))).unwrap();
    supervisor.start().unwrap();
    supervisor
}

#[test]
fn test_panic_becomes_failed_result() {
    let pool = fragile_pool(1);
    let id = pool.submit(WorkerTask::new(TaskType::Compute, vec![0])).unwrap();

    match pool.wait_for(&id, Duration::from_secs(5)) {
        Err(SupervisorError::TaskFailed(reason)) => {
            assert!(reason.contains("executor panicked"), "{reason}");
            assert!(reason.contains("Intentional panic"), "{reason}");
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(pool.stats().tasks_failed, 1);
    pool.shutdown().unwrap();
}

#[test]
fn test_worker_recovery_after_panic() {
    let pool = fragile_pool(1);

    // 1. Panicking task
    let boom = pool.submit(WorkerTask::new(TaskType::Compute, vec![0])).unwrap();
    assert!(pool.wait_for(&boom, Duration::from_secs(5)).is_err());

    // 2. The same worker still serves work, without a restart
    let generation = pool.worker_info()[0].generation;
    let id = pool.submit(WorkerTask::new(TaskType::Compute, vec![7, 8])).unwrap();
    let result = pool.wait_for(&id, Duration::from_secs(5)).expect("Worker did not process subsequent task");
    assert_eq!(result.data, Some(vec![7, 8]));

    let info = &pool.worker_info()[0];
    assert_eq!(info.generation, generation);
    assert!(info.healthy);
    assert_eq!(pool.stats().worker_restarts, 0);
    pool.shutdown().unwrap();
}

#[test]
fn test_panics_interleaved_with_work() {
    let pool = fragile_pool(2);
    let ids: Vec<_> = (0..20u8)
        .map(|i| pool.submit(WorkerTask::new(TaskType::Compute, vec![i % 4])).unwrap())
        .collect();

    let mut failed = 0;
    for id in &ids {
        if pool.wait_for(id, Duration::from_secs(5)).is_err() {
            failed += 1;
        }
    }
    assert_eq!(failed, 5);
    let stats = pool.stats();
    assert_eq!(stats.tasks_completed, 15);
    assert_eq!(stats.tasks_failed, 5);
    pool.shutdown().unwrap();
}
