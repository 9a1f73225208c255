use std::sync::Arc;
use std::time::Duration;

use mailcheck_core::config::{MonitorConfig, SimulatorConfig};
use mailcheck_core::executor::SimulatedExecutor;
use mailcheck_core::queue::{ExecutionOptions, LogLevel, QueueStatus};
use mailcheck_core::store::{MemoryQueueStore, SqliteQueueStore};
use mailcheck_core::ExecutionMonitor;

fn simulator(success_rate: f64) -> SimulatedExecutor {
    SimulatedExecutor::new(SimulatorConfig {
        success_rate,
        ..SimulatorConfig::default()
    })
}

fn monitor_with(success_rate: f64) -> ExecutionMonitor {
    ExecutionMonitor::new(
        Arc::new(MemoryQueueStore::new()),
        Arc::new(simulator(success_rate)),
        MonitorConfig::default(),
    )
}

fn ids(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("tc-{}", i)).collect()
}

fn options(parallel_limit: usize, retry_attempts: u32) -> Option<ExecutionOptions> {
    Some(ExecutionOptions {
        parallel_limit,
        retry_attempts,
        ..ExecutionOptions::default()
    })
}

#[tokio::test(start_paused = true)]
async fn always_failing_gate_marks_every_case_failed() {
    let monitor = monitor_with(0.0);
    let queue_id = monitor.start("client-1", ids(5), options(2, 1)).unwrap();
    monitor.wait(&queue_id).await;

    let queue = monitor.status(&queue_id).unwrap();
    assert_eq!(queue.status, QueueStatus::Completed);
    assert_eq!(queue.progress.failed, 5);
    assert_eq!(queue.progress.completed, 0);
    assert!(queue.results.is_empty());
}

#[tokio::test(start_paused = true)]
async fn batches_follow_parallel_limit() {
    let monitor = monitor_with(1.0);
    let queue_id = monitor.start("client-1", ids(7), options(3, 1)).unwrap();
    monitor.wait(&queue_id).await;

    let (logs, _) = monitor.logs(&queue_id, Some(100), None).unwrap();
    let batches = logs
        .iter()
        .filter(|l| l.message.starts_with("Processing batch"))
        .count();
    assert_eq!(batches, 3);

    let queue = monitor.status(&queue_id).unwrap();
    assert_eq!(queue.progress.completed + queue.progress.failed, 7);
    assert_eq!(queue.results.len(), 7);
}

#[tokio::test(start_paused = true)]
async fn retries_back_off_linearly() {
    let monitor = ExecutionMonitor::new(
        Arc::new(MemoryQueueStore::new()),
        Arc::new(SimulatedExecutor::new(SimulatorConfig {
            email_delay_ms: (0, 0),
            ai_delay_ms: (0, 0),
            success_rate: 0.0,
        })),
        MonitorConfig::default(),
    );

    let started = tokio::time::Instant::now();
    let queue_id = monitor.start("client-1", ids(1), options(1, 3)).unwrap();
    monitor.wait(&queue_id).await;

    // 1000 ms after the first attempt, 2000 ms after the second
    assert!(started.elapsed() >= Duration::from_millis(3000));

    let queue = monitor.status(&queue_id).unwrap();
    assert_eq!(queue.progress.failed, 1);
    let warnings = queue.logs.iter().filter(|l| l.level == LogLevel::Warning).count();
    assert_eq!(warnings, 2);
    let errors = queue.logs.iter().filter(|l| l.level == LogLevel::Error).count();
    assert_eq!(errors, 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_before_start_is_idempotent() {
    let monitor = monitor_with(1.0);
    let queue_id = monitor.start("client-1", ids(3), None).unwrap();

    assert!(monitor.cancel(&queue_id).unwrap());
    assert!(!monitor.cancel(&queue_id).unwrap());
    monitor.wait(&queue_id).await;

    let queue = monitor.status(&queue_id).unwrap();
    assert_eq!(queue.status, QueueStatus::Cancelled);
    assert_eq!(queue.progress.completed + queue.progress.failed, 0);
    assert!(queue.completed_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn cancel_lets_the_running_batch_finish() {
    let monitor = monitor_with(1.0);
    let queue_id = monitor.start("client-1", ids(6), options(2, 1)).unwrap();

    // Inside the first batch: email delays are at least 1000 ms
    tokio::time::sleep(Duration::from_millis(500)).await;
    let running = monitor.status(&queue_id).unwrap();
    assert_eq!(running.status, QueueStatus::Running);
    assert_eq!(running.progress.in_flight.len(), 2);

    assert!(monitor.cancel(&queue_id).unwrap());
    monitor.wait(&queue_id).await;

    let queue = monitor.status(&queue_id).unwrap();
    assert_eq!(queue.status, QueueStatus::Cancelled);
    assert_eq!(queue.progress.completed, 2);
    assert!(queue.progress.in_flight.is_empty());
    assert!(!monitor.cancel(&queue_id).unwrap());
}

#[tokio::test(start_paused = true)]
async fn log_buffer_is_bounded() {
    let monitor = monitor_with(1.0);
    let queue_id = monitor.start("client-1", ids(40), options(10, 1)).unwrap();
    monitor.wait(&queue_id).await;

    let queue = monitor.status(&queue_id).unwrap();
    assert_eq!(queue.logs.len(), 100);
    assert_eq!(
        queue.logs.back().map(|l| l.message.as_str()),
        Some("Execution completed: 40 succeeded, 0 failed")
    );

    let (tail, total) = monitor.logs(&queue_id, Some(5), None).unwrap();
    assert_eq!(tail.len(), 5);
    assert_eq!(total, 100);
}

#[tokio::test(start_paused = true)]
async fn sqlite_store_tracks_execution() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteQueueStore::open(&dir.path().join("queues.db")).unwrap();
    let monitor = ExecutionMonitor::new(Arc::new(store), Arc::new(simulator(1.0)), MonitorConfig::default());

    let queue_id = monitor.start("client-9", ids(3), options(3, 1)).unwrap();
    monitor.wait(&queue_id).await;

    let queue = monitor.status(&queue_id).unwrap();
    assert_eq!(queue.status, QueueStatus::Completed);
    assert_eq!(queue.progress.completed, 3);
    assert_eq!(monitor.list(Some("client-9")).unwrap().len(), 1);
    assert!(monitor.list(Some("other")).unwrap().is_empty());
}
