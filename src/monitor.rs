//! Execution monitor
//!
//! Runs queued test cases in batches of `parallel_limit`, retries failed
//! attempts with linear backoff and keeps per-queue progress and logs in a
//! `QueueStore`. Cancellation is cooperative: it is observed between batches,
//! so a batch that already started always runs to completion.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde_json::json;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::error::MonitorError;
use crate::executor::{TaskError, TaskExecutor};
use crate::queue::{ExecutionLog, ExecutionOptions, ExecutionQueue, LogLevel, QueueStatus};
use crate::store::QueueStore;

/// Default number of log entries returned by `logs`
pub const DEFAULT_LOG_LIMIT: usize = 50;

/// Shared pieces a spawned execution needs
#[derive(Clone)]
struct Runner {
    store: Arc<dyn QueueStore>,
    executor: Arc<dyn TaskExecutor>,
}

impl Runner {
    fn update(&self, queue_id: &str, apply: &mut dyn FnMut(&mut ExecutionQueue)) -> Result<(), MonitorError> {
        if self.store.update(queue_id, apply)? {
            Ok(())
        } else {
            Err(MonitorError::QueueNotFound(queue_id.to_string()))
        }
    }

    fn log(&self, queue_id: &str, entry: ExecutionLog) -> Result<(), MonitorError> {
        match entry.level {
            LogLevel::Error => tracing::warn!("[{}] {}", queue_id, entry.message),
            _ => tracing::debug!("[{}] {}", queue_id, entry.message),
        }
        let mut entry = Some(entry);
        self.update(queue_id, &mut |q| {
            if let Some(entry) = entry.take() {
                q.push_log(entry);
            }
        })
    }

    /// Move a queue to `failed` unless it already finished.
    fn fail_queue(&self, queue_id: &str, message: &str) {
        let result = self.store.update(queue_id, &mut |q| {
            if q.fail() {
                q.push_log(ExecutionLog::new(LogLevel::Error, message));
            }
        });
        if let Err(e) = result {
            tracing::warn!("Failed to mark queue {} as failed: {}", queue_id, e);
        }
    }

    async fn run_queue(&self, queue_id: &str) -> Result<(), MonitorError> {
        let started = Instant::now();

        let mut became_running = false;
        self.update(queue_id, &mut |q| became_running = q.mark_running())?;
        if !became_running {
            tracing::info!("Queue {} was cancelled before it started", queue_id);
            return Ok(());
        }

        let queue = self
            .store
            .get(queue_id)?
            .ok_or_else(|| MonitorError::QueueNotFound(queue_id.to_string()))?;
        let options = queue.options;
        let batch_count = options.batch_count(queue.test_case_ids.len());

        self.log(
            queue_id,
            ExecutionLog::new(
                LogLevel::Info,
                format!(
                    "Started execution of {} test cases in {} batches (parallel limit {})",
                    queue.test_case_ids.len(),
                    batch_count,
                    options.parallel_limit
                ),
            ),
        )?;

        for (index, batch) in queue.test_case_ids.chunks(options.parallel_limit).enumerate() {
            let status = self.store.get(queue_id)?.map(|q| q.status);
            if status != Some(QueueStatus::Running) {
                tracing::info!("Queue {} stopped before batch {}/{}", queue_id, index + 1, batch_count);
                break;
            }

            self.log(
                queue_id,
                ExecutionLog::new(
                    LogLevel::Info,
                    format!("Processing batch {}/{} ({} test cases)", index + 1, batch_count, batch.len()),
                )
                .with_metadata(json!({ "batch": index + 1, "size": batch.len() })),
            )?;

            let outcomes = join_all(
                batch
                    .iter()
                    .map(|test_case_id| self.run_test_case(queue_id, test_case_id, &options)),
            )
            .await;
            for outcome in outcomes {
                outcome?;
            }

            let elapsed_ms = started.elapsed().as_millis() as u64;
            self.update(queue_id, &mut |q| q.update_estimate(elapsed_ms))?;
        }

        let mut finished = false;
        let mut summary = String::new();
        self.update(queue_id, &mut |q| {
            finished = q.complete();
            summary = format!(
                "Execution completed: {} succeeded, {} failed",
                q.progress.completed, q.progress.failed
            );
        })?;

        if finished {
            tracing::info!("Queue {} {}", queue_id, summary.to_lowercase());
            self.log(queue_id, ExecutionLog::new(LogLevel::Success, summary))?;
        }
        Ok(())
    }

    async fn attempt(&self, queue_id: &str, test_case_id: &str) -> Result<Result<String, TaskError>, MonitorError> {
        if let Err(e) = self.executor.send_email(test_case_id).await {
            return Ok(Err(e));
        }
        self.log(
            queue_id,
            ExecutionLog::new(LogLevel::Success, "Test email sent").for_test_case(test_case_id),
        )?;
        Ok(self.executor.process(test_case_id).await)
    }

    async fn run_test_case(
        &self,
        queue_id: &str,
        test_case_id: &str,
        options: &ExecutionOptions,
    ) -> Result<(), MonitorError> {
        self.update(queue_id, &mut |q| {
            q.begin_test_case(test_case_id);
            q.push_log(ExecutionLog::new(LogLevel::Info, "Starting test case").for_test_case(test_case_id));
        })?;

        let attempts = options.retry_attempts.max(1);
        for attempt in 1..=attempts {
            match self.attempt(queue_id, test_case_id).await? {
                Ok(result_id) => {
                    let entry = ExecutionLog::new(LogLevel::Success, "Test case completed")
                        .for_test_case(test_case_id)
                        .with_metadata(json!({ "resultId": result_id, "attempt": attempt }));
                    let mut entry = Some(entry);
                    let mut result_id = Some(result_id);
                    self.update(queue_id, &mut |q| {
                        if let Some(result_id) = result_id.take() {
                            q.record_success(test_case_id, result_id);
                        }
                        if let Some(entry) = entry.take() {
                            q.push_log(entry);
                        }
                    })?;
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    let backoff = options.backoff_after(attempt);
                    self.log(
                        queue_id,
                        ExecutionLog::new(
                            LogLevel::Warning,
                            format!(
                                "Attempt {}/{} failed: {}; retrying in {} ms",
                                attempt,
                                attempts,
                                e,
                                backoff.as_millis()
                            ),
                        )
                        .for_test_case(test_case_id),
                    )?;
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    let message = format!("Test case failed after {} attempts: {}", attempts, e);
                    self.update(queue_id, &mut |q| {
                        q.record_failure(test_case_id);
                        q.push_log(ExecutionLog::new(LogLevel::Error, message.clone()).for_test_case(test_case_id));
                    })?;
                }
            }
        }
        Ok(())
    }
}

/// Owns queue execution: start, cancel, status, logs and cleanup.
pub struct ExecutionMonitor {
    runner: Runner,
    config: MonitorConfig,
    active: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ExecutionMonitor {
    pub fn new(store: Arc<dyn QueueStore>, executor: Arc<dyn TaskExecutor>, config: MonitorConfig) -> Self {
        Self {
            runner: Runner { store, executor },
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Create a queue and begin executing it immediately. Returns the queue ID.
    pub fn start(
        &self,
        client_id: &str,
        test_case_ids: Vec<String>,
        options: Option<ExecutionOptions>,
    ) -> Result<String, MonitorError> {
        if client_id.trim().is_empty() {
            return Err(MonitorError::InvalidInput("clientId is required".to_string()));
        }
        if test_case_ids.is_empty() {
            return Err(MonitorError::InvalidInput("testCaseIds must not be empty".to_string()));
        }

        let options = options.unwrap_or_else(|| self.config.default_options()).sanitized();
        let queue_id = format!("queue_{}", Uuid::new_v4().simple());
        let mut queue = ExecutionQueue::new(queue_id.clone(), client_id.to_string(), test_case_ids, options)
            .with_log_capacity(self.config.log_capacity);
        queue.push_log(ExecutionLog::new(
            LogLevel::Info,
            format!("Queued {} test cases", queue.progress.total),
        ));
        self.runner.store.insert(queue)?;

        tracing::info!("Starting queue {} for client {}", queue_id, client_id);

        let runner = self.runner.clone();
        let id = queue_id.clone();
        let handle = tokio::spawn(async move {
            let reason = match AssertUnwindSafe(runner.run_queue(&id)).catch_unwind().await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };
            tracing::error!("Queue {} aborted: {}", id, reason);
            runner.fail_queue(&id, &format!("Execution failed: {}", reason));
        });

        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.retain(|_, h| !h.is_finished());
        active.insert(queue_id.clone(), handle);

        Ok(queue_id)
    }

    /// Cancel a queued or running queue. Returns false if it had already finished.
    pub fn cancel(&self, queue_id: &str) -> Result<bool, MonitorError> {
        let mut cancelled = false;
        let found = self.runner.store.update(queue_id, &mut |q| {
            cancelled = q.cancel();
            if cancelled {
                q.push_log(ExecutionLog::new(LogLevel::Warning, "Execution cancelled"));
            }
        })?;
        if !found {
            return Err(MonitorError::QueueNotFound(queue_id.to_string()));
        }
        if cancelled {
            tracing::info!("Queue {} cancelled", queue_id);
        }
        Ok(cancelled)
    }

    pub fn status(&self, queue_id: &str) -> Result<ExecutionQueue, MonitorError> {
        self.runner
            .store
            .get(queue_id)?
            .ok_or_else(|| MonitorError::QueueNotFound(queue_id.to_string()))
    }

    /// Tail of a queue's log. Returns the selected entries and the number retained.
    pub fn logs(
        &self,
        queue_id: &str,
        limit: Option<usize>,
        since: Option<DateTime<Utc>>,
    ) -> Result<(Vec<ExecutionLog>, usize), MonitorError> {
        let queue = self.status(queue_id)?;
        let entries = queue.tail_logs(limit.unwrap_or(DEFAULT_LOG_LIMIT), since);
        Ok((entries, queue.logs.len()))
    }

    pub fn list(&self, client_id: Option<&str>) -> Result<Vec<ExecutionQueue>, MonitorError> {
        let queues = self.runner.store.list()?;
        Ok(match client_id {
            Some(client_id) => queues.into_iter().filter(|q| q.client_id == client_id).collect(),
            None => queues,
        })
    }

    /// Wait for a queue's execution task to finish.
    pub async fn wait(&self, queue_id: &str) {
        let handle = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(queue_id);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Execution task for {} panicked: {}", queue_id, e);
            }
        }
    }

    /// Number of execution tasks still running
    pub fn active_count(&self) -> usize {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.retain(|_, h| !h.is_finished());
        active.len()
    }

    /// Evict finished queues older than the retention window.
    pub fn cleanup_expired(&self) -> Result<usize, MonitorError> {
        let cutoff = Utc::now() - self.config.retention();
        let evicted = self.runner.store.evict_expired(cutoff)?;
        if evicted > 0 {
            tracing::info!("Evicted {} expired queues", evicted);
        }
        self.active_count();
        Ok(evicted)
    }

    /// Run `cleanup_expired` every `cleanup_interval_secs`.
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.config.cleanup_interval());
            // First tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = monitor.cleanup_expired() {
                    tracing::warn!("Queue cleanup failed: {}", e);
                }
            }
        })
    }

    /// Abort every running execution task and fail the queues it leaves behind.
    pub fn shutdown(&self) {
        let handles: Vec<(String, JoinHandle<()>)> = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (queue_id, handle) in handles {
            tracing::debug!("Aborting execution of {}", queue_id);
            handle.abort();
            self.runner.fail_queue(&queue_id, "Execution aborted: monitor shut down");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("execution task panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("execution task panicked: {}", message)
    } else {
        "execution task panicked".to_string()
    }
}
