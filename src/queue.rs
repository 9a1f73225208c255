//! Execution queue model
//!
//! One `ExecutionQueue` tracks a single batch-execution request: its state
//! machine, progress counters and a bounded log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Maximum number of log entries retained per queue
pub const DEFAULT_LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl QueueStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Failed | QueueStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Running => "running",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLog {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ExecutionLog {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            test_case_id: None,
            metadata: None,
        }
    }

    pub fn for_test_case(mut self, test_case_id: &str) -> Self {
        self.test_case_id = Some(test_case_id.to_string());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Progress counters. `in_flight` lists the test cases currently executing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_flight: Vec<String>,
}

impl Progress {
    pub fn processed(&self) -> usize {
        self.completed + self.failed
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.processed())
    }
}

/// Upper bound on the base retry backoff
pub const MAX_RETRY_BACKOFF_MS: u64 = 5 * 60 * 1000;

fn default_parallel_limit() -> usize {
    3
}

fn default_retry_attempts() -> u32 {
    1
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

/// Per-queue execution options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOptions {
    #[serde(default = "default_parallel_limit")]
    pub parallel_limit: usize,
    /// Total attempts per test case, first attempt included
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            parallel_limit: default_parallel_limit(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl ExecutionOptions {
    /// Clamp limits to at least one and the backoff to `MAX_RETRY_BACKOFF_MS`.
    pub fn sanitized(self) -> Self {
        Self {
            parallel_limit: self.parallel_limit.max(1),
            retry_attempts: self.retry_attempts.max(1),
            retry_backoff_ms: self.retry_backoff_ms.min(MAX_RETRY_BACKOFF_MS),
        }
    }

    /// Delay before the attempt following `attempt`
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(u64::from(attempt)))
    }

    pub fn batch_count(&self, test_cases: usize) -> usize {
        test_cases.div_ceil(self.parallel_limit.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionQueue {
    pub queue_id: String,
    pub client_id: String,
    pub test_case_ids: Vec<String>,
    pub status: QueueStatus,
    pub progress: Progress,
    pub options: ExecutionOptions,
    pub created_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_time_remaining_ms: u64,
    pub logs: VecDeque<ExecutionLog>,
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    pub results: Vec<String>,
}

fn default_log_capacity() -> usize {
    DEFAULT_LOG_CAPACITY
}

impl ExecutionQueue {
    pub fn new(queue_id: String, client_id: String, test_case_ids: Vec<String>, options: ExecutionOptions) -> Self {
        let now = Utc::now();
        Self {
            queue_id,
            client_id,
            progress: Progress {
                total: test_case_ids.len(),
                ..Progress::default()
            },
            test_case_ids,
            status: QueueStatus::Queued,
            options: options.sanitized(),
            created_at: now,
            started_at: now,
            completed_at: None,
            estimated_time_remaining_ms: 0,
            logs: VecDeque::new(),
            log_capacity: DEFAULT_LOG_CAPACITY,
            results: Vec::new(),
        }
    }

    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity.max(1);
        self
    }

    /// Append a log entry, dropping the oldest once the capacity is reached.
    pub fn push_log(&mut self, entry: ExecutionLog) {
        self.logs.push_back(entry);
        while self.logs.len() > self.log_capacity {
            self.logs.pop_front();
        }
    }

    /// Most recent `limit` entries newer than `since`, oldest first.
    pub fn tail_logs(&self, limit: usize, since: Option<DateTime<Utc>>) -> Vec<ExecutionLog> {
        let filtered: Vec<&ExecutionLog> = self
            .logs
            .iter()
            .filter(|log| since.map_or(true, |s| log.timestamp > s))
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).cloned().collect()
    }

    pub fn mark_running(&mut self) -> bool {
        if self.status != QueueStatus::Queued {
            return false;
        }
        self.status = QueueStatus::Running;
        self.started_at = Utc::now();
        true
    }

    /// Move to `cancelled`. Returns false when the queue already finished.
    pub fn cancel(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = QueueStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        self.progress.in_flight.clear();
        self.estimated_time_remaining_ms = 0;
        true
    }

    /// Finish a run that exhausted all batches. Only applies while running.
    pub fn complete(&mut self) -> bool {
        if self.status != QueueStatus::Running {
            return false;
        }
        self.status = QueueStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.progress.in_flight.clear();
        self.estimated_time_remaining_ms = 0;
        true
    }

    pub fn fail(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = QueueStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.progress.in_flight.clear();
        self.estimated_time_remaining_ms = 0;
        true
    }

    pub fn begin_test_case(&mut self, test_case_id: &str) {
        if self.status == QueueStatus::Running && !self.progress.in_flight.iter().any(|id| id == test_case_id) {
            self.progress.in_flight.push(test_case_id.to_string());
        }
    }

    fn end_test_case(&mut self, test_case_id: &str) {
        self.progress.in_flight.retain(|id| id != test_case_id);
    }

    pub fn record_success(&mut self, test_case_id: &str, result_id: String) {
        self.end_test_case(test_case_id);
        if self.progress.processed() < self.progress.total {
            self.progress.completed += 1;
            self.results.push(result_id);
        }
    }

    pub fn record_failure(&mut self, test_case_id: &str) {
        self.end_test_case(test_case_id);
        if self.progress.processed() < self.progress.total {
            self.progress.failed += 1;
        }
    }

    /// Re-estimate the remaining time from the average per processed test case.
    pub fn update_estimate(&mut self, elapsed_ms: u64) {
        let processed = self.progress.processed();
        if processed == 0 {
            return;
        }
        let per_case = elapsed_ms as f64 / processed as f64;
        self.estimated_time_remaining_ms = (self.progress.remaining() as f64 * per_case).round() as u64;
    }

    /// Time used for retention: completion if finished, start otherwise
    pub fn retention_anchor(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.started_at)
    }
}
