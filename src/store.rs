//! Queue storage
//!
//! `ExecutionMonitor` keeps queue state behind a `QueueStore` so the
//! in-memory map used in tests and by default can be swapped for the SQLite
//! store when queues should survive a restart.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::MonitorError;
use crate::queue::{ExecutionLog, ExecutionQueue, LogLevel, QueueStatus};

pub type StoreResult<T> = Result<T, MonitorError>;

/// Keyed storage for execution queues.
///
/// `update` applies the closure atomically with respect to other store calls.
pub trait QueueStore: Send + Sync {
    fn insert(&self, queue: ExecutionQueue) -> StoreResult<()>;

    fn get(&self, queue_id: &str) -> StoreResult<Option<ExecutionQueue>>;

    /// Returns false when the queue does not exist.
    fn update(&self, queue_id: &str, apply: &mut dyn FnMut(&mut ExecutionQueue)) -> StoreResult<bool>;

    fn remove(&self, queue_id: &str) -> StoreResult<bool>;

    fn list(&self) -> StoreResult<Vec<ExecutionQueue>>;

    /// Drop every non-running queue whose retention anchor is older than `cutoff`.
    fn evict_expired(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;
}

fn is_expired(queue: &ExecutionQueue, cutoff: DateTime<Utc>) -> bool {
    queue.status != QueueStatus::Running && queue.retention_anchor() < cutoff
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-local store; contents are lost on restart.
#[derive(Default)]
pub struct MemoryQueueStore {
    queues: Mutex<HashMap<String, ExecutionQueue>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for MemoryQueueStore {
    fn insert(&self, queue: ExecutionQueue) -> StoreResult<()> {
        lock(&self.queues).insert(queue.queue_id.clone(), queue);
        Ok(())
    }

    fn get(&self, queue_id: &str) -> StoreResult<Option<ExecutionQueue>> {
        Ok(lock(&self.queues).get(queue_id).cloned())
    }

    fn update(&self, queue_id: &str, apply: &mut dyn FnMut(&mut ExecutionQueue)) -> StoreResult<bool> {
        let mut queues = lock(&self.queues);
        match queues.get_mut(queue_id) {
            Some(queue) => {
                apply(queue);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn remove(&self, queue_id: &str) -> StoreResult<bool> {
        Ok(lock(&self.queues).remove(queue_id).is_some())
    }

    fn list(&self) -> StoreResult<Vec<ExecutionQueue>> {
        let mut queues: Vec<_> = lock(&self.queues).values().cloned().collect();
        queues.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(queues)
    }

    fn evict_expired(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut queues = lock(&self.queues);
        let before = queues.len();
        queues.retain(|_, q| !is_expired(q, cutoff));
        Ok(before - queues.len())
    }
}

/// SQLite-backed store. Each queue is kept as a JSON document.
pub struct SqliteQueueStore {
    conn: Mutex<Connection>,
}

impl SqliteQueueStore {
    /// Open (or create) the queue database.
    ///
    /// Queues left `queued` or `running` by a previous process have no task
    /// driving them any more and are moved to `failed`.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let store = Self::init(Connection::open(path)?)?;
        let interrupted = store.fail_interrupted()?;
        if interrupted > 0 {
            tracing::warn!("Marked {} interrupted queues as failed in {:?}", interrupted, path);
        }
        Ok(store)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS execution_queues (
                queue_id    TEXT PRIMARY KEY,
                client_id   TEXT NOT NULL,
                status      TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                body        TEXT NOT NULL
            );",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn fail_interrupted(&self) -> StoreResult<usize> {
        let conn = lock(&self.conn);
        let mut interrupted = 0;
        for mut queue in Self::read_all(&conn)? {
            if queue.fail() {
                queue.push_log(ExecutionLog::new(
                    LogLevel::Error,
                    "Execution interrupted: queue was still active when the store was reopened",
                ));
                Self::write(&conn, &queue)?;
                interrupted += 1;
            }
        }
        Ok(interrupted)
    }

    fn write(conn: &Connection, queue: &ExecutionQueue) -> StoreResult<()> {
        let body = serde_json::to_string(queue)?;
        conn.execute(
            "INSERT OR REPLACE INTO execution_queues (queue_id, client_id, status, created_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                queue.queue_id,
                queue.client_id,
                queue.status.as_str(),
                queue.created_at.timestamp_millis(),
                body
            ],
        )?;
        Ok(())
    }

    fn read(conn: &Connection, queue_id: &str) -> StoreResult<Option<ExecutionQueue>> {
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM execution_queues WHERE queue_id = ?1",
                params![queue_id],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    fn read_all(conn: &Connection) -> StoreResult<Vec<ExecutionQueue>> {
        let mut stmt = conn.prepare("SELECT body FROM execution_queues ORDER BY created_at")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut queues = Vec::new();
        for row in rows {
            queues.push(serde_json::from_str(&row?)?);
        }
        Ok(queues)
    }
}

impl QueueStore for SqliteQueueStore {
    fn insert(&self, queue: ExecutionQueue) -> StoreResult<()> {
        Self::write(&lock(&self.conn), &queue)
    }

    fn get(&self, queue_id: &str) -> StoreResult<Option<ExecutionQueue>> {
        Self::read(&lock(&self.conn), queue_id)
    }

    fn update(&self, queue_id: &str, apply: &mut dyn FnMut(&mut ExecutionQueue)) -> StoreResult<bool> {
        let conn = lock(&self.conn);
        match Self::read(&conn, queue_id)? {
            Some(mut queue) => {
                apply(&mut queue);
                Self::write(&conn, &queue)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn remove(&self, queue_id: &str) -> StoreResult<bool> {
        let removed = lock(&self.conn).execute(
            "DELETE FROM execution_queues WHERE queue_id = ?1",
            params![queue_id],
        )?;
        Ok(removed > 0)
    }

    fn list(&self) -> StoreResult<Vec<ExecutionQueue>> {
        Self::read_all(&lock(&self.conn))
    }

    fn evict_expired(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let conn = lock(&self.conn);
        let expired: Vec<String> = Self::read_all(&conn)?
            .into_iter()
            .filter(|q| is_expired(q, cutoff))
            .map(|q| q.queue_id)
            .collect();
        for queue_id in &expired {
            conn.execute(
                "DELETE FROM execution_queues WHERE queue_id = ?1",
                params![queue_id],
            )?;
        }
        Ok(expired.len())
    }
}
