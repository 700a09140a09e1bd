//! Durable queue store backed by SQLite.
//!
//! One `tasks` table holds the encrypted blobs and status metadata. The
//! AUTOINCREMENT `seq` column is the FIFO order of the pending index. All
//! statements run on the blocking pool behind a single connection mutex, and
//! the claim is one `UPDATE … RETURNING` statement, so a row moves from
//! pending to processing exactly once even with many workers.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::{check_transition, expiry, open, seal, QueueStore, StoreError};
use crate::crypto::{Codec, EncryptionKey};
use crate::task::{Task, TaskId, TaskInfo, TaskPayload, TaskResult, TaskStatus};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS tasks (
        seq        INTEGER PRIMARY KEY AUTOINCREMENT,
        id         TEXT NOT NULL UNIQUE,
        status     TEXT NOT NULL,
        payload    BLOB NOT NULL,
        result     BLOB,
        error      TEXT,
        created_at INTEGER NOT NULL,  -- unix millis
        updated_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_tasks_status_seq ON tasks(status, seq);
    CREATE INDEX IF NOT EXISTS idx_tasks_expires ON tasks(expires_at);
"#;

/// SQLite-backed [`QueueStore`]. Cloning shares the connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    codec: Codec,
}

impl SqliteStore {
    /// Open (or create) the queue database at `path`.
    pub fn open(path: impl AsRef<Path>, key: &EncryptionKey) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(unavailable)?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(unavailable)?;
        info!("Opened queue database: {}", path.display());
        Self::with_connection(conn, key)
    }

    /// A private in-memory database, mostly for tests.
    pub fn open_in_memory(key: &EncryptionKey) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(unavailable)?;
        Self::with_connection(conn, key)
    }

    fn with_connection(conn: Connection, key: &EncryptionKey) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(unavailable)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            codec: Codec::new(key),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection mutex poisoned".into()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task panicked: {e}")))?
    }
}

fn unavailable(e: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn parse_status(id: &TaskId, raw: &str) -> Result<TaskStatus, StoreError> {
    raw.parse()
        .map_err(|e: String| StoreError::Serialization(format!("task '{id}': {e}")))
}

/// Status of a live row, or `NotFound`.
fn live_status(conn: &Connection, id: &TaskId, now: i64) -> Result<TaskStatus, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM tasks WHERE id = ?1 AND expires_at > ?2",
            params![id.as_str(), now],
            |row| row.get(0),
        )
        .optional()
        .map_err(unavailable)?;
    match raw {
        Some(s) => parse_status(id, &s),
        None => Err(StoreError::NotFound { id: id.clone() }),
    }
}

#[async_trait]
impl QueueStore for SqliteStore {
    async fn enqueue(&self, payload: &TaskPayload, ttl: Duration) -> Result<TaskId, StoreError> {
        expiry(Utc::now(), ttl)?;
        let ttl_ms = i64::try_from(ttl.as_millis())
            .map_err(|_| StoreError::InvalidTtl { secs: ttl.as_secs() })?;
        let blob = seal(&self.codec, payload)?;
        let id = TaskId::generate();

        let row_id = id.clone();
        self.run(move |conn| {
            let now = now_millis();
            conn.execute(
                "INSERT INTO tasks (id, status, payload, created_at, updated_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?4, ?5)",
                params![
                    row_id.as_str(),
                    TaskStatus::Pending.as_str(),
                    blob,
                    now,
                    now.saturating_add(ttl_ms)
                ],
            )
            .map_err(unavailable)?;
            Ok(())
        })
        .await?;

        debug!("Enqueued {}", id);
        Ok(id)
    }

    async fn claim(&self) -> Result<Option<Task>, StoreError> {
        let claimed = self
            .run(|conn| {
                conn.query_row(
                    "UPDATE tasks SET status = 'processing', updated_at = ?1
                     WHERE id = (
                         SELECT id FROM tasks
                         WHERE status = 'pending' AND expires_at > ?1
                         ORDER BY seq LIMIT 1
                     )
                     RETURNING id, payload, created_at",
                    params![now_millis()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Vec<u8>>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    },
                )
                .optional()
                .map_err(unavailable)
            })
            .await?;

        let Some((id, blob, created_at)) = claimed else {
            return Ok(None);
        };
        let id = TaskId::from(id);
        let payload: TaskPayload = open(&self.codec, &id, &blob)?;
        Ok(Some(Task {
            id,
            status: TaskStatus::Processing,
            payload,
            created_at: to_datetime(created_at),
        }))
    }

    async fn complete(&self, id: &TaskId, result: &TaskResult) -> Result<(), StoreError> {
        let blob = seal(&self.codec, result)?;
        let id = id.clone();
        self.run(move |conn| {
            let now = now_millis();
            let from = live_status(conn, &id, now)?;
            check_transition(&id, from, TaskStatus::Completed)?;
            conn.execute(
                "UPDATE tasks SET status = ?1, result = ?2, updated_at = ?3 WHERE id = ?4",
                params![TaskStatus::Completed.as_str(), blob, now, id.as_str()],
            )
            .map_err(unavailable)?;
            Ok(())
        })
        .await
    }

    async fn fail(&self, id: &TaskId, message: &str) -> Result<(), StoreError> {
        let id = id.clone();
        let message = message.to_string();
        self.run(move |conn| {
            let now = now_millis();
            let from = live_status(conn, &id, now)?;
            check_transition(&id, from, TaskStatus::Failed)?;
            conn.execute(
                "UPDATE tasks SET status = ?1, error = ?2, updated_at = ?3 WHERE id = ?4",
                params![TaskStatus::Failed.as_str(), message, now, id.as_str()],
            )
            .map_err(unavailable)?;
            Ok(())
        })
        .await
    }

    async fn get_status(&self, id: &TaskId) -> Result<TaskInfo, StoreError> {
        let id = id.clone();
        self.run(move |conn| {
            let row = conn
                .query_row(
                    "SELECT status, error, created_at, updated_at, expires_at
                     FROM tasks WHERE id = ?1 AND expires_at > ?2",
                    params![id.as_str(), now_millis()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    },
                )
                .optional()
                .map_err(unavailable)?;

            let Some((status, error, created, updated, expires)) = row else {
                return Err(StoreError::NotFound { id });
            };
            Ok(TaskInfo {
                status: parse_status(&id, &status)?,
                id,
                error,
                created_at: to_datetime(created),
                updated_at: to_datetime(updated),
                expires_at: to_datetime(expires),
            })
        })
        .await
    }

    async fn get_result(&self, id: &TaskId) -> Result<TaskResult, StoreError> {
        let lookup_id = id.clone();
        let (status, blob) = self
            .run(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT status, result FROM tasks WHERE id = ?1 AND expires_at > ?2",
                        params![lookup_id.as_str(), now_millis()],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<Vec<u8>>>(1)?)),
                    )
                    .optional()
                    .map_err(unavailable)?;
                match row {
                    Some((status, blob)) => Ok((parse_status(&lookup_id, &status)?, blob)),
                    None => Err(StoreError::NotFound { id: lookup_id }),
                }
            })
            .await?;

        match (status, blob) {
            (TaskStatus::Completed, Some(blob)) => open(&self.codec, id, &blob),
            (status, _) => Err(StoreError::NotReady {
                id: id.clone(),
                status,
            }),
        }
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let removed = self
            .run(|conn| {
                conn.execute(
                    "DELETE FROM tasks WHERE expires_at <= ?1",
                    params![now_millis()],
                )
                .map_err(unavailable)
            })
            .await?;
        if removed > 0 {
            debug!("Purged {} expired tasks", removed);
        }
        Ok(removed)
    }
}
