//! Encrypted task queue.
//!
//! A [`QueueStore`] owns task persistence: the encrypted payload, the
//! encrypted result, status metadata and the pending FIFO index. Workers
//! only move a task forward through its lifecycle; nothing ever rewrites a
//! payload.
//!
//! Two implementations ship with the crate:
//!
//! * [`MemoryStore`] for tests and single-process embedding.
//! * [`SqliteStore`] for durable queues that survive restarts.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::crypto::{Codec, DecryptionError, EncryptionError};
use crate::task::{Task, TaskId, TaskInfo, TaskPayload, TaskResult, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Failures of queue operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// The id is unknown, or its TTL has elapsed.
    #[error("task '{id}' not found")]
    NotFound { id: TaskId },

    /// A result was requested before the task completed.
    #[error("task '{id}' is not ready (status: {status})")]
    NotReady { id: TaskId, status: TaskStatus },

    /// `complete`/`fail` on a task that is not Processing.
    #[error("task '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// A stored blob could not be authenticated with the configured key.
    #[error("stored data for task '{id}' could not be decrypted with the configured key")]
    Decryption { id: TaskId },

    /// The backend is unreachable or returned an I/O error.
    #[error("queue store unavailable: {0}")]
    Unavailable(String),

    /// The requested TTL cannot be represented as an expiry time.
    #[error("ttl of {secs}s is out of range (maximum {}s)", MAX_TTL.as_secs())]
    InvalidTtl { secs: u64 },

    /// A payload or result could not be encoded or decoded.
    #[error("queue serialisation error: {0}")]
    Serialization(String),
}

impl From<EncryptionError> for StoreError {
    fn from(e: EncryptionError) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Persistence port of the task pipeline.
///
/// All state transitions are atomic with respect to concurrent callers:
/// `claim` hands each pending task to exactly one caller.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Encrypt and persist `payload` as Pending, expiring `ttl` after now.
    async fn enqueue(&self, payload: &TaskPayload, ttl: Duration) -> Result<TaskId, StoreError>;

    /// Pop the oldest live pending task and mark it Processing.
    ///
    /// `Ok(None)` when nothing is pending. A claimed task whose payload does
    /// not decrypt is reported as [`StoreError::Decryption`]; it stays in
    /// Processing so the caller can `fail` it.
    async fn claim(&self) -> Result<Option<Task>, StoreError>;

    /// Store the encrypted result and mark the task Completed.
    async fn complete(&self, id: &TaskId, result: &TaskResult) -> Result<(), StoreError>;

    /// Record `message` and mark the task Failed.
    async fn fail(&self, id: &TaskId, message: &str) -> Result<(), StoreError>;

    async fn get_status(&self, id: &TaskId) -> Result<TaskInfo, StoreError>;

    /// Decrypted result of a Completed task.
    async fn get_result(&self, id: &TaskId) -> Result<TaskResult, StoreError>;

    /// Physically remove expired tasks. Returns how many were removed.
    async fn purge_expired(&self) -> Result<usize, StoreError>;
}

/// Longest TTL a store accepts: ten years.
pub const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Wall-clock expiry of a task stored at `now` for `ttl`.
pub(crate) fn expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, StoreError> {
    let out_of_range = || StoreError::InvalidTtl { secs: ttl.as_secs() };
    if ttl > MAX_TTL {
        return Err(out_of_range());
    }
    let delta = chrono::Duration::from_std(ttl).map_err(|_| out_of_range())?;
    now.checked_add_signed(delta).ok_or_else(out_of_range)
}

/// Serialise to JSON then encrypt.
pub(crate) fn seal<T: Serialize + ?Sized>(codec: &Codec, value: &T) -> Result<Vec<u8>, StoreError> {
    let json = serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(codec.encrypt(&json)?)
}

/// Decrypt then deserialise; a tag mismatch becomes `Decryption { id }`.
pub(crate) fn open<T: DeserializeOwned>(
    codec: &Codec,
    id: &TaskId,
    blob: &[u8],
) -> Result<T, StoreError> {
    let plain = codec
        .decrypt(blob)
        .map_err(|_: DecryptionError| StoreError::Decryption { id: id.clone() })?;
    serde_json::from_slice(&plain).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Guard shared by both stores for `complete`/`fail`.
pub(crate) fn check_transition(
    id: &TaskId,
    from: TaskStatus,
    to: TaskStatus,
) -> Result<(), StoreError> {
    if from == TaskStatus::Processing {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            id: id.clone(),
            from,
            to,
        })
    }
}
