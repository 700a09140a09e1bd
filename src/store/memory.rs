//! In-memory queue store.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{check_transition, expiry, open, seal, QueueStore, StoreError};
use crate::crypto::{Codec, EncryptionKey};
use crate::task::{Task, TaskId, TaskInfo, TaskPayload, TaskResult, TaskStatus};

/// One stored task. Payload and result are ciphertext.
struct Entry {
    status: TaskStatus,
    payload: Vec<u8>,
    result: Option<Vec<u8>>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    /// Monotonic deadline; the source of truth for expiry.
    deadline: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

#[derive(Default)]
struct State {
    records: HashMap<TaskId, Entry>,
    /// Pending ids in submission order.
    pending: VecDeque<TaskId>,
}

impl State {
    /// Live entry for `id`, or `NotFound` once the TTL has elapsed.
    fn live(&self, id: &TaskId, now: Instant) -> Result<&Entry, StoreError> {
        match self.records.get(id) {
            Some(e) if !e.is_expired(now) => Ok(e),
            _ => Err(StoreError::NotFound { id: id.clone() }),
        }
    }

    fn live_mut(&mut self, id: &TaskId, now: Instant) -> Result<&mut Entry, StoreError> {
        match self.records.get_mut(id) {
            Some(e) if !e.is_expired(now) => Ok(e),
            _ => Err(StoreError::NotFound { id: id.clone() }),
        }
    }
}

/// Queue store held entirely in process memory.
///
/// Cloning is cheap and every clone shares the same queue. Expiry is driven
/// by `tokio::time`, so tests can advance a paused clock past a TTL.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    codec: Codec,
}

impl MemoryStore {
    pub fn new(key: &EncryptionKey) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            codec: Codec::new(key),
        }
    }

    /// Number of stored tasks, expired ones included until purged.
    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn enqueue(&self, payload: &TaskPayload, ttl: Duration) -> Result<TaskId, StoreError> {
        let now = Utc::now();
        let expires_at = expiry(now, ttl)?;
        let blob = seal(&self.codec, payload)?;
        let id = TaskId::generate();

        let entry = Entry {
            status: TaskStatus::Pending,
            payload: blob,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            expires_at,
            deadline: Instant::now() + ttl,
        };

        let mut state = self.state.lock().await;
        state.records.insert(id.clone(), entry);
        state.pending.push_back(id.clone());
        debug!("Enqueued {}", id);
        Ok(id)
    }

    async fn claim(&self) -> Result<Option<Task>, StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        while let Some(id) = state.pending.pop_front() {
            let Some(entry) = state.records.get_mut(&id) else {
                continue;
            };
            if entry.is_expired(now) || entry.status != TaskStatus::Pending {
                continue;
            }

            entry.status = TaskStatus::Processing;
            entry.updated_at = Utc::now();
            let created_at = entry.created_at;
            let payload: TaskPayload = open(&self.codec, &id, &entry.payload)?;

            return Ok(Some(Task {
                id,
                status: TaskStatus::Processing,
                payload,
                created_at,
            }));
        }
        Ok(None)
    }

    async fn complete(&self, id: &TaskId, result: &TaskResult) -> Result<(), StoreError> {
        let blob = seal(&self.codec, result)?;
        let mut state = self.state.lock().await;
        let entry = state.live_mut(id, Instant::now())?;
        check_transition(id, entry.status, TaskStatus::Completed)?;
        entry.status = TaskStatus::Completed;
        entry.result = Some(blob);
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn fail(&self, id: &TaskId, message: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let entry = state.live_mut(id, Instant::now())?;
        check_transition(id, entry.status, TaskStatus::Failed)?;
        entry.status = TaskStatus::Failed;
        entry.error = Some(message.to_string());
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn get_status(&self, id: &TaskId) -> Result<TaskInfo, StoreError> {
        let state = self.state.lock().await;
        let e = state.live(id, Instant::now())?;
        Ok(TaskInfo {
            id: id.clone(),
            status: e.status,
            error: e.error.clone(),
            created_at: e.created_at,
            updated_at: e.updated_at,
            expires_at: e.expires_at,
        })
    }

    async fn get_result(&self, id: &TaskId) -> Result<TaskResult, StoreError> {
        let state = self.state.lock().await;
        let e = state.live(id, Instant::now())?;
        match (&e.status, &e.result) {
            (TaskStatus::Completed, Some(blob)) => open(&self.codec, id, blob),
            (status, _) => Err(StoreError::NotReady {
                id: id.clone(),
                status: *status,
            }),
        }
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let before = state.records.len();
        state.records.retain(|_, e| !e.is_expired(now));
        let State { records, pending } = &mut *state;
        pending.retain(|id| records.contains_key(id));
        Ok(before - state.records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::PdfKind;

    fn store() -> MemoryStore {
        MemoryStore::new(&EncryptionKey::generate())
    }

    fn payload(doc: &str) -> TaskPayload {
        TaskPayload::new(doc, PdfKind::Text, 1)
    }

    const HOUR: Duration = Duration::from_secs(3600);

    fn empty_result() -> TaskResult {
        TaskResult::new(Default::default(), Vec::new())
    }

    #[tokio::test]
    async fn claim_is_fifo() {
        let s = store();
        let a = s.enqueue(&payload("a.pdf"), HOUR).await.unwrap();
        let b = s.enqueue(&payload("b.pdf"), HOUR).await.unwrap();

        let first = s.claim().await.unwrap().unwrap();
        assert_eq!(first.id, a);
        assert_eq!(first.payload.document, "a.pdf");
        assert_eq!(s.claim().await.unwrap().unwrap().id, b);
        assert!(s.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_moves_to_processing() {
        let s = store();
        let id = s.enqueue(&payload("a.pdf"), HOUR).await.unwrap();
        assert_eq!(s.get_status(&id).await.unwrap().status, TaskStatus::Pending);
        s.claim().await.unwrap();
        assert_eq!(s.get_status(&id).await.unwrap().status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn complete_requires_processing() {
        let s = store();
        let id = s.enqueue(&payload("a.pdf"), HOUR).await.unwrap();
        let err = s.complete(&id, &empty_result()).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        s.claim().await.unwrap();
        s.complete(&id, &empty_result()).await.unwrap();
        let err = s.fail(&id, "late").await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: TaskStatus::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn result_not_ready_until_completed() {
        let s = store();
        let id = s.enqueue(&payload("a.pdf"), HOUR).await.unwrap();
        assert!(matches!(
            s.get_result(&id).await,
            Err(StoreError::NotReady {
                status: TaskStatus::Pending,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn failed_task_keeps_message() {
        let s = store();
        let id = s.enqueue(&payload("a.pdf"), HOUR).await.unwrap();
        s.claim().await.unwrap();
        s.fail(&id, "Invalid password for PDF 'a.pdf'").await.unwrap();
        let info = s.get_status(&id).await.unwrap();
        assert_eq!(info.status, TaskStatus::Failed);
        assert!(info.error.unwrap().contains("Invalid password"));
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let s = store();
        let err = s.get_status(&TaskId::from("task_missing")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn oversized_ttl_is_rejected_without_storing() {
        let s = store();
        let err = s
            .enqueue(&payload("a.pdf"), Duration::from_secs(10_000_000_000_000))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTtl { .. }));
        assert!(s.is_empty().await);
        assert!(s.claim().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_pending_task_is_skipped_and_purged() {
        let s = store();
        s.enqueue(&payload("old.pdf"), Duration::from_secs(5))
            .await
            .unwrap();
        let fresh = s.enqueue(&payload("new.pdf"), HOUR).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(s.claim().await.unwrap().unwrap().id, fresh);
        assert_eq!(s.purge_expired().await.unwrap(), 1);
        assert_eq!(s.len().await, 1);
    }
}
