//! Public entry points: queue a document, poll for it, or process it inline.

use crate::config::PipelineConfig;
use crate::error::InvoiceError;
use crate::processor::Processor;
use crate::store::{MemoryStore, QueueStore, SqliteStore, MAX_TTL};
use crate::task::{PdfKind, ProcessType, TaskId, TaskInfo, TaskPayload, TaskResult, TaskStatus};
use crate::worker::{ShutdownSignal, WorkerPool};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// A request to extract invoices from one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Local path or HTTP(S) URL.
    pub document: String,
    #[serde(default)]
    pub pdf_kind: PdfKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub invoice_count: usize,
    #[serde(default)]
    pub process_type: ProcessType,
    /// How long the task and its result stay readable. Defaults to
    /// [`PipelineConfig::default_ttl_secs`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ttl_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, Value>>,
}

impl SubmitRequest {
    pub fn new(document: impl Into<String>, invoice_count: usize) -> Self {
        Self {
            document: document.into(),
            pdf_kind: PdfKind::default(),
            password: None,
            invoice_count,
            process_type: ProcessType::default(),
            result_ttl_secs: None,
            metadata: None,
        }
    }

    pub fn pdf_kind(mut self, kind: PdfKind) -> Self {
        self.pdf_kind = kind;
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn process_type(mut self, process_type: ProcessType) -> Self {
        self.process_type = process_type;
        self
    }

    pub fn result_ttl_secs(mut self, secs: u64) -> Self {
        self.result_ttl_secs = Some(secs);
        self
    }

    pub fn metadata(mut self, metadata: BTreeMap<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Validate and convert into the payload stored in the queue.
    pub fn into_payload(self) -> Result<TaskPayload, InvoiceError> {
        match self.result_ttl_secs {
            Some(0) => {
                return Err(InvoiceError::InvalidRequest(
                    "result_ttl_secs must be at least 1".into(),
                ))
            }
            Some(secs) if secs > MAX_TTL.as_secs() => {
                return Err(InvoiceError::InvalidRequest(format!(
                    "result_ttl_secs must be at most {}",
                    MAX_TTL.as_secs()
                )))
            }
            _ => {}
        }
        let mut payload = TaskPayload::new(self.document, self.pdf_kind, self.invoice_count)
            .with_process_type(self.process_type);
        payload.password = self.password;
        payload.metadata = self.metadata;
        payload.validate()?;
        Ok(payload)
    }
}

/// Queue front-end plus the processor workers run.
#[derive(Clone)]
pub struct InvoiceService {
    store: Arc<dyn QueueStore>,
    processor: Arc<Processor>,
}

impl InvoiceService {
    pub fn new(store: Arc<dyn QueueStore>, processor: Arc<Processor>) -> Self {
        Self { store, processor }
    }

    /// In-process queue with the production processor. Requires
    /// `config.encryption_key`.
    pub fn in_memory(config: PipelineConfig) -> Result<Self, InvoiceError> {
        let store = Arc::new(MemoryStore::new(config.require_key()?));
        let processor = Processor::from_config(Arc::new(config))?;
        Ok(Self::new(store, Arc::new(processor)))
    }

    /// Durable SQLite queue at `db_path` with the production processor.
    pub fn with_database(config: PipelineConfig, db_path: &Path) -> Result<Self, InvoiceError> {
        let store = Arc::new(SqliteStore::open(db_path, config.require_key()?)?);
        let processor = Processor::from_config(Arc::new(config))?;
        Ok(Self::new(store, Arc::new(processor)))
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub async fn submit(&self, request: SubmitRequest) -> Result<TaskId, InvoiceError> {
        let ttl = Duration::from_secs(
            request
                .result_ttl_secs
                .unwrap_or(self.processor.config().default_ttl_secs),
        );
        let payload = request.into_payload()?;
        let id = self.store.enqueue(&payload, ttl).await?;
        info!("Queued {} ({} invoices, ttl {}s)", id, payload.invoice_count, ttl.as_secs());
        Ok(id)
    }

    pub async fn status(&self, id: &TaskId) -> Result<TaskInfo, InvoiceError> {
        Ok(self.store.get_status(id).await?)
    }

    pub async fn result(&self, id: &TaskId) -> Result<TaskResult, InvoiceError> {
        Ok(self.store.get_result(id).await?)
    }

    /// Poll until the task is terminal, then return its result.
    ///
    /// A Failed task comes back as [`InvoiceError::Internal`] carrying the
    /// stored message.
    pub async fn wait(&self, id: &TaskId, poll: Duration) -> Result<TaskResult, InvoiceError> {
        loop {
            let info = self.status(id).await?;
            match info.status {
                TaskStatus::Completed => return self.result(id).await,
                TaskStatus::Failed => {
                    return Err(InvoiceError::Internal(
                        info.error.unwrap_or_else(|| "task failed".into()),
                    ))
                }
                TaskStatus::Pending | TaskStatus::Processing => tokio::time::sleep(poll).await,
            }
        }
    }

    /// Run the pipeline inline. The queue is not touched.
    pub async fn process(&self, request: SubmitRequest) -> Result<TaskResult, InvoiceError> {
        let payload = request.into_payload()?;
        self.processor.run(&payload, &ShutdownSignal::never()).await
    }

    /// Start the worker pool sized by the processor's configuration.
    pub fn spawn_workers(&self) -> WorkerPool {
        WorkerPool::start(
            Arc::clone(&self.store),
            Arc::clone(&self.processor),
            self.processor.config(),
        )
    }
}

/// Blocking wrapper around [`InvoiceService::process`] with the production
/// processor.
///
/// Creates a temporary tokio runtime internally.
pub fn process_sync(
    request: SubmitRequest,
    config: PipelineConfig,
) -> Result<TaskResult, InvoiceError> {
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| InvoiceError::Internal(format!("Failed to create tokio runtime: {}", e)))?;
    runtime.block_on(async move {
        let processor = Processor::from_config(Arc::new(config))?;
        let payload = request.into_payload()?;
        processor.run(&payload, &ShutdownSignal::never()).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_to_text_invoices() {
        let payload = SubmitRequest::new("inv.pdf", 2).into_payload().unwrap();
        assert_eq!(payload.pdf_kind, PdfKind::Text);
        assert_eq!(payload.process_type, ProcessType::Invoice);
        assert_eq!(payload.invoice_count, 2);
    }

    #[test]
    fn request_validation() {
        assert!(matches!(
            SubmitRequest::new("inv.pdf", 0).into_payload(),
            Err(InvoiceError::InvalidRequest(_))
        ));
        assert!(matches!(
            SubmitRequest::new("  ", 1).into_payload(),
            Err(InvoiceError::InvalidRequest(_))
        ));
        assert!(matches!(
            SubmitRequest::new("inv.pdf", 1).result_ttl_secs(0).into_payload(),
            Err(InvoiceError::InvalidRequest(_))
        ));
    }

    #[test]
    fn ttl_above_the_store_maximum_is_rejected() {
        let err = SubmitRequest::new("inv.pdf", 1)
            .result_ttl_secs(10_000_000_000_000)
            .into_payload()
            .unwrap_err();
        assert!(matches!(err, InvoiceError::InvalidRequest(ref m) if m.contains("at most")));
        assert!(SubmitRequest::new("inv.pdf", 1)
            .result_ttl_secs(MAX_TTL.as_secs())
            .into_payload()
            .is_ok());
    }

    #[test]
    fn request_deserialises_with_defaults() {
        let request: SubmitRequest =
            serde_json::from_str(r#"{"document": "https://x.test/a.pdf", "invoice_count": 3}"#)
                .unwrap();
        assert_eq!(request, SubmitRequest::new("https://x.test/a.pdf", 3));
    }
}
