//! Test doubles shared by the integration tests.
//!
//! Nothing here talks to pdfium or a real provider: page text comes from
//! [`FakePdf`], OCR from [`FakeOcr`], and model answers from
//! [`ScriptedCaller`]. [`GatedCaller`], [`PanickingCaller`] and [`FlakyStore`]
//! wrap those to hold a call open, blow up mid-task, or drop queue writes.

#![allow(dead_code)]

use async_trait::async_trait;
use edgequake_invoice::error::CallError;
use edgequake_invoice::pipeline::llm::{FunctionCall, FunctionCaller};
use edgequake_invoice::pipeline::ocr::OcrEngine;
use edgequake_invoice::pipeline::render::{DocumentInfo, DocumentMetadata, PdfBackend};
use edgequake_invoice::{
    EncryptionKey, InvoiceError, MemoryStore, PipelineConfig, Processor, QueueStore, StoreError,
    Task, TaskId, TaskInfo, TaskPayload, TaskResult,
};
use image::DynamicImage;
use serde_json::{json, Value};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::Notify;

// ── PDF backend ──────────────────────────────────────────────────────────────

/// Serves fixed page texts for any path.
pub struct FakePdf {
    pub texts: Vec<String>,
    pub extractable: bool,
    pub password: Option<&'static str>,
    pub title: Option<&'static str>,
}

impl FakePdf {
    pub fn with_pages(texts: &[&str]) -> Self {
        Self {
            texts: texts.iter().map(|s| s.to_string()).collect(),
            extractable: true,
            password: None,
            title: None,
        }
    }

    pub fn titled(mut self, title: &'static str) -> Self {
        self.title = Some(title);
        self
    }

    pub fn locked(mut self, password: &'static str) -> Self {
        self.password = Some(password);
        self
    }

    fn unlock(&self, path: &Path, given: Option<&str>) -> Result<(), InvoiceError> {
        match (self.password, given) {
            (None, _) => Ok(()),
            (Some(_), None) => Err(InvoiceError::PasswordRequired {
                path: path.to_path_buf(),
            }),
            (Some(want), Some(got)) if want == got => Ok(()),
            (Some(_), Some(_)) => Err(InvoiceError::InvalidPassword {
                path: path.to_path_buf(),
            }),
        }
    }
}

#[async_trait]
impl PdfBackend for FakePdf {
    async fn inspect(&self, path: &Path, password: Option<&str>) -> Result<DocumentInfo, InvoiceError> {
        self.unlock(path, password)?;
        Ok(DocumentInfo {
            page_count: self.texts.len(),
            text_extractable: self.extractable,
            metadata: DocumentMetadata {
                title: self.title.map(str::to_string),
                producer: Some("FakePdf".to_string()),
                page_count: self.texts.len(),
                ..Default::default()
            },
        })
    }

    async fn page_texts(&self, path: &Path, password: Option<&str>) -> Result<Vec<String>, InvoiceError> {
        self.unlock(path, password)?;
        Ok(self.texts.clone())
    }

    async fn render_pages(
        &self,
        path: &Path,
        password: Option<&str>,
        _max_pixels: u32,
    ) -> Result<Vec<DynamicImage>, InvoiceError> {
        self.unlock(path, password)?;
        Ok(self.texts.iter().map(|_| DynamicImage::new_luma8(8, 8)).collect())
    }
}

/// OCR that is never expected to run.
pub struct FakeOcr;

#[async_trait]
impl OcrEngine for FakeOcr {
    async fn recognize(&self, page_index: usize, _image: &DynamicImage) -> Result<String, CallError> {
        Ok(format!("Invoice OCR-{}", page_index + 1))
    }
}

// ── Model ────────────────────────────────────────────────────────────────────

/// What the model says when asked for page ranges.
#[derive(Clone)]
pub enum Proposal {
    /// The call fails every time.
    Unavailable,
    /// The call returns these arguments.
    Answer(Value),
}

/// Answers `page_ranges` from its script and `extract_data` by echoing the
/// `Invoice <number>` line of the range's first page.
pub struct ScriptedCaller {
    proposal: Proposal,
    pub analysis_calls: AtomicUsize,
    pub extraction_calls: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedCaller {
    pub fn new(proposal: Proposal) -> Self {
        Self {
            proposal,
            analysis_calls: AtomicUsize::new(0),
            extraction_calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl FunctionCaller for ScriptedCaller {
    async fn call(&self, request: &FunctionCall) -> Result<Value, CallError> {
        self.prompts.lock().unwrap().push(request.system.clone());
        if request.name == "page_ranges" {
            self.analysis_calls.fetch_add(1, Ordering::SeqCst);
            return match &self.proposal {
                Proposal::Unavailable => Err(CallError::Provider("HTTP 503".into())),
                Proposal::Answer(value) => Ok(value.clone()),
            };
        }

        self.extraction_calls.fetch_add(1, Ordering::SeqCst);
        let number = request
            .user
            .lines()
            .find_map(|l| l.trim().strip_prefix("Invoice "))
            .unwrap_or("unknown")
            .to_string();
        Ok(json!({
            "invoice_number": number,
            "issue_date": "2024-03-01",
            "due_date": "31/03/2024",
            "total_amount": 120.5,
        }))
    }
}

/// Holds every `extract_data` call open until released.
///
/// `started` fires as each extraction call begins; `release` lets one
/// waiting call through to the wrapped [`ScriptedCaller`].
pub struct GatedCaller {
    pub inner: ScriptedCaller,
    pub started: Notify,
    pub release: Notify,
}

impl GatedCaller {
    pub fn new(proposal: Proposal) -> Self {
        Self {
            inner: ScriptedCaller::new(proposal),
            started: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl FunctionCaller for GatedCaller {
    async fn call(&self, request: &FunctionCall) -> Result<Value, CallError> {
        if request.name != "page_ranges" {
            self.started.notify_one();
            self.release.notified().await;
        }
        self.inner.call(request).await
    }
}

/// Panics on the first `panics` extraction calls, then behaves like
/// [`ScriptedCaller`].
pub struct PanickingCaller {
    pub inner: ScriptedCaller,
    panics: AtomicUsize,
}

impl PanickingCaller {
    pub fn new(panics: usize) -> Self {
        Self {
            inner: ScriptedCaller::new(Proposal::Unavailable),
            panics: AtomicUsize::new(panics),
        }
    }
}

#[async_trait]
impl FunctionCaller for PanickingCaller {
    async fn call(&self, request: &FunctionCall) -> Result<Value, CallError> {
        if request.name != "page_ranges"
            && self
                .panics
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            panic!("extractor blew up on {}", request.name);
        }
        self.inner.call(request).await
    }
}

// ── Queue ────────────────────────────────────────────────────────────────────

/// A [`MemoryStore`] whose first `claim`s and result writes report the
/// queue as unavailable.
pub struct FlakyStore {
    inner: MemoryStore,
    claim_failures: AtomicUsize,
    write_failures: AtomicUsize,
    pub claims_refused: AtomicUsize,
    pub writes_refused: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: MemoryStore, claim_failures: usize, write_failures: usize) -> Self {
        Self {
            inner,
            claim_failures: AtomicUsize::new(claim_failures),
            write_failures: AtomicUsize::new(write_failures),
            claims_refused: AtomicUsize::new(0),
            writes_refused: AtomicUsize::new(0),
        }
    }

    fn refuse(budget: &AtomicUsize, refused: &AtomicUsize) -> Result<(), StoreError> {
        match budget.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
            Ok(_) => {
                refused.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Unavailable("database is locked".into()))
            }
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl QueueStore for FlakyStore {
    async fn enqueue(&self, payload: &TaskPayload, ttl: Duration) -> Result<TaskId, StoreError> {
        self.inner.enqueue(payload, ttl).await
    }

    async fn claim(&self) -> Result<Option<Task>, StoreError> {
        Self::refuse(&self.claim_failures, &self.claims_refused)?;
        self.inner.claim().await
    }

    async fn complete(&self, id: &TaskId, result: &TaskResult) -> Result<(), StoreError> {
        Self::refuse(&self.write_failures, &self.writes_refused)?;
        self.inner.complete(id, result).await
    }

    async fn fail(&self, id: &TaskId, message: &str) -> Result<(), StoreError> {
        Self::refuse(&self.write_failures, &self.writes_refused)?;
        self.inner.fail(id, message).await
    }

    async fn get_status(&self, id: &TaskId) -> Result<TaskInfo, StoreError> {
        self.inner.get_status(id).await
    }

    async fn get_result(&self, id: &TaskId) -> Result<TaskResult, StoreError> {
        self.inner.get_result(id).await
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        self.inner.purge_expired().await
    }
}

// ── Wiring ───────────────────────────────────────────────────────────────────

/// A file that passes the `%PDF` signature check.
pub fn pdf_file() -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
    file.write_all(b"%PDF-1.7\n%fake\n").unwrap();
    file
}

pub fn test_config() -> PipelineConfig {
    PipelineConfig::builder()
        .encryption_key(EncryptionKey::generate())
        .workers(2)
        .poll_interval_ms(10)
        .queue_backoff_ms(10)
        .max_retries(1)
        .retry_backoff_ms(1)
        .analysis_retries(1)
        .build()
        .unwrap()
}

pub fn processor(
    pdf: FakePdf,
    caller: Arc<dyn FunctionCaller>,
    config: PipelineConfig,
) -> Arc<Processor> {
    Arc::new(Processor::new(
        Arc::new(pdf),
        Arc::new(FakeOcr),
        caller,
        Arc::new(config),
    ))
}
