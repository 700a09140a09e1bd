//! Task model shared by the queue store, the worker pool and callers.

use crate::error::InvoiceError;
use crate::pipeline::invoice::InvoiceRecord;
use crate::pipeline::render::DocumentMetadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque task identifier, `task_<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(format!("task_{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task lifecycle.
///
/// Transitions are forward-only:
/// - Pending -> Processing (claim, at most once per task)
/// - Processing -> Completed
/// - Processing -> Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// How the caller declares the PDF was produced. Selects exactly one
/// extraction strategy; nothing is auto-detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PdfKind {
    #[default]
    Text,
    Scanned,
    PasswordProtected,
    CopyProtected,
}

impl FromStr for PdfKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "text" => Ok(PdfKind::Text),
            "scanned" => Ok(PdfKind::Scanned),
            "password_protected" | "password" => Ok(PdfKind::PasswordProtected),
            "copy_protected" | "copy" => Ok(PdfKind::CopyProtected),
            other => Err(format!(
                "unknown pdf kind '{other}' (expected text, scanned, password_protected, copy_protected)"
            )),
        }
    }
}

/// Which record schema the extractor fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessType {
    #[default]
    Invoice,
    Receipt,
}

impl FromStr for ProcessType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "invoice" => Ok(ProcessType::Invoice),
            "receipt" => Ok(ProcessType::Receipt),
            other => Err(format!(
                "unknown process type '{other}' (expected invoice, receipt)"
            )),
        }
    }
}

/// Decrypted task payload. The worker pool reads it but never rewrites it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Local path or HTTP(S) URL of the PDF.
    pub document: String,
    pub pdf_kind: PdfKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Number of invoices contained in the document (≥ 1).
    pub invoice_count: usize,
    #[serde(default)]
    pub process_type: ProcessType,
    /// Caller hints (e.g. `customer_names`) shown to the analyzer and extractor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, Value>>,
}

impl TaskPayload {
    pub fn new(document: impl Into<String>, pdf_kind: PdfKind, invoice_count: usize) -> Self {
        Self {
            document: document.into(),
            pdf_kind,
            password: None,
            invoice_count,
            process_type: ProcessType::default(),
            metadata: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_process_type(mut self, process_type: ProcessType) -> Self {
        self.process_type = process_type;
        self
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Reject payloads that can never succeed before they reach the queue.
    pub fn validate(&self) -> Result<(), InvoiceError> {
        if self.document.trim().is_empty() {
            return Err(InvoiceError::InvalidRequest(
                "document reference is empty".into(),
            ));
        }
        if self.invoice_count == 0 {
            return Err(InvoiceError::InvalidRequest(
                "invoice_count must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// A claimed task: the id plus its decrypted payload.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub payload: TaskPayload,
    pub created_at: DateTime<Utc>,
}

/// What a completed task stores: the document's information dictionary plus
/// one record per page range, in page order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default)]
    pub document: DocumentMetadata,
    pub records: Vec<InvoiceRecord>,
}

impl TaskResult {
    pub fn new(document: DocumentMetadata, records: Vec<InvoiceRecord>) -> Self {
        Self { document, records }
    }

    /// Records without a range error.
    pub fn succeeded(&self) -> usize {
        self.records.iter().filter(|r| !r.is_partial_failure()).count()
    }
}

/// Status view of a task, as returned by `QueueStore::get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
