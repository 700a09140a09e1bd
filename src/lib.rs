//! # edgequake-invoice
//!
//! Extract structured invoice records from PDF documents with an LLM.
//!
//! A PDF may hold several invoices back to back. The crate reads the page
//! text (from the text layer, or by OCR through a vision model when the pages
//! are images), asks the model where each invoice starts and ends, and then
//! extracts one validated record per page range through function calling.
//! Values the model cannot confirm come back as `null` instead of a guess.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input     resolve local file or download from URL
//!  ├─ 2. Extract   text layer, or pdfium raster → vision OCR
//!  ├─ 3. Analyze   LLM page-range proposal, deterministic fallback split
//!  └─ 4. Invoice   one function call per range, field-level validation
//! ```
//!
//! Jobs can run inline ([`InvoiceService::process`], [`process_sync`]) or
//! through an encrypted queue drained by a [`WorkerPool`]
//! ([`InvoiceService::submit`], [`InvoiceService::status`],
//! [`InvoiceService::result`]). Payloads and results are AES-256-GCM sealed
//! at rest and expire after a per-task TTL.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_invoice::{EncryptionKey, InvoiceService, PipelineConfig, SubmitRequest};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = PipelineConfig::builder()
//!         .encryption_key(EncryptionKey::generate())
//!         .workers(2)
//!         .build()?;
//!     let service = InvoiceService::in_memory(config)?;
//!     let pool = service.spawn_workers();
//!
//!     let id = service.submit(SubmitRequest::new("invoices.pdf", 3)).await?;
//!     let result = service.wait(&id, Duration::from_millis(500)).await?;
//!     println!("{:?}", result.document.title);
//!     for record in &result.records {
//!         println!("{}-{}: {:?}", record.pages.start_page, record.pages.end_page,
//!             record.fields.get("invoice_number"));
//!     }
//!     pool.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2invoice` binary (clap + anyhow + tracing-subscriber) |
//!
//! ```toml
//! edgequake-invoice = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod crypto;
pub mod error;
pub mod pipeline;
pub mod processor;
pub mod progress;
pub mod prompts;
pub mod schema;
pub mod service;
pub mod store;
pub mod task;
pub mod worker;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use crypto::{decrypt, encrypt, Codec, DecryptionError, EncryptionKey};
pub use error::{AnalysisError, CallError, FieldError, InvoiceError, RangeError};
pub use pipeline::analyze::{fallback_split, PageRange, PageSpan, Segmentation, SegmentationSource};
pub use pipeline::extract::ExtractionStrategy;
pub use pipeline::invoice::InvoiceRecord;
pub use pipeline::render::{DocumentInfo, DocumentMetadata};
pub use processor::Processor;
pub use progress::{NoopProgressCallback, ProcessingProgressCallback, ProgressCallback};
pub use schema::{FieldKind, FieldSpec, RecordSchema};
pub use service::{process_sync, InvoiceService, SubmitRequest};
pub use store::{MemoryStore, QueueStore, SqliteStore, StoreError, MAX_TTL};
pub use task::{PdfKind, ProcessType, Task, TaskId, TaskInfo, TaskPayload, TaskResult, TaskStatus};
pub use worker::{ShutdownSignal, StopTrigger, WorkerPool};
