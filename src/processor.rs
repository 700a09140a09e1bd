//! One task, end to end: document → page texts → ranges → records, plus the
//! document's information dictionary.

use crate::config::PipelineConfig;
use crate::error::InvoiceError;
use crate::pipeline::analyze::analyze;
use crate::pipeline::extract::{ExtractionContext, ExtractionStrategy};
use crate::pipeline::input::resolve_document;
use crate::pipeline::invoice::{extract_records, ExtractionJob};
use crate::pipeline::llm::{resolve_provider, FunctionCaller, ProviderFunctionCaller};
use crate::pipeline::ocr::{OcrEngine, VisionOcr};
use crate::pipeline::render::{PdfBackend, PdfiumBackend};
use crate::schema::RecordSchema;
use crate::task::{TaskPayload, TaskResult};
use crate::worker::ShutdownSignal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Runs the pipeline stages for a payload.
///
/// Shared by every worker of a process. The extraction limiter lives here so
/// that `extraction_concurrency` bounds calls across all tasks in flight.
pub struct Processor {
    backend: Arc<dyn PdfBackend>,
    ocr: Arc<dyn OcrEngine>,
    caller: Arc<dyn FunctionCaller>,
    limiter: Arc<Semaphore>,
    config: Arc<PipelineConfig>,
}

impl Processor {
    pub fn new(
        backend: Arc<dyn PdfBackend>,
        ocr: Arc<dyn OcrEngine>,
        caller: Arc<dyn FunctionCaller>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(config.extraction_concurrency.max(1)));
        Self {
            backend,
            ocr,
            caller,
            limiter,
            config,
        }
    }

    /// Production wiring: pdfium, vision OCR and function calling over the
    /// provider resolved from `config`.
    pub fn from_config(config: Arc<PipelineConfig>) -> Result<Self, InvoiceError> {
        let provider = resolve_provider(&config)?;
        let caller = Arc::new(ProviderFunctionCaller::new(Arc::clone(&provider), &config));
        let ocr = Arc::new(VisionOcr::new(provider, &config));
        Ok(Self::new(Arc::new(PdfiumBackend::new()), ocr, caller, config))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run(
        &self,
        payload: &TaskPayload,
        shutdown: &ShutdownSignal,
    ) -> Result<TaskResult, InvoiceError> {
        payload.validate()?;
        let start = Instant::now();
        let config = self.config.as_ref();

        let document = resolve_document(
            &payload.document,
            Duration::from_secs(config.download_timeout_secs),
        )
        .await?;
        let path = document.path();

        let ctx = ExtractionContext {
            backend: self.backend.as_ref(),
            ocr: self.ocr.as_ref(),
            config,
        };
        let pages = ExtractionStrategy::for_kind(payload.pdf_kind)
            .extract(ctx, path, payload.password.as_deref())
            .await?;
        info!("{}: {} pages of text", path.display(), pages.len());

        let segmentation = analyze(
            self.caller.as_ref(),
            config,
            path,
            &pages,
            payload.invoice_count,
            payload.metadata.as_ref(),
        )
        .await?;

        let schema = RecordSchema::for_process(payload.process_type);
        let job = ExtractionJob {
            pages: &pages,
            segmentation: &segmentation,
            schema: &schema,
            metadata: payload.metadata.as_ref(),
        };
        let records = extract_records(
            self.caller.as_ref(),
            config,
            &self.limiter,
            shutdown,
            job,
        )
        .await?;

        // Document info is an annotation; losing it never fails the task.
        let document_info = match self.backend.inspect(path, payload.password.as_deref()).await {
            Ok(info) => info.metadata,
            Err(e) => {
                warn!("{}: document info unavailable: {}", path.display(), e);
                Default::default()
            }
        };

        info!(
            "{}: {} records in {}ms ({:?} segmentation)",
            path.display(),
            records.len(),
            start.elapsed().as_millis(),
            segmentation.source
        );
        Ok(TaskResult::new(document_info, records))
    }
}
