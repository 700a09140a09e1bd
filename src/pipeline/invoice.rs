//! Invoice extraction: one function call per page range.
//!
//! Ranges are extracted concurrently; a process-wide semaphore caps the number
//! of calls in flight across every task. Each returned field is validated on
//! its own (see [`crate::schema`]). A range whose call fails after all
//! retries yields a partial-failure record instead of failing the task.

use crate::config::PipelineConfig;
use crate::error::{InvoiceError, RangeError};
use crate::pipeline::analyze::{PageRange, PageSpan, Segmentation};
use crate::pipeline::llm::{call_with_retries, FunctionCall, FunctionCaller};
use crate::prompts::{extraction_input, extraction_prompt};
use crate::schema::RecordSchema;
use crate::worker::ShutdownSignal;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Validated output for one page range.
///
/// `fields` holds every schema field; unconfirmed values are `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub pages: PageSpan,
    pub fields: BTreeMap<String, Value>,
    /// Set only on partial-failure records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RangeError>,
}

impl InvoiceRecord {
    pub fn is_partial_failure(&self) -> bool {
        self.error.is_some()
    }

    /// Number of fields holding a validated value.
    pub fn filled_fields(&self) -> usize {
        self.fields.values().filter(|v| !v.is_null()).count()
    }
}

/// Everything one task's extraction stage reads.
#[derive(Clone, Copy)]
pub struct ExtractionJob<'a> {
    pub pages: &'a [String],
    pub segmentation: &'a Segmentation,
    pub schema: &'a RecordSchema,
    pub metadata: Option<&'a BTreeMap<String, Value>>,
}

enum RangeOutcome {
    Done(InvoiceRecord),
    /// Stop was requested before the call started.
    Skipped,
}

/// Extract one record per range, in range order.
///
/// # Errors
/// [`InvoiceError::Cancelled`] when stop was requested before every range
/// started; calls already in flight are allowed to finish first. Failed calls
/// never fail the task: they come back as partial-failure records.
pub async fn extract_records(
    caller: &dyn FunctionCaller,
    config: &PipelineConfig,
    limiter: &Semaphore,
    shutdown: &ShutdownSignal,
    job: ExtractionJob<'_>,
) -> Result<Vec<InvoiceRecord>, InvoiceError> {
    let ranges = &job.segmentation.ranges;
    let total = ranges.len();
    if let Some(ref cb) = config.progress_callback {
        cb.on_task_start(total);
    }

    let mut outcomes: Vec<(usize, RangeOutcome)> =
        stream::iter(ranges.iter().copied().enumerate().map(|(idx, range)| async move {
            let reason = job.segmentation.reasons.get(idx).and_then(|r| r.as_deref());
            let outcome =
                extract_range(caller, config, limiter, shutdown, job, idx, range, reason).await;
            (idx, outcome)
        }))
        .buffer_unordered(config.extraction_concurrency.max(1))
        .collect()
        .await;
    outcomes.sort_by_key(|(idx, _)| *idx);

    let mut records = Vec::with_capacity(total);
    let mut skipped = 0;
    for (_, outcome) in outcomes {
        match outcome {
            RangeOutcome::Done(record) => records.push(record),
            RangeOutcome::Skipped => skipped += 1,
        }
    }

    if skipped > 0 {
        warn!("Stop requested: {} of {} ranges not started", skipped, total);
        return Err(InvoiceError::Cancelled {
            pending: skipped,
            total,
        });
    }

    let succeeded = records.iter().filter(|r| !r.is_partial_failure()).count();
    if let Some(ref cb) = config.progress_callback {
        cb.on_task_complete(total, succeeded);
    }

    if succeeded < total {
        warn!("{} of {} ranges failed; returning partial-failure records", total - succeeded, total);
    }
    info!("Extracted {}/{} records", succeeded, total);
    Ok(records)
}

#[allow(clippy::too_many_arguments)]
async fn extract_range(
    caller: &dyn FunctionCaller,
    config: &PipelineConfig,
    limiter: &Semaphore,
    shutdown: &ShutdownSignal,
    job: ExtractionJob<'_>,
    idx: usize,
    range: PageRange,
    reason: Option<&str>,
) -> RangeOutcome {
    let total = job.segmentation.ranges.len();
    let span = range.to_span();

    let permit = tokio::select! {
        biased;
        _ = shutdown.wait() => return RangeOutcome::Skipped,
        permit = limiter.acquire() => permit,
    };
    // The semaphore is never closed; a closed one means the process is going down.
    let Ok(_permit) = permit else {
        return RangeOutcome::Skipped;
    };
    if shutdown.is_stopped() {
        return RangeOutcome::Skipped;
    }

    if let Some(ref cb) = config.progress_callback {
        cb.on_range_start(idx + 1, total);
    }

    let request = FunctionCall {
        name: job.schema.function_name.to_string(),
        description: job.schema.description.to_string(),
        parameters: job.schema.json_schema(),
        system: extraction_prompt(job.schema.process_type, reason, job.metadata),
        user: extraction_input(span.start_page, &job.pages[range.start..range.end]),
    };

    let label = format!("Pages {}-{}", span.start_page, span.end_page);
    let result = call_with_retries(&label, config, config.max_retries, || caller.call(&request)).await;

    let record = match result {
        Ok(arguments) => {
            let (fields, errors) = job.schema.validate(&arguments);
            for e in &errors {
                debug!("{}: {}", label, e);
            }
            let record = InvoiceRecord {
                pages: span,
                fields,
                error: None,
            };
            if let Some(ref cb) = config.progress_callback {
                cb.on_range_complete(idx + 1, total, record.filled_fields());
            }
            record
        }
        Err(e) => {
            let error = RangeError::CallFailed {
                start_page: span.start_page,
                end_page: span.end_page,
                retries: config.max_retries,
                detail: e.to_string(),
            };
            warn!("{}", error);
            if let Some(ref cb) = config.progress_callback {
                cb.on_range_error(idx + 1, total, &error.to_string());
            }
            InvoiceRecord {
                pages: span,
                fields: job.schema.empty_record(),
                error: Some(error),
            }
        }
    };
    RangeOutcome::Done(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallError;
    use crate::pipeline::analyze::SegmentationSource;
    use crate::task::ProcessType;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Answers with the invoice number printed on the first page of the
    /// range, fails for ranges whose text contains "BROKEN".
    struct EchoCaller {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl EchoCaller {
        fn new() -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl FunctionCaller for EchoCaller {
        async fn call(&self, request: &FunctionCall) -> Result<Value, CallError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if request.user.contains("BROKEN") {
                return Err(CallError::Provider("HTTP 500".into()));
            }
            let number = request
                .user
                .lines()
                .find_map(|l| l.strip_prefix("Invoice "))
                .unwrap_or("?");
            Ok(json!({"invoice_number": number, "total_amount": "n/a"}))
        }
    }

    fn segmentation(ranges: Vec<PageRange>) -> Segmentation {
        Segmentation {
            reasons: vec![None; ranges.len()],
            ranges,
            source: SegmentationSource::Fallback,
        }
    }

    fn config(concurrency: usize) -> PipelineConfig {
        PipelineConfig::builder()
            .extraction_concurrency(concurrency)
            .max_retries(1)
            .retry_backoff_ms(1)
            .build()
            .unwrap()
    }

    fn pages(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn records_follow_range_order_and_validate_fields() {
        let pages = pages(&["Invoice A-1", "cont.", "Invoice B-2", "Invoice C-3"]);
        let seg = segmentation(vec![
            PageRange::new(0, 2),
            PageRange::new(2, 3),
            PageRange::new(3, 4),
        ]);
        let schema = RecordSchema::for_process(ProcessType::Invoice);
        let config = config(4);
        let job = ExtractionJob {
            pages: &pages,
            segmentation: &seg,
            schema: &schema,
            metadata: None,
        };

        let records = extract_records(
            &EchoCaller::new(),
            &config,
            &Semaphore::new(4),
            &ShutdownSignal::never(),
            job,
        )
        .await
        .unwrap();

        let numbers: Vec<_> = records.iter().map(|r| r.fields["invoice_number"].clone()).collect();
        assert_eq!(numbers, vec![json!("A-1"), json!("B-2"), json!("C-3")]);
        assert_eq!(records[0].pages, PageSpan { start_page: 1, end_page: 2 });
        for r in &records {
            assert_eq!(r.fields.len(), schema.fields.len());
            assert_eq!(r.fields["total_amount"], Value::Null);
        }
    }

    #[tokio::test]
    async fn failed_range_becomes_partial_failure_record() {
        let pages = pages(&["Invoice A-1", "BROKEN", "Invoice C-3"]);
        let seg = segmentation(vec![
            PageRange::new(0, 1),
            PageRange::new(1, 2),
            PageRange::new(2, 3),
        ]);
        let schema = RecordSchema::for_process(ProcessType::Invoice);
        let config = config(2);
        let job = ExtractionJob {
            pages: &pages,
            segmentation: &seg,
            schema: &schema,
            metadata: None,
        };

        let records = extract_records(
            &EchoCaller::new(),
            &config,
            &Semaphore::new(2),
            &ShutdownSignal::never(),
            job,
        )
        .await
        .unwrap();

        assert_eq!(records.len(), 3);
        assert!(!records[0].is_partial_failure());
        assert!(records[1].is_partial_failure());
        assert!(records[1].fields.values().all(Value::is_null));
        assert!(matches!(
            records[1].error,
            Some(RangeError::CallFailed { start_page: 2, end_page: 2, .. })
        ));
        assert_eq!(records[2].fields["invoice_number"], "C-3");
    }

    #[tokio::test]
    async fn every_range_failing_still_returns_records() {
        let pages = pages(&["BROKEN", "BROKEN"]);
        let seg = segmentation(vec![PageRange::new(0, 1), PageRange::new(1, 2)]);
        let schema = RecordSchema::for_process(ProcessType::Invoice);
        let config = config(2);
        let job = ExtractionJob {
            pages: &pages,
            segmentation: &seg,
            schema: &schema,
            metadata: None,
        };

        let records = extract_records(
            &EchoCaller::new(),
            &config,
            &Semaphore::new(2),
            &ShutdownSignal::never(),
            job,
        )
        .await
        .unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(InvoiceRecord::is_partial_failure));
        assert_eq!(records[1].pages, PageSpan { start_page: 2, end_page: 2 });
    }

    #[tokio::test]
    async fn shared_limiter_caps_calls_in_flight() {
        let texts: Vec<String> = (1..=8).map(|i| format!("Invoice N-{i}")).collect();
        let seg = segmentation((0..8).map(|i| PageRange::new(i, i + 1)).collect());
        let schema = RecordSchema::for_process(ProcessType::Invoice);
        let config = config(8);
        let caller = EchoCaller::new();
        let job = ExtractionJob {
            pages: &texts,
            segmentation: &seg,
            schema: &schema,
            metadata: None,
        };

        extract_records(&caller, &config, &Semaphore::new(2), &ShutdownSignal::never(), job)
            .await
            .unwrap();
        assert!(caller.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn stop_before_start_cancels_the_task() {
        let pages = pages(&["Invoice A-1", "Invoice B-2"]);
        let seg = segmentation(vec![PageRange::new(0, 1), PageRange::new(1, 2)]);
        let schema = RecordSchema::for_process(ProcessType::Invoice);
        let config = config(2);
        let (trigger, signal) = ShutdownSignal::channel();
        trigger.stop();
        let job = ExtractionJob {
            pages: &pages,
            segmentation: &seg,
            schema: &schema,
            metadata: None,
        };

        let err = extract_records(&EchoCaller::new(), &config, &Semaphore::new(2), &signal, job)
            .await
            .unwrap_err();
        assert!(matches!(err, InvoiceError::Cancelled { pending: 2, total: 2 }));
    }
}
