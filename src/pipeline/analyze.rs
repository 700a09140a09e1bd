//! Page range analysis: split a document's pages into one range per invoice.
//!
//! The model proposes the boundaries; the proposal is accepted only if it is
//! a valid partition of the document. Otherwise, after the configured
//! retries, the deterministic [`fallback_split`] is used. Either way the
//! caller gets exactly `k` sorted, disjoint ranges covering every page.

use crate::config::PipelineConfig;
use crate::error::{AnalysisError, InvoiceError};
use crate::pipeline::llm::{FunctionCall, FunctionCaller};
use crate::prompts::{page_analysis_input, page_analysis_prompt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Half-open, 0-based interval of page indices: `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageRange {
    pub start: usize,
    pub end: usize,
}

impl PageRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 1-based inclusive form used at every external interface.
    pub fn to_span(self) -> PageSpan {
        PageSpan {
            start_page: self.start + 1,
            end_page: self.end,
        }
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// 1-based, inclusive page span as callers see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSpan {
    pub start_page: usize,
    pub end_page: usize,
}

impl PageSpan {
    pub fn to_range(self) -> PageRange {
        PageRange::new(self.start_page.saturating_sub(1), self.end_page)
    }
}

/// Where a segmentation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentationSource {
    /// Accepted model proposal.
    Llm,
    /// Deterministic even split after the model failed.
    Fallback,
    /// Only one partition exists (`k == 1` or `k == n`); no call made.
    Forced,
}

/// A validated partition of a document into invoice ranges.
#[derive(Debug, Clone, PartialEq)]
pub struct Segmentation {
    pub ranges: Vec<PageRange>,
    /// Model's reason per range; `None` for fallback and forced ranges.
    pub reasons: Vec<Option<String>>,
    pub source: SegmentationSource,
}

impl Segmentation {
    fn without_reasons(ranges: Vec<PageRange>, source: SegmentationSource) -> Self {
        let reasons = vec![None; ranges.len()];
        Self {
            ranges,
            reasons,
            source,
        }
    }
}

/// Split `[0, n)` into `k` contiguous ranges as evenly as possible.
///
/// The first `n % k` ranges get `n / k + 1` pages, the rest `n / k`.
/// Requires `1 <= k <= n`.
pub fn fallback_split(n: usize, k: usize) -> Vec<PageRange> {
    if k == 0 {
        return Vec::new();
    }
    let base = n / k;
    let extra = n % k;
    let mut ranges = Vec::with_capacity(k);
    let mut start = 0;
    for i in 0..k {
        let len = base + usize::from(i < extra);
        ranges.push(PageRange::new(start, start + len));
        start += len;
    }
    ranges
}

/// Check that `ranges` is a partition of `[0, n)` into exactly `k` parts.
pub fn validate_ranges(ranges: &[PageRange], n: usize, k: usize) -> Result<(), AnalysisError> {
    if ranges.len() != k {
        return Err(AnalysisError::WrongCount {
            expected: k,
            got: ranges.len(),
        });
    }
    for (index, r) in ranges.iter().enumerate() {
        if r.is_empty() || r.end > n {
            return Err(AnalysisError::OutOfBounds {
                index,
                start_page: r.start as i64 + 1,
                end_page: r.end as i64,
                total: n,
            });
        }
    }
    let mut covered = 0;
    for (index, pair) in ranges.windows(2).enumerate() {
        if pair[1].start < pair[0].start {
            return Err(AnalysisError::Unsorted { index: index + 1 });
        }
    }
    for (index, r) in ranges.iter().enumerate() {
        if r.start < covered {
            return Err(AnalysisError::Overlap {
                first: index - 1,
                second: index,
            });
        }
        if r.start > covered {
            return Err(AnalysisError::Gap {
                from: covered + 1,
                to: r.start,
            });
        }
        covered = r.end;
    }
    if covered < n {
        return Err(AnalysisError::Gap {
            from: covered + 1,
            to: n,
        });
    }
    Ok(())
}

/// JSON Schema of the boundary-proposal function.
pub fn page_ranges_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "page_ranges": {
                "type": "array",
                "description": "One entry per invoice, in page order",
                "items": {
                    "type": "object",
                    "properties": {
                        "start_page": { "type": "integer", "description": "First page (1-based)" },
                        "end_page":   { "type": "integer", "description": "Last page (1-based, inclusive)" },
                        "reason":     { "type": "string",  "description": "Why the invoice starts and ends here" }
                    },
                    "required": ["start_page", "end_page", "reason"]
                }
            }
        },
        "required": ["page_ranges"]
    })
}

/// Parse `{"page_ranges": [{start_page, end_page, reason}]}` into 0-based
/// ranges and their reasons. Bounds are not checked here.
pub fn parse_proposal(
    arguments: &Value,
    n: usize,
) -> Result<(Vec<PageRange>, Vec<Option<String>>), AnalysisError> {
    let items = arguments
        .get("page_ranges")
        .and_then(Value::as_array)
        .filter(|a| !a.is_empty())
        .ok_or(AnalysisError::MissingRanges)?;

    let mut ranges = Vec::with_capacity(items.len());
    let mut reasons = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let start = item.get("start_page").and_then(Value::as_i64);
        let end = item.get("end_page").and_then(Value::as_i64);
        let (Some(start), Some(end)) = (start, end) else {
            return Err(AnalysisError::MissingRanges);
        };
        if start < 1 || end < start || end > n as i64 {
            return Err(AnalysisError::OutOfBounds {
                index,
                start_page: start,
                end_page: end,
                total: n,
            });
        }
        ranges.push(PageRange::new(start as usize - 1, end as usize));
        reasons.push(
            item.get("reason")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        );
    }
    Ok((ranges, reasons))
}

/// Segment `pages` into `invoice_count` ranges.
///
/// Fails only for inputs no partition exists for: an empty document, or
/// more invoices than pages.
pub async fn analyze(
    caller: &dyn FunctionCaller,
    config: &PipelineConfig,
    path: &Path,
    pages: &[String],
    invoice_count: usize,
    metadata: Option<&BTreeMap<String, Value>>,
) -> Result<Segmentation, InvoiceError> {
    let n = pages.len();
    let k = invoice_count;
    if n == 0 {
        return Err(InvoiceError::UnreadableDocument {
            path: path.to_path_buf(),
            detail: "document has no pages".into(),
        });
    }
    if k == 0 || k > n {
        return Err(InvoiceError::InvoiceCountExceedsPages {
            requested: k,
            total: n,
        });
    }

    if k == 1 || k == n {
        debug!("Partition of {} pages into {} is forced", n, k);
        return Ok(Segmentation::without_reasons(
            fallback_split(n, k),
            SegmentationSource::Forced,
        ));
    }

    let request = FunctionCall {
        name: "page_ranges".into(),
        description: "Report the page range of each invoice in the document".into(),
        parameters: page_ranges_schema(),
        system: page_analysis_prompt(n, k, metadata),
        user: page_analysis_input(pages, config.analysis_chars_per_page),
    };

    for attempt in 0..=config.analysis_retries {
        if attempt > 0 {
            let backoff = config.retry_backoff(attempt);
            warn!(
                "Page analysis: retry {}/{} after {}ms",
                attempt,
                config.analysis_retries,
                backoff.as_millis()
            );
            sleep(backoff).await;
        }

        match propose(caller, config, &request, n, k).await {
            Ok(segmentation) => {
                info!(
                    "Page analysis: {}",
                    segmentation
                        .ranges
                        .iter()
                        .map(|r| {
                            let s = r.to_span();
                            format!("{}-{}", s.start_page, s.end_page)
                        })
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                return Ok(segmentation);
            }
            Err(e) => warn!("Page analysis: attempt {} rejected: {}", attempt + 1, e),
        }
    }

    let ranges = fallback_split(n, k);
    warn!(
        "Page analysis failed after {} attempts, using even split of {} pages into {}",
        config.analysis_retries + 1,
        n,
        k
    );
    Ok(Segmentation::without_reasons(
        ranges,
        SegmentationSource::Fallback,
    ))
}

async fn propose(
    caller: &dyn FunctionCaller,
    config: &PipelineConfig,
    request: &FunctionCall,
    n: usize,
    k: usize,
) -> Result<Segmentation, AnalysisError> {
    let limit = config.api_timeout();
    let arguments = match timeout(limit, caller.call(request)).await {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => return Err(AnalysisError::Call(e.to_string())),
        Err(_) => {
            return Err(AnalysisError::Call(format!(
                "timed out after {}s",
                limit.as_secs()
            )))
        }
    };
    let (ranges, reasons) = parse_proposal(&arguments, n)?;
    validate_ranges(&ranges, n, k)?;
    Ok(Segmentation {
        ranges,
        reasons,
        source: SegmentationSource::Llm,
    })
}
