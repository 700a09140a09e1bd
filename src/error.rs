//! Error types for the edgequake-invoice library.
//!
//! Failures fall into three tiers:
//!
//! * [`InvoiceError`] is **Fatal** for one task: the document cannot be read,
//!   the password is wrong, the provider is not configured. A queued task
//!   ends in `Failed` with the error's display string as its message.
//!
//! * [`RangeError`] is **Non-fatal**: one invoice range failed after all
//!   retries while the others are fine. Stored inside the range's
//!   [`crate::pipeline::invoice::InvoiceRecord`] so callers see which invoice
//!   is missing and why.
//!
//! * Locally recovered errors: [`CallError`], [`AnalysisError`] and
//!   [`FieldError`] are logged and replaced by a deterministic substitute
//!   (fallback split, empty field). They never reach the caller.
//!
//! Queue-level failures live in [`crate::store::StoreError`].

use crate::store::StoreError;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-invoice library.
#[derive(Debug, Error)]
pub enum InvoiceError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The document reference is not a valid file path or URL.
    #[error("Invalid document reference '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── Extraction errors ─────────────────────────────────────────────────
    /// The PDF has no usable text layer, or could not be parsed at all.
    #[error("PDF '{path}' is unreadable: {detail}")]
    UnreadableDocument { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it does not decrypt the document.
    #[error("Invalid password for PDF '{path}'")]
    InvalidPassword { path: PathBuf },

    /// More invoices were requested than the document has pages.
    #[error("Requested {requested} invoices but the document has only {total} pages")]
    InvoiceCountExceedsPages { requested: usize, total: usize },

    /// pdfium could not rasterise a page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// Every OCR call for the document failed.
    #[error("OCR failed on all {pages} pages: {first_error}")]
    OcrFailed { pages: usize, first_error: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
    )]
    PdfiumBindingFailed(String),

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// The worker was asked to stop before every range could be started.
    #[error("Processing stopped before {pending} of {total} invoice ranges were extracted")]
    Cancelled { pending: usize, total: usize },

    // ── Queue errors ──────────────────────────────────────────────────────
    #[error(transparent)]
    Store(#[from] StoreError),

    // ── Config / request errors ───────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A submission was rejected before it reached the queue.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single invoice range.
///
/// Attached to the partial-failure record of that range; the remaining
/// ranges of the task are still produced.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RangeError {
    /// The function call failed after retries.
    #[error("Pages {start_page}-{end_page}: extraction call failed after {retries} retries: {detail}")]
    CallFailed {
        start_page: usize,
        end_page: usize,
        retries: u32,
        detail: String,
    },
}

/// Failure of a single collaborator call (function call or OCR).
///
/// Always retryable from the caller's point of view; the retry loop decides
/// when to give up.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// The provider returned an error (network, HTTP status, model error).
    #[error("provider error: {0}")]
    Provider(String),

    /// The call did not complete in time.
    #[error("call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The provider answered, but not with the requested JSON arguments.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

/// Why an LLM page-range proposal was rejected.
///
/// Recovered by the deterministic fallback split.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalysisError {
    #[error("boundary proposal call failed: {0}")]
    Call(String),

    #[error("response has no usable 'page_ranges' array")]
    MissingRanges,

    #[error("expected {expected} ranges, got {got}")]
    WrongCount { expected: usize, got: usize },

    #[error("range {index} ({start_page}-{end_page}) is outside pages 1-{total} or empty")]
    OutOfBounds {
        index: usize,
        start_page: i64,
        end_page: i64,
        total: usize,
    },

    #[error("ranges are not sorted by start page at index {index}")]
    Unsorted { index: usize },

    #[error("ranges {first} and {second} overlap")]
    Overlap { first: usize, second: usize },

    #[error("pages {from}-{to} are not covered by any range")]
    Gap { from: usize, to: usize },
}

/// Why one extracted field was replaced by the empty marker.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FieldError {
    #[error("field '{field}' missing from response")]
    Missing { field: String },

    #[error("field '{field}' has wrong type, expected {expected}")]
    WrongType {
        field: String,
        expected: &'static str,
    },

    #[error("field '{field}' has invalid format: {detail}")]
    BadFormat { field: String, detail: String },
}
