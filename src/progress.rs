//! Progress-callback trait for per-range extraction events.
//!
//! Inject an [`Arc<dyn ProcessingProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`]. The CLI uses
//! it to drive a progress bar; library callers can forward events anywhere.
//!
//! # Example
//!
//! ```rust
//! use edgequake_invoice::{PipelineConfig, ProcessingProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct Counter(AtomicUsize);
//!
//! impl ProcessingProgressCallback for Counter {
//!     fn on_range_complete(&self, _index: usize, _total: usize, _fields_filled: usize) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(Counter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the extraction stage as it processes each invoice range.
///
/// Ranges are extracted concurrently, so `on_range_*` methods may be called
/// from several tasks at once. All methods default to no-ops.
pub trait ProcessingProgressCallback: Send + Sync {
    /// Called once the document is segmented.
    ///
    /// # Arguments
    /// * `total_ranges` : number of invoice ranges that will be extracted
    fn on_task_start(&self, total_ranges: usize) {
        let _ = total_ranges;
    }

    /// Called just before the extraction call for a range is issued.
    ///
    /// # Arguments
    /// * `index` : 1-based range number
    /// * `total` : total ranges in the task
    fn on_range_start(&self, index: usize, total: usize) {
        let _ = (index, total);
    }

    /// Called when a range produced a record.
    ///
    /// # Arguments
    /// * `fields_filled` : schema fields holding a validated value
    fn on_range_complete(&self, index: usize, total: usize, fields_filled: usize) {
        let _ = (index, total, fields_filled);
    }

    /// Called when a range failed after all retries.
    fn on_range_error(&self, index: usize, total: usize, error: &str) {
        let _ = (index, total, error);
    }

    /// Called once after every range has been attempted.
    fn on_task_complete(&self, total_ranges: usize, succeeded: usize) {
        let _ = (total_ranges, succeeded);
    }
}

/// A no-op implementation; the default when no callback is configured.
pub struct NoopProgressCallback;

impl ProcessingProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn ProcessingProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Tracking {
        starts: AtomicUsize,
        completes: AtomicUsize,
        errors: AtomicUsize,
        succeeded: AtomicUsize,
    }

    impl ProcessingProgressCallback for Tracking {
        fn on_range_start(&self, _index: usize, _total: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_range_complete(&self, _index: usize, _total: usize, _fields_filled: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_range_error(&self, _index: usize, _total: usize, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_task_complete(&self, _total_ranges: usize, succeeded: usize) {
            self.succeeded.store(succeeded, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_task_start(3);
        cb.on_range_start(1, 3);
        cb.on_range_complete(1, 3, 8);
        cb.on_range_error(2, 3, "timeout");
        cb.on_task_complete(3, 2);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let t = Tracking::default();
        t.on_range_start(1, 2);
        t.on_range_complete(1, 2, 5);
        t.on_range_start(2, 2);
        t.on_range_error(2, 2, "503");
        t.on_task_complete(2, 1);

        assert_eq!(t.starts.load(Ordering::SeqCst), 2);
        assert_eq!(t.completes.load(Ordering::SeqCst), 1);
        assert_eq!(t.errors.load(Ordering::SeqCst), 1);
        assert_eq!(t.succeeded.load(Ordering::SeqCst), 1);
    }
}
