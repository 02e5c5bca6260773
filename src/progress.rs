//! Progress-callback trait for per-page job events.
//!
//! Inject an [`Arc<dyn JobProgressCallback>`] via
//! [`crate::config::ParseOptionsBuilder::progress_callback`] to receive
//! events as a worker walks a document page by page. The job registry is
//! updated regardless; callbacks are for hosts that want push-style events
//! (terminal progress bars, websockets) instead of polling.
//!
//! # Example
//!
//! ```rust
//! use pricelist_ocr::{JobProgressCallback, PageStatus, ParseOptions};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     records: AtomicUsize,
//! }
//!
//! impl JobProgressCallback for CountingCallback {
//!     fn on_page_complete(&self, _job_id: &str, _page: usize, _total: usize, _status: PageStatus, records: usize) {
//!         self.records.fetch_add(records, Ordering::SeqCst);
//!     }
//! }
//!
//! let options = ParseOptions::builder()
//!     .progress_callback(Arc::new(CountingCallback { records: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::output::PageStatus;
use std::sync::Arc;

/// Called by a worker as it processes each page of a job.
///
/// Implementations must be `Send + Sync`: different jobs run on different
/// workers, so one callback shared between jobs sees concurrent calls.
/// All methods have default no-op implementations.
pub trait JobProgressCallback: Send + Sync {
    /// Called once when the job leaves the queue.
    fn on_job_start(&self, job_id: &str, total_pages: usize) {
        let _ = (job_id, total_pages);
    }

    /// Called just before a page (or sheet) is handed to the pipeline.
    ///
    /// `page` is 1-indexed.
    fn on_page_start(&self, job_id: &str, page: usize, total_pages: usize) {
        let _ = (job_id, page, total_pages);
    }

    /// Called after every attempted page, whatever its outcome.
    fn on_page_complete(
        &self,
        job_id: &str,
        page: usize,
        total_pages: usize,
        status: PageStatus,
        records: usize,
    ) {
        let _ = (job_id, page, total_pages, status, records);
    }

    /// Called once when the job reaches a terminal state.
    fn on_job_complete(&self, job_id: &str, total_records: usize, failed_pages: usize) {
        let _ = (job_id, total_records, failed_pages);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl JobProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ParseOptions`].
pub type ProgressCallback = Arc<dyn JobProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        ok: AtomicUsize,
        failed: AtomicUsize,
        records: AtomicUsize,
    }

    impl JobProgressCallback for TrackingCallback {
        fn on_page_start(&self, _job_id: &str, _page: usize, _total: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_complete(
            &self,
            _job_id: &str,
            _page: usize,
            _total: usize,
            status: PageStatus,
            records: usize,
        ) {
            match status {
                PageStatus::Failed => self.failed.fetch_add(1, Ordering::SeqCst),
                _ => self.ok.fetch_add(1, Ordering::SeqCst),
            };
            self.records.fetch_add(records, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_job_start("j", 3);
        cb.on_page_start("j", 1, 3);
        cb.on_page_complete("j", 1, 3, PageStatus::Ok, 4);
        cb.on_job_complete("j", 4, 0);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_page_start("j", 1, 2);
        tracker.on_page_complete("j", 1, 2, PageStatus::Ok, 3);
        tracker.on_page_start("j", 2, 2);
        tracker.on_page_complete("j", 2, 2, PageStatus::Failed, 0);

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.ok.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.failed.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.records.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_job_start("j", 10);
    }
}
