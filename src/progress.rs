//! Progress-callback trait for per-page extraction events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to follow a
//! run as pages wait for capacity, get submitted and resolve.
//!
//! # Example
//!
//! ```rust
//! use statement_extract::{ExtractionConfig, ExtractionProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl ExtractionProgressCallback for CountingCallback {
//!     fn on_page_complete(&self, page_num: usize, total_pages: usize, content_len: usize) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("Page {}/{} done ({} bytes)", page_num, total_pages, content_len);
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { completed: AtomicUsize::new(0) });
//!
//! let config = ExtractionConfig::builder()
//!     .progress_callback(counter as Arc<dyn ExtractionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;
use std::time::Duration;

/// Called by the pipeline as it processes each page.
///
/// Page workers run concurrently, so the per-page methods may be called from
/// several tasks at once. All methods default to no-ops.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once after rendering, before the first page is submitted.
    fn on_extraction_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called when the field schema is known (detected or supplied).
    fn on_schema_ready(&self, fields: &[String]) {
        let _ = fields;
    }

    /// Called when the service is at capacity and a page backs off.
    ///
    /// `in_flight` is `None` when the load check itself failed.
    fn on_service_busy(&self, page_num: usize, in_flight: Option<usize>, wait: Duration) {
        let _ = (page_num, in_flight, wait);
    }

    /// Called just before a page's job is submitted.
    fn on_page_start(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// Called once the service has accepted a page's job.
    fn on_page_submitted(&self, page_num: usize, record_id: &str) {
        let _ = (page_num, record_id);
    }

    /// Called when a page's job completes.
    ///
    /// `content_len` is the byte length of the raw response.
    fn on_page_complete(&self, page_num: usize, total_pages: usize, content_len: usize) {
        let _ = (page_num, total_pages, content_len);
    }

    /// Called when a page fails for good.
    fn on_page_error(&self, page_num: usize, total_pages: usize, error: &str) {
        let _ = (page_num, total_pages, error);
    }

    /// Called once after every page has resolved.
    fn on_extraction_complete(&self, total_pages: usize, success_count: usize) {
        let _ = (total_pages, success_count);
    }
}

/// The default when no callback is configured.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        errors: AtomicUsize,
        waits: Mutex<Vec<Duration>>,
        success_total: AtomicUsize,
    }

    impl ExtractionProgressCallback for TrackingCallback {
        fn on_service_busy(&self, _page_num: usize, _in_flight: Option<usize>, wait: Duration) {
            self.waits.lock().unwrap().push(wait);
        }

        fn on_page_start(&self, _page_num: usize, _total_pages: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_complete(&self, _page_num: usize, _total_pages: usize, _content_len: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_error(&self, _page_num: usize, _total_pages: usize, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_extraction_complete(&self, _total_pages: usize, success_count: usize) {
            self.success_total.store(success_count, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_extraction_start(5);
        cb.on_schema_ready(&["Date".to_string()]);
        cb.on_service_busy(1, Some(50), Duration::from_secs(5));
        cb.on_page_start(1, 5);
        cb.on_page_submitted(1, "rec-1");
        cb.on_page_complete(1, 5, 42);
        cb.on_page_error(2, 5, "job failed");
        cb.on_extraction_complete(5, 4);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();

        tracker.on_service_busy(1, None, Duration::from_secs(5));
        tracker.on_service_busy(1, Some(60), Duration::from_secs(10));
        tracker.on_page_start(1, 2);
        tracker.on_page_complete(1, 2, 100);
        tracker.on_page_start(2, 2);
        tracker.on_page_error(2, 2, "cancelled");
        tracker.on_extraction_complete(2, 1);

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.success_total.load(Ordering::SeqCst), 1);
        assert_eq!(
            *tracker.waits.lock().unwrap(),
            vec![Duration::from_secs(5), Duration::from_secs(10)]
        );
    }
}
