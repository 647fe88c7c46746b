//! Progress-callback trait for run, step, document, and page events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] (for page
//! and document events) and [`crate::orchestrator::Orchestrator::with_progress`]
//! (for run and step events).
//!
//! # Example
//!
//! ```rust
//! use patent_ligands::{ExtractionConfig, ExtractionProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     pages: AtomicUsize,
//! }
//!
//! impl ExtractionProgressCallback for CountingCallback {
//!     fn on_page_complete(&self, page_num: u32, interactions: usize) {
//!         self.pages.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("page {page_num}: {interactions} interactions");
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { pages: AtomicUsize::new(0) });
//!
//! let config = ExtractionConfig::builder()
//!     .progress_callback(counter as Arc<dyn ExtractionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Receives events as the pipeline advances.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Events are delivered from the task driving the
/// run, one at a time.
pub trait ExtractionProgressCallback: Send + Sync {
    /// A run is about to execute steps `resumed_from..total_steps`.
    fn on_run_start(&self, total_steps: usize, resumed_from: usize) {
        let _ = (total_steps, resumed_from);
    }

    /// Step `index` (0-based) is starting.
    fn on_step_start(&self, step: &str, index: usize, total_steps: usize) {
        let _ = (step, index, total_steps);
    }

    /// Step `index` (0-based) completed and was checkpointed.
    fn on_step_complete(&self, step: &str, index: usize, total_steps: usize) {
        let _ = (step, index, total_steps);
    }

    /// A document is about to be processed page by page.
    ///
    /// # Arguments
    /// * `index`      : 0-based position among the documents left to process
    /// * `total_docs` : documents left to process in this run
    /// * `total_pages`: pages in this document
    fn on_document_start(&self, name: &str, index: usize, total_docs: usize, total_pages: usize) {
        let _ = (name, index, total_docs, total_pages);
    }

    /// Page `page_num` is about to go through relevance, extraction, and review.
    fn on_page_start(&self, page_num: u32, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// A page passed review; `interactions` may be zero.
    fn on_page_complete(&self, page_num: u32, interactions: usize) {
        let _ = (page_num, interactions);
    }

    /// A page produced no result (empty, not relevant, or rejected).
    fn on_page_skipped(&self, page_num: u32, reason: &str) {
        let _ = (page_num, reason);
    }

    /// A document finished with `pages` page results.
    fn on_document_complete(&self, name: &str, pages: usize, interactions: usize) {
        let _ = (name, pages, interactions);
    }

    /// All steps finished.
    fn on_run_complete(&self, steps_run: usize) {
        let _ = steps_run;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        completes: AtomicUsize,
        skips: AtomicUsize,
        interactions: AtomicUsize,
    }

    impl ExtractionProgressCallback for TrackingCallback {
        fn on_page_complete(&self, _page_num: u32, interactions: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
            self.interactions.fetch_add(interactions, Ordering::SeqCst);
        }

        fn on_page_skipped(&self, _page_num: u32, _reason: &str) {
            self.skips.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_run_start(5, 0);
        cb.on_step_start("extract_texts", 1, 5);
        cb.on_document_start("US1.txt", 0, 3, 12);
        cb.on_page_start(1, 12);
        cb.on_page_complete(1, 2);
        cb.on_page_skipped(2, "not relevant");
        cb.on_document_complete("US1.txt", 1, 2);
        cb.on_step_complete("extract_texts", 1, 5);
        cb.on_run_complete(5);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_page_complete(1, 3);
        tracker.on_page_skipped(2, "rejected");
        tracker.on_page_complete(3, 0);

        assert_eq!(tracker.completes.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.skips.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.interactions.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_run_start(4, 2);
        cb.on_page_complete(1, 1);
    }
}
