//! Progress-callback trait for per-paper run events.
//!
//! Inject an [`Arc<dyn RunProgressCallback>`] via
//! [`crate::config::ProcessorConfigBuilder::progress_callback`] to receive
//! events as the batch driver works through the month.
//!
//! # Example
//!
//! ```rust
//! use arxiv_markdown::{ProcessorConfig, RunProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     done: AtomicUsize,
//! }
//!
//! impl RunProgressCallback for CountingCallback {
//!     fn on_paper_complete(&self, arxiv_id: &str, images: usize) {
//!         let n = self.done.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{n}: {arxiv_id} ({images} images)");
//!     }
//! }
//!
//! let cb = Arc::new(CountingCallback { done: AtomicUsize::new(0) });
//! let config = ProcessorConfig::builder(1, 21)
//!     .progress_callback(cb as Arc<dyn RunProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::output::{JobStatus, RunStats};
use std::sync::Arc;

/// Called by the batch driver as it processes each paper.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. The driver calls them from a single task, in
/// enumeration order.
pub trait RunProgressCallback: Send + Sync {
    /// Called once after enumeration and checkpoint filtering.
    ///
    /// # Arguments
    /// * `to_process` : papers that will be attempted in this run
    /// * `skipped`    : papers already marked succeeded by a previous run
    fn on_run_start(&self, to_process: usize, skipped: usize) {
        let _ = (to_process, skipped);
    }

    /// Called just before the engine is invoked for a paper.
    fn on_paper_start(&self, arxiv_id: &str) {
        let _ = arxiv_id;
    }

    /// Called when a paper's Markdown has been written.
    ///
    /// # Arguments
    /// * `arxiv_id` : full identifier
    /// * `images`   : number of figures exported
    fn on_paper_complete(&self, arxiv_id: &str, images: usize) {
        let _ = (arxiv_id, images);
    }

    /// Called when a paper ends in `failed` or `timed_out`.
    fn on_paper_error(&self, arxiv_id: &str, status: JobStatus, error: &str) {
        let _ = (arxiv_id, status, error);
    }

    /// Called after every batch.
    fn on_batch_complete(&self, batch_index: usize, size: usize) {
        let _ = (batch_index, size);
    }

    /// Called once when the prefetch stream is exhausted.
    fn on_run_complete(&self, stats: &RunStats) {
        let _ = stats;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl RunProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ProcessorConfig`].
pub type ProgressCallback = Arc<dyn RunProgressCallback>;
