//! Progress-callback trait for per-page extraction events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to receive
//! real-time events as the pipeline processes each page.
//!
//! # Why callbacks instead of channels?
//!
//! The callback approach is the least-invasive integration point: callers can
//! forward events to a Tokio broadcast channel, a WebSocket, a database record,
//! or a terminal progress bar — without the library knowing anything about how
//! the host application communicates. The trait is `Send + Sync` so it works
//! correctly when pages are processed concurrently.
//!
//! # Example
//!
//! ```rust
//! use medbill_extract::{ExtractionProgressCallback, ExtractionConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: Arc<AtomicUsize>,
//! }
//!
//! impl ExtractionProgressCallback for CountingCallback {
//!     fn on_page_complete(&self, page_num: usize, total_pages: usize, item_count: usize) {
//!         let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("Page {}/{} done ({} items)", page_num, total_pages, item_count);
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback {
//!     completed: Arc::new(AtomicUsize::new(0)),
//! });
//!
//! let config = ExtractionConfig::builder()
//!     .progress_callback(counter as Arc<dyn ExtractionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the extraction pipeline as it processes each page.
///
/// Implementations must be `Send + Sync` (pages are processed concurrently
/// via a bounded fan-out). All methods have default no-op implementations so
/// callers only override what they care about.
///
/// # Thread safety
///
/// `on_page_start`, `on_page_complete`, and `on_page_error` may be called
/// concurrently from different threads. Implementations must protect shared
/// mutable state with appropriate synchronisation primitives (e.g. `Mutex`,
/// `AtomicUsize`).
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once before any page is rendered.
    ///
    /// # Arguments
    /// * `total_pages` — number of pages that will be processed
    fn on_conversion_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called just before the VLM request is sent for a page.
    ///
    /// # Arguments
    /// * `page_num`    — 1-indexed page number
    /// * `total_pages` — total pages in the document
    fn on_page_start(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// Called when a page's line items are successfully extracted.
    ///
    /// # Arguments
    /// * `page_num`    — 1-indexed page number
    /// * `total_pages` — total pages
    /// * `item_count`  — number of line items found on the page
    fn on_page_complete(&self, page_num: usize, total_pages: usize, item_count: usize) {
        let _ = (page_num, total_pages, item_count);
    }

    /// Called when a page fails after all retries are exhausted.
    ///
    /// # Arguments
    /// * `page_num`    — 1-indexed page number
    /// * `total_pages` — total pages
    /// * `error`       — human-readable error description
    fn on_page_error(&self, page_num: usize, total_pages: usize, error: &str) {
        let _ = (page_num, total_pages, error);
    }

    /// Called once after all pages have been attempted.
    ///
    /// # Arguments
    /// * `total_pages`   — total pages in the document
    /// * `success_count` — pages that extracted without error
    fn on_conversion_complete(&self, total_pages: usize, success_count: usize) {
        let _ = (total_pages, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
///
/// This is the default when no callback is configured.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;
