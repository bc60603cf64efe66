//! Streaming extraction API: emit pages as they complete.
//!
//! ## Why stream?
//!
//! Large bills take minutes. A streams-based API lets callers display
//! partial results immediately, wire up progress bars, or persist pages
//! incrementally instead of buffering the entire document in memory.
//!
//! Unlike the eager [`crate::extract::extract`] which returns only after
//! all pages finish, [`extract_stream`] yields `PageExtraction` items via a
//! `Stream` as each page completes. Pages arrive in completion order, not
//! page order (sort by `page_num` if order matters), and the flat
//! deduplicated item list is not built — callers streaming pages do their
//! own accumulation.

use crate::config::ExtractionConfig;
use crate::error::{ExtractError, PageError};
use crate::extract::{finish_page, resolve_provider};
use crate::output::PageExtraction;
use crate::pipeline::input::DocumentKind;
use crate::pipeline::{encode, input, model, render};
use futures::stream::{self, StreamExt};
use std::io::Write;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;
use tracing::{info, warn};

/// A boxed stream of per-page extraction results.
pub type PageStream = Pin<Box<dyn Stream<Item = Result<PageExtraction, PageError>> + Send>>;

/// Extract a bill document, streaming pages as they are ready.
///
/// Pages are emitted in completion order (not necessarily page order).
/// Sort by `page_num` if order matters.
///
/// # Returns
/// - `Ok(PageStream)` — a stream of `Result<PageExtraction, PageError>`
/// - `Err(ExtractError)` — fatal error (file not found, not a PDF, etc.)
pub async fn extract_stream(
    input_str: impl AsRef<str>,
    config: &ExtractionConfig,
) -> Result<PageStream, ExtractError> {
    let input_str = input_str.as_ref();
    info!("Starting streaming extraction: {}", input_str);

    // ── Resolve input ────────────────────────────────────────────────────
    let resolved = input::resolve_input(input_str, config.download_timeout_secs).await?;
    let doc_path = resolved.path().to_path_buf();
    let kind = resolved.kind();

    // ── Get provider ─────────────────────────────────────────────────────
    let provider = resolve_provider(config).await?;

    // ── Page count and selection ─────────────────────────────────────────
    let rendered = match kind {
        DocumentKind::Pdf => {
            let total = render::page_count(&doc_path, config.password.as_deref()).await?;
            let page_indices = config.pages.to_indices(total);
            if page_indices.is_empty() {
                return Err(ExtractError::PageOutOfRange {
                    page: config.pages.first_requested(),
                    total,
                });
            }
            render::render_pages(&doc_path, config, &page_indices).await?
        }
        DocumentKind::Image => render::load_image(&doc_path, config).await?,
    };

    // ── Encode images ────────────────────────────────────────────────────
    // An encode failure still yields a stream item (as an `Err`), so every
    // selected page is observable by the consumer.
    let encoded: Vec<Result<(usize, edgequake_llm::ImageData), PageError>> = rendered
        .iter()
        .map(|(idx, img)| match encode::encode_page(img) {
            Ok(data) => Ok((*idx, data)),
            Err(e) => {
                warn!("Failed to encode page {}: {}", idx + 1, e);
                Err(PageError::RenderFailed {
                    page: idx + 1,
                    detail: format!("image encoding failed: {}", e),
                })
            }
        })
        .collect();

    // ── Build the stream ─────────────────────────────────────────────────
    let concurrency = config.concurrency;
    let config_clone = config.clone();

    let s = stream::iter(encoded.into_iter().map(move |entry| {
        let provider = Arc::clone(&provider);
        let cfg = config_clone.clone();
        async move {
            let (idx, img_data) = entry?;
            let page_num = idx + 1;
            let raw = model::process_page(&provider, page_num, img_data, &cfg).await;
            let mut page = finish_page(raw);
            match page.error.take() {
                None => Ok(page),
                Some(err) => Err(err),
            }
        }
    }))
    .buffer_unordered(concurrency);

    Ok(Box::pin(s))
}

/// Extract from document bytes in memory, streaming pages as they complete.
///
/// This is the streaming equivalent of [`crate::extract::extract_from_bytes`].
/// The bytes are written to a temporary file internally; the file is cleaned
/// up automatically when this function returns.
///
/// # Example
/// ```rust,no_run
/// use medbill_extract::{extract_stream_from_bytes, ExtractionConfig};
/// use futures::StreamExt;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let bytes: Vec<u8> = std::fs::read("bill.pdf")?;
/// let config = ExtractionConfig::default();
/// let mut stream = extract_stream_from_bytes(&bytes, &config).await?;
/// while let Some(page) = stream.next().await {
///     match page {
///         Ok(p) => println!("Page {}: {} items", p.page_num, p.items.len()),
///         Err(e) => eprintln!("Error: {e}"),
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub async fn extract_stream_from_bytes(
    bytes: &[u8],
    config: &ExtractionConfig,
) -> Result<PageStream, ExtractError> {
    let mut tmp = tempfile::NamedTempFile::new()
        .map_err(|e| ExtractError::Internal(format!("tempfile: {e}")))?;
    tmp.write_all(bytes)
        .map_err(|e| ExtractError::Internal(format!("tempfile write: {e}")))?;
    let path = tmp.path().to_string_lossy().to_string();
    // Keep `tmp` alive for the duration of this call; the stream is fully
    // materialised (pages rendered + encoded) before we return, so it is safe
    // to drop the tempfile here.
    let stream = extract_stream(&path, config).await?;
    drop(tmp);
    Ok(stream)
}
