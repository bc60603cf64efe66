//! Eager (full-document) extraction entry points.
//!
//! ## Why eager vs. streaming?
//!
//! This module provides the simpler API: wait for all pages, then return.
//! It collects every [`PageExtraction`] into memory, flattens and
//! deduplicates the line items, and returns the assembled result. Use
//! [`crate::stream::extract_stream`] instead when you want pages
//! progressively or need to limit peak memory use on documents with
//! hundreds of pages.

use crate::config::ExtractionConfig;
use crate::error::{ExtractError, PageError};
use crate::output::{ExtractionOutput, ExtractionStats, PageExtraction};
use crate::pipeline::input::DocumentKind;
use crate::pipeline::{encode, flatten, input, model, render, repair};
use edgequake_llm::{LLMProvider, ProviderFactory};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Model used when the caller names neither a model nor a provider.
const DEFAULT_MODEL: &str = "gpt-4.1-mini";

/// Extract line items from a bill document (PDF or image), given as a local
/// path or HTTP/HTTPS URL.
///
/// This is the primary entry point for the library.
///
/// # Returns
/// `Ok(ExtractionOutput)` on success, even if some pages failed
/// (check `output.stats.failed_pages`).
///
/// # Errors
/// Returns `Err(ExtractError)` only for fatal errors:
/// - File not found / permission denied / download failure
/// - Not a valid PDF or supported image
/// - All pages failed and no output produced
pub async fn extract(
    input_str: impl AsRef<str>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, ExtractError> {
    let total_start = Instant::now();
    let input_str = input_str.as_ref();
    info!("Starting extraction: {}", input_str);

    // ── Step 1: Resolve input ────────────────────────────────────────────
    let resolved = input::resolve_input(input_str, config.download_timeout_secs).await?;
    let doc_path = resolved.path().to_path_buf();
    let kind = resolved.kind();

    // ── Step 2: Get/create provider ──────────────────────────────────────
    let provider = resolve_provider(config).await?;

    // ── Step 3: Page count and selection ─────────────────────────────────
    let (total_pages, page_indices) = match kind {
        DocumentKind::Pdf => {
            let total = render::page_count(&doc_path, config.password.as_deref()).await?;
            info!("PDF has {} pages", total);
            let indices = config.pages.to_indices(total);
            if indices.is_empty() {
                return Err(ExtractError::PageOutOfRange {
                    page: config.pages.first_requested(),
                    total,
                });
            }
            (total, indices)
        }
        // A standalone image is always a single page 1.
        DocumentKind::Image => (1, vec![0usize]),
    };
    debug!("Selected {} pages for extraction", page_indices.len());

    // Fire on_conversion_start now that we know how many pages will actually
    // be processed (page_indices.len()), not the full document page count.
    if let Some(ref cb) = config.progress_callback {
        cb.on_conversion_start(page_indices.len());
    }

    // ── Step 4: Rasterise pages ──────────────────────────────────────────
    let render_start = Instant::now();
    let rendered = match kind {
        DocumentKind::Pdf => render::render_pages(&doc_path, config, &page_indices).await?,
        DocumentKind::Image => render::load_image(&doc_path, config).await?,
    };
    let render_duration_ms = render_start.elapsed().as_millis() as u64;
    info!(
        "Rendered {} pages in {}ms",
        rendered.len(),
        render_duration_ms
    );

    // ── Step 5: Encode images to base64 ──────────────────────────────────
    // A page whose PNG encode fails still gets a (failed) entry in the
    // output, so stats and failed_pages account for every selected page.
    let mut encode_failures: Vec<PageExtraction> = Vec::new();
    let encoded: Vec<(usize, _)> = rendered
        .iter()
        .filter_map(|(idx, img)| match encode::encode_page(img) {
            Ok(data) => Some((*idx, data)),
            Err(e) => {
                warn!("Failed to encode page {}: {}", idx + 1, e);
                encode_failures.push(encode_failure_page(*idx, &e.to_string()));
                None
            }
        })
        .collect();

    // ── Step 6: Process pages through VLM and parse payloads ─────────────
    let model_start = Instant::now();
    let mut pages = process_concurrent(&provider, &encoded, config).await;
    let model_duration_ms = model_start.elapsed().as_millis() as u64;
    pages.append(&mut encode_failures);

    // Sort by page number for consistent output
    pages.sort_by_key(|p| p.page_num);

    // ── Step 7: Flatten and deduplicate across the document ──────────────
    let items = flatten::dedup_items(
        pages
            .iter()
            .filter(|p| p.error.is_none())
            .map(|p| p.items.as_slice()),
    );

    // ── Step 8: Compute stats ────────────────────────────────────────────
    let processed = pages.iter().filter(|p| p.error.is_none()).count();
    let failed = pages.iter().filter(|p| p.error.is_some()).count();
    let repaired = pages.iter().filter(|p| p.repaired).count();

    if processed == 0 {
        let first_error = pages
            .iter()
            .find_map(|p| p.error.as_ref())
            .map(|e| format!("{}", e))
            .unwrap_or_else(|| "Unknown error".to_string());

        return Err(ExtractError::AllPagesFailed {
            total: pages.len(),
            retries: config.max_retries,
            first_error,
        });
    }

    let stats = ExtractionStats {
        total_pages,
        processed_pages: processed,
        failed_pages: failed,
        repaired_pages: repaired,
        total_input_tokens: pages.iter().map(|p| p.input_tokens).sum(),
        total_output_tokens: pages.iter().map(|p| p.output_tokens).sum(),
        total_duration_ms: total_start.elapsed().as_millis() as u64,
        render_duration_ms,
        model_duration_ms,
    };

    info!(
        "Extraction complete: {}/{} pages, {} items, {}ms total",
        processed,
        total_pages,
        items.len(),
        stats.total_duration_ms
    );

    // Fire on_conversion_complete with the count of selected pages, not the
    // full document page count, to match what on_conversion_start received.
    if let Some(ref cb) = config.progress_callback {
        cb.on_conversion_complete(page_indices.len(), processed);
    }

    Ok(ExtractionOutput {
        pages,
        items,
        stats,
    })
}

/// Extract a bill and write the result as JSON directly to a file.
///
/// Uses atomic write (temp file + rename) to prevent partial files.
pub async fn extract_to_file(
    input_str: impl AsRef<str>,
    output_path: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<ExtractionStats, ExtractError> {
    let output = extract(input_str, config).await?;
    let path = output_path.as_ref();

    let json = serde_json::to_string_pretty(&output)
        .map_err(|e| ExtractError::Internal(format!("serialise output: {}", e)))?;

    // Atomic write: write to temp, then rename
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ExtractError::OutputWriteFailed {
                path: path.to_path_buf(),
                source: e,
            })?;
    }

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, &json)
        .await
        .map_err(|e| ExtractError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| ExtractError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

    Ok(output.stats)
}

/// Synchronous wrapper around [`extract`].
///
/// Creates a temporary tokio runtime internally.
pub fn extract_sync(
    input_str: impl AsRef<str>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, ExtractError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ExtractError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(extract(input_str, config))
}

/// Extract from document bytes in memory.
///
/// This avoids the need for the caller to create a temporary file — the
/// bytes are written to a managed [`tempfile`] and cleaned up automatically
/// on return or panic. The document kind (PDF vs image) is sniffed from the
/// leading bytes exactly as for file inputs.
///
/// This is the recommended API when bill data comes from a database, an
/// upload stream, or an in-memory buffer rather than a file on disk.
///
/// # Example
/// ```rust,no_run
/// use medbill_extract::{extract_from_bytes, ExtractionConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let bytes: Vec<u8> = std::fs::read("bill.pdf")?;
/// let config = ExtractionConfig::default();
/// let output = extract_from_bytes(&bytes, &config).await?;
/// println!("{} line items", output.items.len());
/// # Ok(())
/// # }
/// ```
pub async fn extract_from_bytes(
    bytes: &[u8],
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, ExtractError> {
    let mut tmp = tempfile::NamedTempFile::new()
        .map_err(|e| ExtractError::Internal(format!("tempfile: {e}")))?;
    tmp.write_all(bytes)
        .map_err(|e| ExtractError::Internal(format!("tempfile write: {e}")))?;
    let path = tmp.path().to_string_lossy().to_string();
    // `tmp` is dropped (and the file deleted) when `extract` returns
    extract(&path, config).await
}

// ── Internal helpers ─────────────────────────────────────────────────────

/// Instantiate a named provider with the given model.
fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, ExtractError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        ExtractError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the VLM provider, from most-specific to least-specific.
///
/// The four-level fallback chain lets library users and CLI users each set
/// exactly as much or as little as they need:
///
/// 1. **Pre-built provider** (`config.provider`) — the caller constructed and
///    configured the provider entirely; we use it as-is. Useful in tests or
///    when the caller needs custom middleware (caching, rate-limiting).
///
/// 2. **Named provider + model** (`config.provider_name`) — the caller named
///    a provider (e.g. `"openai"`) and optional model. We call
///    [`ProviderFactory::create_llm_provider`] which reads the corresponding
///    API key (`OPENAI_API_KEY`, etc.) from the environment.
///
/// 3. **Environment pair** (`MEDBILL_LLM_PROVIDER` + `MEDBILL_MODEL`) —
///    both env vars set means the caller chose a provider and model at the
///    execution environment level (Makefile, shell script, CI). Checked
///    before full auto-detection so the model choice is honoured even when
///    multiple API keys are present.
///
/// 4. **Full auto-detection** (`ProviderFactory::from_env`) — the factory
///    scans all known API key variables and picks the first available
///    provider. Convenient for `medbill extract bill.pdf` with no other
///    configuration.
pub(crate) async fn resolve_provider(
    config: &ExtractionConfig,
) -> Result<Arc<dyn LLMProvider>, ExtractError> {
    // 1) User-provided provider takes priority
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    // 2) Provider name + model
    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_vision_provider(name, model);
    }

    // 3) Auto-detect from environment; honour MEDBILL_LLM_PROVIDER + MEDBILL_MODEL when both set
    if let (Ok(prov), Ok(model)) = (
        std::env::var("MEDBILL_LLM_PROVIDER"),
        std::env::var("MEDBILL_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    // Prefer OpenAI explicitly when an OpenAI API key is present, so users
    // with multiple provider keys default to OpenAI unless they explicitly
    // request another provider.
    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_vision_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| ExtractError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No VLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

/// Run the VLM on all pages concurrently under the bounded fan-out, parsing
/// each raw payload as it completes.
async fn process_concurrent(
    provider: &Arc<dyn LLMProvider>,
    pages: &[(usize, edgequake_llm::ImageData)],
    config: &ExtractionConfig,
) -> Vec<PageExtraction> {
    let total_pages = pages.len();
    let page_futures: Vec<_> = pages
        .iter()
        .map(|(idx, img_data)| {
        let provider = Arc::clone(provider);
        let page_num = idx + 1;
        let img = img_data.clone();
        let config_clone = config.clone();
        async move {
            if let Some(ref cb) = config_clone.progress_callback {
                cb.on_page_start(page_num, total_pages);
            }
            let raw = model::process_page(&provider, page_num, img, &config_clone).await;
            let result = finish_page(raw);
            if let Some(ref cb) = config_clone.progress_callback {
                match &result.error {
                    None => cb.on_page_complete(page_num, total_pages, result.items.len()),
                    Some(e) => cb.on_page_error(page_num, total_pages, &e.to_string()),
                }
            }
            result
            }
        })
        .collect();
    stream::iter(page_futures)
        .buffer_unordered(config.concurrency)
        .collect()
        .await
}

/// Page result for a page that never reached the model because its
/// rendered image could not be encoded.
pub(crate) fn encode_failure_page(idx: usize, detail: &str) -> PageExtraction {
    PageExtraction {
        page_num: idx + 1,
        page_type: Default::default(),
        items: Vec::new(),
        detected_totals: BTreeMap::new(),
        input_tokens: 0,
        output_tokens: 0,
        duration_ms: 0,
        retries: 0,
        repaired: false,
        error: Some(PageError::RenderFailed {
            page: idx + 1,
            detail: format!("image encoding failed: {}", detail),
        }),
    }
}

/// Parse and flatten one raw VLM response into a [`PageExtraction`].
pub(crate) fn finish_page(raw: model::RawPage) -> PageExtraction {
    let mut page = PageExtraction {
        page_num: raw.page_num,
        page_type: Default::default(),
        items: Vec::new(),
        detected_totals: BTreeMap::new(),
        input_tokens: raw.input_tokens,
        output_tokens: raw.output_tokens,
        duration_ms: raw.duration_ms,
        retries: raw.retries,
        repaired: false,
        error: raw.error,
    };

    if page.error.is_some() {
        return page;
    }

    match repair::parse_payload(&raw.text) {
        Ok((payload, repaired)) => {
            let flat = flatten::flatten_page(&payload);
            page.page_type = flat.page_type;
            page.items = flat.items;
            page.detected_totals = flat.totals;
            page.repaired = repaired;
            if repaired {
                debug!("Page {}: payload needed JSON repair", raw.page_num);
            }
        }
        Err(detail) => {
            warn!("Page {}: unparseable payload — {}", raw.page_num, detail);
            page.error = Some(PageError::MalformedPayload {
                page: raw.page_num,
                detail,
            });
        }
    }

    page
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::PageType;

    fn raw(page_num: usize, text: &str) -> model::RawPage {
        model::RawPage {
            page_num,
            text: text.to_string(),
            input_tokens: 10,
            output_tokens: 5,
            duration_ms: 100,
            retries: 0,
            error: None,
        }
    }

    #[test]
    fn finish_page_parses_clean_payload() {
        let text = r#"{"page_type": "Pharmacy", "bill_items": [
            {"item_name": "Paracetamol", "item_quantity": 10, "item_rate": 1.25, "item_amount": 12.5}
        ], "totals": {}}"#;
        let page = finish_page(raw(1, text));
        assert!(page.error.is_none());
        assert!(!page.repaired);
        assert_eq!(page.page_type, PageType::Pharmacy);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].amount, Some(12.5));
    }

    #[test]
    fn finish_page_flags_repaired_payload() {
        let text = "```json\n{\"bill_items\": [{\"item_name\": \"ECG\", \"item_amount\": 300}]}\n```";
        let page = finish_page(raw(2, text));
        assert!(page.error.is_none());
        assert!(page.repaired);
        assert_eq!(page.items.len(), 1);
    }

    #[test]
    fn finish_page_reports_unparseable_payload() {
        let page = finish_page(raw(3, "I could not read this page, sorry."));
        assert!(matches!(
            page.error,
            Some(PageError::MalformedPayload { page: 3, .. })
        ));
        assert!(page.items.is_empty());
    }

    #[test]
    fn finish_page_passes_through_model_error() {
        let mut r = raw(4, "");
        r.error = Some(PageError::Timeout { page: 4, secs: 60 });
        let page = finish_page(r);
        assert!(matches!(page.error, Some(PageError::Timeout { .. })));
    }

    #[test]
    fn finish_page_moves_total_rows() {
        let text = r#"{"bill_items": [
            {"item_name": "Room rent", "item_amount": 4000},
            {"item_name": "Grand Total", "item_amount": 4000}
        ]}"#;
        let page = finish_page(raw(5, text));
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.detected_totals.get("Grand Total"), Some(&4000.0));
        assert_eq!(page.page_type, PageType::FinalBill);
    }

    #[test]
    fn encode_failure_becomes_failed_page() {
        let page = encode_failure_page(2, "buffer too small");
        assert_eq!(page.page_num, 3);
        assert!(page.items.is_empty());
        match page.error {
            Some(PageError::RenderFailed { page: 3, ref detail }) => {
                assert!(detail.contains("buffer too small"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
