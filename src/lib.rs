//! # medbill-extract
//!
//! Extract structured line items from medical bills (PDF or image) using
//! Vision Language Models (VLMs).
//!
//! ## Why this crate?
//!
//! Hospital bills are the worst case for classical OCR: dot-matrix pharmacy
//! receipts, multi-column charge tables, handwritten annotations, and a
//! different layout per hospital. Template-based extractors break on every
//! new format. Instead this crate rasterises each page into a PNG and lets a
//! VLM read it as a human billing clerk would, then repairs and normalises
//! the model's JSON into a clean, deduplicated list of line items.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF / image
//!  │
//!  ├─ 1. Input    resolve local file or download from URL, sniff kind
//!  ├─ 2. Render   rasterise pages via pdfium (CPU-bound, spawn_blocking)
//!  ├─ 3. Encode   PNG → base64 ImageData
//!  ├─ 4. VLM      concurrent calls to gpt-4.1-mini / claude / gemini / …
//!  ├─ 5. Repair   self-heal malformed JSON (fences, truncation, literals)
//!  └─ 6. Flatten  merge groups, split totals, classify pages, deduplicate
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use medbill_extract::{extract, ExtractionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = ExtractionConfig::default();
//!     let output = extract("bill.pdf", &config).await?;
//!     for item in &output.items {
//!         println!("{:?}: {:?}", item.description, item.amount);
//!     }
//!     eprintln!("tokens: {} in / {} out",
//!         output.stats.total_input_tokens,
//!         output.stats.total_output_tokens);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature  | Default | Description |
//! |----------|---------|-------------|
//! | `cli`    | on      | Enables the `medbill` binary (clap + anyhow + tracing-subscriber) |
//! | `server` | on      | Enables the axum HTTP API ([`server`]) |
//!
//! Disable both when using only the library to avoid pulling in their deps:
//! ```toml
//! medbill-extract = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod extract;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
#[cfg(feature = "server")]
pub mod server;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ExtractionConfig, ExtractionConfigBuilder, PageSelection};
pub use error::{ExtractError, PageError};
pub use extract::{extract, extract_from_bytes, extract_sync, extract_to_file};
pub use output::{
    ExtractData, ExtractResponse, ExtractionOutput, ExtractionStats, LineItem, PageExtraction,
    PageType, PagewiseItems, TokenUsage,
};
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use stream::{extract_stream, extract_stream_from_bytes};
