//! Pipeline stages for bill line-item extraction.
//!
//! Each submodule implements exactly one transformation step.
//! Keeping stages separate makes each independently testable and lets us
//! swap implementations (e.g. switch rendering backend) without touching
//! other stages.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ encode ──▶ model ──▶ repair ──▶ flatten
//! (URL/path)  (pdfium)  (base64)   (VLM)    (JSON fix)  (dedupe)
//! ```
//!
//! 1. [`input`]   — canonicalise the user-supplied path or URL to a local
//!    file and sniff whether it is a PDF or a standalone image
//! 2. [`render`]  — rasterise selected pages; runs in `spawn_blocking`
//!    because pdfium is not async-safe
//! 3. [`encode`]  — PNG-encode and base64-wrap each `DynamicImage` for the
//!    multimodal API request body
//! 4. [`model`]   — drive the VLM call with retry/backoff; the only stage
//!    with network I/O
//! 5. [`repair`]  — parse the model's JSON, self-healing the malformed
//!    output VLMs routinely produce (fences, truncation, Python literals)
//! 6. [`flatten`] — merge item groups, split out totals rows, classify the
//!    page, and deduplicate items across the document

pub mod encode;
pub mod flatten;
pub mod input;
pub mod model;
pub mod render;
pub mod repair;
