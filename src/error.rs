//! Error types for the medbill-extract library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ExtractError`] — **Fatal**: the extraction cannot proceed at all
//!   (bad input file, unsupported document type, provider not configured).
//!   Returned as `Err(ExtractError)` from the top-level `extract*` functions.
//!
//! * [`PageError`] — **Non-fatal**: a single page failed (render glitch,
//!   transient API error, unrepairable payload) but all other pages are fine.
//!   Stored inside [`crate::output::PageExtraction`] so callers can inspect
//!   partial success rather than losing the whole bill to one bad page.
//!
//! The separation lets callers decide their own tolerance: abort on the first
//! page failure, log and continue, or collect all errors for a post-run report.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the medbill-extract library.
///
/// Page-level failures use [`PageError`] and are stored in
/// [`crate::output::PageExtraction`] rather than propagated here.
#[derive(Debug, Error)]
pub enum ExtractError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Document not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is neither a PDF nor a supported image.
    #[error("Unsupported document type for '{path}': expected PDF, PNG, or JPEG\nFirst bytes: {magic:?}")]
    UnsupportedDocument { path: PathBuf, magic: [u8; 4] },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}\nTry repairing with: qpdf --decrypt input.pdf output.pdf")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// Selected page numbers exceed the actual page count.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    /// Rasterisation of a specific page failed fatally.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// A standalone image file could not be decoded.
    #[error("Failed to decode image '{path}': {detail}")]
    ImageDecodeFailed { path: PathBuf, detail: String },

    // ── Model errors ──────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("VLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Every page failed after all retries; output would be empty.
    #[error("All {total} pages failed after {retries} retries each.\nFirst error: {first_error}")]
    AllPagesFailed {
        total: usize,
        retries: u32,
        first_error: String,
    },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output JSON file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single page.
///
/// Stored alongside [`crate::output::PageExtraction`] when a page fails.
/// The overall extraction continues unless ALL pages fail.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// Page rasterisation failed.
    #[error("Page {page}: rasterisation failed: {detail}")]
    RenderFailed { page: usize, detail: String },

    /// VLM call failed after retries.
    #[error("Page {page}: VLM call failed after {retries} retries: {detail}")]
    ModelFailed {
        page: usize,
        retries: u8,
        detail: String,
    },

    /// VLM call timed out.
    #[error("Page {page}: VLM call timed out after {secs}s")]
    Timeout { page: usize, secs: u64 },

    /// Model output could not be parsed as an item payload even after repair.
    #[error("Page {page}: model returned an unrepairable payload: {detail}")]
    MalformedPayload { page: usize, detail: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_pages_failed_display() {
        let e = ExtractError::AllPagesFailed {
            total: 4,
            retries: 3,
            first_error: "HTTP 503".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("All 4 pages"), "got: {msg}");
        assert!(msg.contains("HTTP 503"));
    }

    #[test]
    fn unsupported_document_display() {
        let e = ExtractError::UnsupportedDocument {
            path: PathBuf::from("scan.tiff"),
            magic: [0x49, 0x49, 0x2A, 0x00],
        };
        assert!(e.to_string().contains("scan.tiff"));
        assert!(e.to_string().contains("PDF, PNG, or JPEG"));
    }

    #[test]
    fn page_out_of_range_display() {
        let e = ExtractError::PageOutOfRange { page: 7, total: 3 };
        assert!(e.to_string().contains("Page 7"));
        assert!(e.to_string().contains("3 pages"));
    }

    #[test]
    fn malformed_payload_display() {
        let e = PageError::MalformedPayload {
            page: 2,
            detail: "expected value at line 1".into(),
        };
        assert!(e.to_string().contains("Page 2"));
        assert!(e.to_string().contains("unrepairable"));
    }

    #[test]
    fn timeout_display() {
        let e = PageError::Timeout { page: 1, secs: 60 };
        assert!(e.to_string().contains("60s"));
    }
}
