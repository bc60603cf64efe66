//! Input resolution: normalise a user-supplied path or URL to a local file
//! and decide whether it is a PDF or a standalone image.
//!
//! ## Why download to a temp file?
//!
//! pdfium requires a file-system path — it cannot stream from a byte buffer.
//! Downloading to a `TempDir` gives us a path pdfium can open while ensuring
//! cleanup happens automatically when `ResolvedInput` is dropped, even if
//! the process panics. The document kind is sniffed from magic bytes (with
//! the HTTP `content-type` as a tie-breaker) before returning, so callers
//! get a meaningful error rather than a pdfium crash on a TIFF.

use crate::error::ExtractError;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// What kind of document the input turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    /// A PDF; pages are rasterised via pdfium.
    Pdf,
    /// A single-page raster image (PNG or JPEG).
    Image,
}

/// The resolved input — either a local path or a downloaded temp file.
#[derive(Debug)]
pub enum ResolvedInput {
    /// Input was already a local file.
    Local { path: PathBuf, kind: DocumentKind },
    /// Input was a URL; document downloaded to a temp directory.
    /// The `TempDir` is kept alive to prevent cleanup until processing completes.
    Downloaded {
        path: PathBuf,
        kind: DocumentKind,
        _temp_dir: TempDir,
    },
}

impl ResolvedInput {
    /// Get the path to the document regardless of how it was resolved.
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local { path, .. } => path,
            ResolvedInput::Downloaded { path, .. } => path,
        }
    }

    /// Get the sniffed document kind.
    pub fn kind(&self) -> DocumentKind {
        match self {
            ResolvedInput::Local { kind, .. } => *kind,
            ResolvedInput::Downloaded { kind, .. } => *kind,
        }
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Sniff the document kind from the first bytes of the file.
///
/// PNG and JPEG signatures are unambiguous; `%PDF` may be preceded by junk
/// bytes in the wild but pdfium tolerates that, so we only check the prefix.
pub fn sniff_kind(magic: &[u8]) -> Option<DocumentKind> {
    if magic.starts_with(b"%PDF") {
        Some(DocumentKind::Pdf)
    } else if magic.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some(DocumentKind::Image)
    } else if magic.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(DocumentKind::Image)
    } else {
        None
    }
}

/// Resolve the input string to a local document path + kind.
///
/// If the input is a URL, download it to a temporary directory.
/// If the input is a local file, validate it exists and is readable.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedInput, ExtractError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        resolve_local(input)
    }
}

/// Resolve a local file path, validating existence and magic bytes.
fn resolve_local(path_str: &str) -> Result<ResolvedInput, ExtractError> {
    let path = PathBuf::from(path_str);

    if !path.exists() {
        return Err(ExtractError::FileNotFound { path });
    }

    let kind = match std::fs::File::open(&path) {
        Ok(mut f) => {
            use std::io::Read;
            let mut magic = [0u8; 4];
            if f.read_exact(&mut magic).is_err() {
                return Err(ExtractError::UnsupportedDocument { path, magic: [0; 4] });
            }
            match sniff_kind(&magic) {
                Some(kind) => kind,
                None => return Err(ExtractError::UnsupportedDocument { path, magic }),
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(ExtractError::PermissionDenied { path });
        }
        Err(_) => {
            return Err(ExtractError::FileNotFound { path });
        }
    };

    debug!("Resolved local {:?} document: {}", kind, path.display());
    Ok(ResolvedInput::Local { path, kind })
}

/// Download a URL to a temporary directory and return the path + kind.
async fn download_url(url: &str, timeout_secs: u64) -> Result<ResolvedInput, ExtractError> {
    info!("Downloading document from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| ExtractError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            ExtractError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            ExtractError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(ExtractError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_lowercase();

    let filename = extract_filename(url, &content_type);

    let temp_dir = TempDir::new().map_err(|e| ExtractError::Internal(e.to_string()))?;
    let file_path = temp_dir.path().join(&filename);

    let bytes = response
        .bytes()
        .await
        .map_err(|e| ExtractError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    tokio::fs::write(&file_path, &bytes)
        .await
        .map_err(|e| ExtractError::Internal(format!("Failed to write temp file: {}", e)))?;

    // Magic bytes decide the kind; content-type only breaks ambiguity when
    // the body is too short to sniff.
    let kind = if bytes.len() >= 4 {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[..4]);
        match sniff_kind(&magic) {
            Some(kind) => kind,
            None => match kind_from_content_type(&content_type) {
                Some(kind) => kind,
                None => {
                    return Err(ExtractError::UnsupportedDocument {
                        path: file_path,
                        magic,
                    })
                }
            },
        }
    } else {
        return Err(ExtractError::UnsupportedDocument {
            path: file_path,
            magic: [0; 4],
        });
    };

    info!("Downloaded {:?} document to: {}", kind, file_path.display());

    Ok(ResolvedInput::Downloaded {
        path: file_path,
        kind,
        _temp_dir: temp_dir,
    })
}

/// Map an HTTP content-type to a document kind.
fn kind_from_content_type(content_type: &str) -> Option<DocumentKind> {
    if content_type.contains("pdf") {
        Some(DocumentKind::Pdf)
    } else if content_type.contains("png")
        || content_type.contains("jpeg")
        || content_type.contains("jpg")
    {
        Some(DocumentKind::Image)
    } else {
        None
    }
}

/// Pick a filename with a sensible extension from the URL or content-type.
fn extract_filename(url: &str, content_type: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }

    match kind_from_content_type(content_type) {
        Some(DocumentKind::Pdf) => "downloaded.pdf".to_string(),
        Some(DocumentKind::Image) => "downloaded.png".to_string(),
        None => "downloaded.bin".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/bill.pdf"));
        assert!(is_url("http://example.com/bill.pdf"));
        assert!(!is_url("/tmp/bill.pdf"));
        assert!(!is_url("bill.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn test_sniff_kind() {
        assert_eq!(sniff_kind(b"%PDF-1.7"), Some(DocumentKind::Pdf));
        assert_eq!(
            sniff_kind(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A]),
            Some(DocumentKind::Image)
        );
        assert_eq!(
            sniff_kind(&[0xFF, 0xD8, 0xFF, 0xE0]),
            Some(DocumentKind::Image)
        );
        assert_eq!(sniff_kind(b"GIF8"), None);
        assert_eq!(sniff_kind(b""), None);
    }

    #[test]
    fn test_kind_from_content_type() {
        assert_eq!(
            kind_from_content_type("application/pdf"),
            Some(DocumentKind::Pdf)
        );
        assert_eq!(
            kind_from_content_type("image/jpeg; charset=binary"),
            Some(DocumentKind::Image)
        );
        assert_eq!(kind_from_content_type("text/html"), None);
    }

    #[test]
    fn test_extract_filename_from_url() {
        assert_eq!(
            extract_filename("https://host/files/bill.pdf?sig=abc", "application/pdf"),
            "bill.pdf"
        );
        assert_eq!(
            extract_filename("https://host/download", "image/png"),
            "downloaded.png"
        );
        assert_eq!(extract_filename("https://host/x", "text/plain"), "downloaded.bin");
    }

    #[test]
    fn resolve_local_rejects_unknown_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bill.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"hello world").unwrap();

        let err = resolve_local(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedDocument { .. }));
    }

    #[test]
    fn resolve_local_accepts_pdf_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bill.pdf");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"%PDF-1.4 fake body").unwrap();

        let resolved = resolve_local(path.to_str().unwrap()).unwrap();
        assert_eq!(resolved.kind(), DocumentKind::Pdf);
        assert_eq!(resolved.path(), path);
    }

    #[test]
    fn resolve_local_missing_file() {
        let err = resolve_local("/definitely/not/here.pdf").unwrap_err();
        assert!(matches!(err, ExtractError::FileNotFound { .. }));
    }
}
