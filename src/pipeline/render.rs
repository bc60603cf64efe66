//! Rasterisation: render PDF pages to `DynamicImage` via pdfium, or load a
//! standalone bill image.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async contexts.
//! `tokio::task::spawn_blocking` moves the work onto a dedicated thread pool
//! thread designed for blocking operations, preventing the Tokio worker
//! threads from stalling during CPU-heavy rendering. Image decoding gets the
//! same treatment: a 300-DPI A4 scan decodes in tens of milliseconds, long
//! enough to stall an async worker.
//!
//! ## Why cap pixels, not DPI?
//!
//! Scan sizes vary wildly. `max_rendered_pixels` caps the longest edge
//! regardless of physical size, keeping memory bounded and matching the
//! image-size sweet spot for vision models (around 1,024–2,048 px).

use crate::config::ExtractionConfig;
use crate::error::ExtractError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::Path;
use tracing::{debug, info, warn};

/// Rasterise selected pages of a PDF into images.
///
/// This runs inside `spawn_blocking` since pdfium operations are CPU-bound.
///
/// # Returns
/// A vector of `(page_index_0based, DynamicImage)` tuples.
pub async fn render_pages(
    pdf_path: &Path,
    config: &ExtractionConfig,
    page_indices: &[usize],
) -> Result<Vec<(usize, DynamicImage)>, ExtractError> {
    let path = pdf_path.to_path_buf();
    let dpi = config.dpi;
    let max_pixels = config.max_rendered_pixels;
    let password = config.password.clone();
    let indices = page_indices.to_vec();

    tokio::task::spawn_blocking(move || {
        render_pages_blocking(&path, dpi, max_pixels, password.as_deref(), &indices)
    })
    .await
    .map_err(|e| ExtractError::Internal(format!("Render task panicked: {}", e)))?
}

/// Count the pages of a PDF without rendering anything.
pub async fn page_count(
    pdf_path: &Path,
    password: Option<&str>,
) -> Result<usize, ExtractError> {
    let path = pdf_path.to_path_buf();
    let pwd = password.map(|s| s.to_string());

    tokio::task::spawn_blocking(move || {
        let pdfium = Pdfium::default();
        let document = pdfium
            .load_pdf_from_file(&path, pwd.as_deref())
            .map_err(|e| map_open_error(&path, pwd.as_deref(), e))?;
        Ok(document.pages().len() as usize)
    })
    .await
    .map_err(|e| ExtractError::Internal(format!("Page-count task panicked: {}", e)))?
}

/// Load a standalone bill image (PNG/JPEG) as page 1.
///
/// Oversized scans are downscaled so the longest edge fits
/// `max_rendered_pixels`, matching the cap applied to PDF renders.
pub async fn load_image(
    image_path: &Path,
    config: &ExtractionConfig,
) -> Result<Vec<(usize, DynamicImage)>, ExtractError> {
    let path = image_path.to_path_buf();
    let max_pixels = config.max_rendered_pixels;

    tokio::task::spawn_blocking(move || {
        let img = image::ImageReader::open(&path)
            .map_err(|e| ExtractError::ImageDecodeFailed {
                path: path.clone(),
                detail: e.to_string(),
            })?
            .decode()
            .map_err(|e| ExtractError::ImageDecodeFailed {
                path: path.clone(),
                detail: e.to_string(),
            })?;

        let img = if img.width() > max_pixels || img.height() > max_pixels {
            debug!(
                "Downscaling {}x{} image to fit {} px",
                img.width(),
                img.height(),
                max_pixels
            );
            img.resize(max_pixels, max_pixels, image::imageops::FilterType::Triangle)
        } else {
            img
        };

        debug!("Loaded image page → {}x{} px", img.width(), img.height());
        Ok(vec![(0usize, img)])
    })
    .await
    .map_err(|e| ExtractError::Internal(format!("Image decode task panicked: {}", e)))?
}

/// Blocking implementation of page rendering.
fn render_pages_blocking(
    pdf_path: &Path,
    dpi: u32,
    max_pixels: u32,
    password: Option<&str>,
    page_indices: &[usize],
) -> Result<Vec<(usize, DynamicImage)>, ExtractError> {
    let pdfium = Pdfium::default();

    let document = pdfium
        .load_pdf_from_file(pdf_path, password)
        .map_err(|e| map_open_error(pdf_path, password, e))?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    info!("PDF loaded: {} pages", total_pages);

    // Target width from DPI assuming A4 (8.27 in), capped so an oversized
    // page can never blow past the pixel limit.
    let target_width = ((dpi as f32 * 8.27) as u32).min(max_pixels);
    let render_config = PdfRenderConfig::new()
        .set_target_width(target_width as i32)
        .set_maximum_height(max_pixels as i32);

    let mut results = Vec::with_capacity(page_indices.len());

    for &idx in page_indices {
        if idx >= total_pages {
            warn!(
                "Skipping page {} (out of range, total={})",
                idx + 1,
                total_pages
            );
            continue;
        }

        let page = pages
            .get(idx as u16)
            .map_err(|e| ExtractError::RasterisationFailed {
                page: idx + 1,
                detail: format!("{:?}", e),
            })?;

        let bitmap = page.render_with_config(&render_config).map_err(|e| {
            ExtractError::RasterisationFailed {
                page: idx + 1,
                detail: format!("{:?}", e),
            }
        })?;

        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );

        results.push((idx, image));
    }

    Ok(results)
}

/// Map a pdfium open error onto the password / corruption error variants.
fn map_open_error(path: &Path, password: Option<&str>, e: PdfiumError) -> ExtractError {
    let err_str = format!("{:?}", e);
    if err_str.contains("Password") || err_str.contains("password") {
        if password.is_some() {
            ExtractError::WrongPassword {
                path: path.to_path_buf(),
            }
        } else {
            ExtractError::PasswordRequired {
                path: path.to_path_buf(),
            }
        }
    } else {
        ExtractError::CorruptPdf {
            path: path.to_path_buf(),
            detail: err_str,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_image_decodes_png() {
        use image::{Rgba, RgbaImage};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.png");
        RgbaImage::from_pixel(20, 30, Rgba([255, 255, 255, 255]))
            .save(&path)
            .unwrap();

        let config = ExtractionConfig::default();
        let pages = load_image(&path, &config).await.unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].0, 0);
        assert_eq!(pages[0].1.width(), 20);
    }

    #[tokio::test]
    async fn load_image_downscales_to_cap() {
        use image::{Rgba, RgbaImage};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.png");
        RgbaImage::from_pixel(400, 200, Rgba([0, 0, 0, 255]))
            .save(&path)
            .unwrap();

        let config = ExtractionConfig::builder()
            .max_rendered_pixels(100)
            .build()
            .unwrap();
        let pages = load_image(&path, &config).await.unwrap();
        let img = &pages[0].1;
        assert!(img.width() <= 100 && img.height() <= 100);
        // Aspect ratio preserved: 400x200 → 100x50.
        assert_eq!(img.height(), 50);
    }

    #[tokio::test]
    async fn load_image_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not an image at all").unwrap();

        let config = ExtractionConfig::default();
        let err = load_image(&path, &config).await.unwrap_err();
        assert!(matches!(err, ExtractError::ImageDecodeFailed { .. }));
    }
}
