//! Image encoding: `DynamicImage` → base64 PNG wrapped in `ImageData`.
//!
//! VLM APIs (OpenAI, Anthropic, Gemini) accept images as base64 data-URIs
//! embedded in the JSON request body. PNG is chosen over JPEG because it is
//! lossless — the crispness of small printed digits matters far more than
//! file size when amounts must be copied exactly. `detail: "high"` instructs
//! GPT-4-class models to use the full image tile budget; without it the fine
//! print of itemised tables is lost.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a rasterised bill page as a base64 PNG ready for the VLM API.
pub fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded image → {} bytes base64", b64.len());

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}
