//! Lossless-first image optimization.
//!
//! PNGs are re-encoded with maximum deflate compression and adaptive
//! filtering; JPEGs are re-encoded at a fixed quality. The smaller of the
//! original and the re-encoded bytes is kept, so output never grows. Anything
//! else (GIF, SVG, fonts, undecodable data) passes through untouched.

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ColorType, DynamicImage, ImageEncoder, ImageFormat};

use super::types::{Transform, TransformError};
use crate::build::FileRecord;

/// Default JPEG re-encode quality.
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Image optimize stage. Never fails.
#[derive(Debug, Clone, Copy)]
pub struct ImageOptimize {
    jpeg_quality: u8,
}

impl Default for ImageOptimize {
    fn default() -> Self {
        Self { jpeg_quality: DEFAULT_JPEG_QUALITY }
    }
}

impl ImageOptimize {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }
}

impl Transform for ImageOptimize {
    fn name(&self) -> &'static str {
        "image"
    }

    fn apply(&self, record: FileRecord) -> Result<FileRecord, TransformError> {
        let original = record.contents().len();
        match optimize_bytes(record.contents(), self.jpeg_quality) {
            Some(smaller) if smaller.len() < original => {
                tracing::debug!(
                    path = %record.relative.display(),
                    before = original,
                    after = smaller.len(),
                    "image optimized"
                );
                Ok(record.with_contents(smaller))
            }
            _ => Ok(record),
        }
    }
}

/// Re-encode recognized image data; `None` when the data is left as-is.
pub fn optimize_bytes(data: &[u8], jpeg_quality: u8) -> Option<Vec<u8>> {
    let format = image::guess_format(data).ok()?;
    match format {
        ImageFormat::Png => {
            let decoded = image::load_from_memory_with_format(data, format).ok()?;
            encode_png(&decoded)
        }
        ImageFormat::Jpeg => {
            let decoded = image::load_from_memory_with_format(data, format).ok()?;
            encode_jpeg(&decoded, jpeg_quality)
        }
        _ => None,
    }
}

fn encode_png(image: &DynamicImage) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let encoder = PngEncoder::new_with_quality(&mut out, CompressionType::Best, FilterType::Adaptive);
    encoder
        .write_image(image.as_bytes(), image.width(), image.height(), image.color())
        .ok()?;
    Some(out)
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    match image.color() {
        ColorType::L8 => encoder
            .encode(image.as_bytes(), image.width(), image.height(), ColorType::L8)
            .ok()?,
        _ => {
            let rgb = image.to_rgb8();
            encoder
                .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
                .ok()?
        }
    }
    Some(out)
}
