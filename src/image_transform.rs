use anyhow::{ensure, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, GenericImageView, ImageFormat};
use std::io::Cursor;

use crate::error::MIB;

pub const DEFAULT_MAX_SIZE_MB: f64 = 1.0;
pub const DEFAULT_MAX_WIDTH_OR_HEIGHT: u32 = 1024;

/// Each retry shrinks both sides (and JPEG quality) by this factor.
const SHRINK_STEP: f64 = 0.95;

#[derive(Clone, Debug, PartialEq)]
pub struct ImageOptions {
    /// Output size budget in MB.
    pub max_size_mb: f64,
    /// Longest side of the output, in pixels.
    pub max_width_or_height: u32,
    /// Run the transform on a worker thread instead of the caller's.
    pub use_background_thread: bool,
    /// JPEG quality (1-100) for the first attempt.
    pub initial_quality: u8,
    pub max_iterations: u32,
}

impl Default for ImageOptions {
    fn default() -> Self {
        ImageOptions {
            max_size_mb: DEFAULT_MAX_SIZE_MB,
            max_width_or_height: DEFAULT_MAX_WIDTH_OR_HEIGHT,
            use_background_thread: true,
            initial_quality: 90,
            max_iterations: 10,
        }
    }
}

impl ImageOptions {
    pub fn max_size_bytes(&self) -> u64 {
        (self.max_size_mb.max(0.0) * MIB as f64) as u64
    }
}

/// Re-encodes image bytes into a smaller image of the same media type.
pub trait ImageTransform: Send + Sync {
    fn compress(&self, input: &[u8], options: &ImageOptions) -> Result<Vec<u8>>;
}

/// Default transform backed by the `image` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImageCompressor;

impl ImageTransform for ImageCompressor {
    fn compress(&self, input: &[u8], options: &ImageOptions) -> Result<Vec<u8>> {
        compress_image(input, options)
    }
}

pub fn compress_image(input: &[u8], options: &ImageOptions) -> Result<Vec<u8>> {
    ensure!(options.max_width_or_height > 0, "max_width_or_height must be positive");

    let format = image::guess_format(input).context("Unrecognised image data")?;
    let img = image::load_from_memory_with_format(input, format)
        .context("Failed to load image from memory")?;
    let budget = options.max_size_bytes();
    let max_dim = options.max_width_or_height;

    // Resize
    let resized = img.width() > max_dim || img.height() > max_dim;
    let base = if resized {
        let new_img = img.resize(max_dim, max_dim, FilterType::Lanczos3);
        log::debug!(
            "resize {}x{} -> {}x{}",
            img.width(),
            img.height(),
            new_img.width(),
            new_img.height()
        );
        new_img
    } else {
        img
    };

    let mut quality = options.initial_quality.clamp(1, 100);
    let mut output = encode(&base, format, quality)?;
    let mut scale = 1.0;
    let mut remaining = options.max_iterations;

    while output.len() as u64 > budget && remaining > 0 {
        remaining -= 1;
        scale *= SHRINK_STEP;
        let (w, h) = base.dimensions();
        let w = ((w as f64 * scale) as u32).max(1);
        let h = ((h as f64 * scale) as u32).max(1);
        if format == ImageFormat::Jpeg {
            quality = ((quality as f64 * SHRINK_STEP) as u8).max(1);
        }

        let smaller = base.resize_exact(w, h, FilterType::Lanczos3);
        output = encode(&smaller, format, quality)?;
        log::debug!(
            "retry {}x{} q={} -> {} bytes (budget {})",
            w,
            h,
            quality,
            output.len(),
            budget
        );
        if w == 1 && h == 1 {
            break;
        }
    }

    if !resized && output.len() > input.len() {
        log::debug!(
            "re-encoded image is larger ({} > {} bytes), keeping the original",
            output.len(),
            input.len()
        );
        return Ok(input.to_vec());
    }

    Ok(output)
}

fn encode(img: &DynamicImage, format: ImageFormat, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    match format {
        ImageFormat::Jpeg => {
            let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
            let (w, h) = img.dimensions();
            if let DynamicImage::ImageLuma8(gray) = img {
                encoder.encode(gray.as_raw(), w, h, ExtendedColorType::L8)?;
            } else {
                // JPEG has no alpha channel
                let rgb = img.to_rgb8();
                encoder.encode(rgb.as_raw(), w, h, ExtendedColorType::Rgb8)?;
            }
        }
        ImageFormat::Png => {
            let encoder =
                PngEncoder::new_with_quality(&mut buffer, CompressionType::Best, PngFilter::Adaptive);
            img.write_with_encoder(encoder)?;
        }
        other => {
            img.write_to(&mut Cursor::new(&mut buffer), other)
                .with_context(|| format!("Cannot re-encode {:?} images", other))?;
        }
    }
    Ok(buffer)
}
