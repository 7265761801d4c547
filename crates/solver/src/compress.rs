//! Payload size fitting.
//!
//! A batch of base64 images must fit under a hard transport limit. When it
//! doesn't, every image is re-encoded at progressively smaller tiers until
//! the batch fits or the attempts run out.

use std::io::Cursor;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::future::join_all;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::GenericImageView;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::CompressionConfig;
use crate::store::ImageId;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionTier {
    pub max_width: u32,
    pub max_height: u32,
    /// JPEG quality in `0.0..=1.0`.
    pub quality: f32,
}

pub const COMPRESSION_TIERS: [CompressionTier; 3] = [
    CompressionTier {
        max_width: 1600,
        max_height: 900,
        quality: 0.7,
    },
    CompressionTier {
        max_width: 1200,
        max_height: 675,
        quality: 0.6,
    },
    CompressionTier {
        max_width: 800,
        max_height: 450,
        quality: 0.5,
    },
];

/// Tier for a 1-based attempt number. Attempts past the ladder reuse the
/// last tier.
pub fn tier_for_attempt(attempt: usize) -> CompressionTier {
    let index = attempt.saturating_sub(1).min(COMPRESSION_TIERS.len() - 1);
    COMPRESSION_TIERS[index]
}

/// One image ready for the request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub id: ImageId,
    pub mime: &'static str,
    /// Base64, no data-URI prefix.
    pub data: String,
}

impl EncodedImage {
    pub fn png(id: ImageId, data: String) -> Self {
        Self { id, mime: "image/png", data }
    }

    /// Decoded size implied by the base64 length.
    pub fn estimated_size(&self) -> usize {
        (self.data.len() * 3).div_ceil(4)
    }
}

pub fn payload_size(images: &[EncodedImage]) -> usize {
    images.iter().map(EncodedImage::estimated_size).sum()
}

#[derive(Debug, Error)]
pub enum CompressError {
    #[error("could not decode image: {0}")]
    Decode(String),
    #[error("could not encode image: {0}")]
    Encode(String),
    #[error("compression task failed: {0}")]
    Task(String),
}

/// Re-encodes a single image at a tier.
#[async_trait]
pub trait ImageCompressor: Send + Sync {
    async fn compress(
        &self,
        image: &EncodedImage,
        tier: CompressionTier,
    ) -> Result<EncodedImage, CompressError>;
}

#[derive(Debug, Clone, Copy)]
pub struct CompressionLimits {
    pub limit_bytes: usize,
    pub max_attempts: usize,
}

impl Default for CompressionLimits {
    fn default() -> Self {
        Self {
            limit_bytes: 4 * 1024 * 1024,
            max_attempts: 3,
        }
    }
}

impl From<&CompressionConfig> for CompressionLimits {
    fn from(config: &CompressionConfig) -> Self {
        Self {
            limit_bytes: config.payload_limit_bytes,
            max_attempts: config.max_attempts,
        }
    }
}

#[derive(Debug)]
pub enum FitOutcome {
    Fitted {
        images: Vec<EncodedImage>,
        attempts: usize,
        size: usize,
    },
    TooLarge {
        attempts: usize,
        size: usize,
    },
}

impl FitOutcome {
    pub const TOO_LARGE_MESSAGE: &'static str =
        "Images are too large. Please try taking smaller screenshots or reduce the number of images.";

    pub fn attempts(&self) -> usize {
        match self {
            Self::Fitted { attempts, .. } | Self::TooLarge { attempts, .. } => *attempts,
        }
    }
}

/// Shrink `images` until their combined size is within `limits.limit_bytes`.
///
/// Each attempt re-encodes the original images at the attempt's tier, all
/// images concurrently. An image whose compression fails keeps its previous
/// encoding for that round.
pub async fn fit_to_limit(
    images: Vec<EncodedImage>,
    limits: CompressionLimits,
    compressor: &dyn ImageCompressor,
) -> FitOutcome {
    let mut size = payload_size(&images);
    if size <= limits.limit_bytes {
        return FitOutcome::Fitted {
            images,
            attempts: 0,
            size,
        };
    }

    let originals = images;
    let mut current = originals.clone();
    let mut attempts = 0;

    while size > limits.limit_bytes && attempts < limits.max_attempts {
        attempts += 1;
        let tier = tier_for_attempt(attempts);
        debug!(attempts, size, ?tier, "Compressing screenshots");

        let results =
            join_all(originals.iter().map(|image| compressor.compress(image, tier))).await;
        current = results
            .into_iter()
            .zip(current)
            .map(|(result, previous)| match result {
                Ok(compressed) => compressed,
                Err(e) => {
                    warn!(id = %previous.id, "Image compression failed on attempt {attempts}: {e}");
                    previous
                }
            })
            .collect();
        size = payload_size(&current);
    }

    if size <= limits.limit_bytes {
        info!(attempts, size, "Screenshots compressed within payload limit");
        FitOutcome::Fitted {
            images: current,
            attempts,
            size,
        }
    } else {
        error!(
            "Failed to compress screenshots to acceptable size after {attempts} attempts. \
             Final size: {:.2}MB",
            size as f64 / 1024.0 / 1024.0
        );
        FitOutcome::TooLarge { attempts, size }
    }
}

/// Downscale and JPEG re-encode with the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct RasterCompressor;

#[async_trait]
impl ImageCompressor for RasterCompressor {
    async fn compress(
        &self,
        image: &EncodedImage,
        tier: CompressionTier,
    ) -> Result<EncodedImage, CompressError> {
        let id = image.id;
        let data = image.data.clone();
        let data = tokio::task::spawn_blocking(move || recompress(&data, tier))
            .await
            .map_err(|e| CompressError::Task(e.to_string()))??;
        Ok(EncodedImage {
            id,
            mime: "image/jpeg",
            data,
        })
    }
}

/// Fit within the tier's box (aspect preserved, never upscaled) and encode as
/// JPEG at the tier's quality.
pub fn recompress(base64_data: &str, tier: CompressionTier) -> Result<String, CompressError> {
    let bytes = STANDARD
        .decode(base64_data)
        .map_err(|e| CompressError::Decode(e.to_string()))?;
    let mut img =
        image::load_from_memory(&bytes).map_err(|e| CompressError::Decode(e.to_string()))?;

    let (width, height) = img.dimensions();
    if width > tier.max_width || height > tier.max_height {
        img = img.resize(tier.max_width, tier.max_height, FilterType::Triangle);
    }

    // JPEG has no alpha channel.
    let rgb = img.to_rgb8();
    let quality = (tier.quality * 100.0).round().clamp(1.0, 100.0) as u8;
    let mut buf = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode_image(&rgb)
        .map_err(|e| CompressError::Encode(e.to_string()))?;

    Ok(STANDARD.encode(buf.into_inner()))
}
