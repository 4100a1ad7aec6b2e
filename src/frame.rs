//! Frames and the frame source contract.
//!
//! - `Frame`: one RGB24 image with its capture instant and sequence number.
//! - `FrameSource`: anything that yields frames on demand (V4L2 devices,
//!   image directories, synthetic `stub://` devices).
//!
//! A source may fail transiently (`FrameError::Unavailable`). The tick loop
//! never hands a missing frame to the detector.

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::time::Instant;

use crate::error::FrameError;

/// One captured RGB24 image.
pub struct Frame {
    image: RgbImage,
    pub width: u32,
    pub height: u32,
    /// Monotonic capture instant.
    pub captured_at: Instant,
    /// Per-source frame counter, starting at 1.
    pub sequence: u64,
}

impl Frame {
    /// Build a frame from tightly packed RGB24 pixels.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("frame buffer too small for {}x{}", width, height))?;
        Ok(Self::from_image(image, sequence))
    }

    /// Build a frame from a decoded image.
    pub fn from_image(image: RgbImage, sequence: u64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            image,
            width,
            height,
            captured_at: Instant::now(),
            sequence,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    /// Image view for resizing and encoding.
    pub fn as_image(&self) -> &RgbImage {
        &self.image
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Statistics for a frame source.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub frames_missed: u64,
    /// Device path or directory the frames come from.
    pub origin: String,
}

/// Frame source trait.
pub trait FrameSource {
    /// Open the underlying device. Failures here are fatal at startup.
    fn connect(&mut self) -> Result<()>;

    /// Capture the next frame.
    fn next_frame(&mut self) -> std::result::Result<Frame, FrameError>;

    /// Check if the source is healthy.
    fn is_healthy(&self) -> bool;

    /// Get frame statistics.
    fn stats(&self) -> SourceStats;
}
