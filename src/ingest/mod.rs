//! Frame ingestion sources.
//!
//! - USB/V4L2 cameras (real devices need feature `ingest-v4l2`)
//! - Synthetic `stub://` cameras (dry runs, tests)
//! - Image directories replayed in name order
//!
//! Every source yields RGB24 `Frame`s. Device-specific pixel formats are
//! normalized here, before frames reach the detector.

pub mod images;
pub mod normalize;
pub mod v4l2;

pub use images::ImageDirSource;
pub use normalize::{normalize_to_rgb, PixelFormat};
pub use v4l2::{V4l2Config, V4l2Source};

use anyhow::Result;

use crate::config::{CameraSettings, SourceKind};
use crate::frame::FrameSource;

/// Build the frame source selected by `camera.kind`. The source is not
/// connected yet.
pub fn open_source(camera: &CameraSettings) -> Result<Box<dyn FrameSource>> {
    match camera.kind {
        SourceKind::V4l2 => Ok(Box::new(V4l2Source::new(V4l2Config::from(camera))?)),
        SourceKind::Images => Ok(Box::new(ImageDirSource::new(&camera.device))),
    }
}
