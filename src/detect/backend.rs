use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Detector backend trait.
///
/// `detect` is a pure function of the frame, the threshold and the loaded
/// weights. Returned boxes are in the frame's own pixel coordinates, already
/// mapped back from any resized model input.
pub trait DetectorBackend {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Class names this backend can emit, indexed by class id.
    fn labels(&self) -> &[String];

    /// Run detection on a frame, keeping detections with
    /// `confidence >= confidence_threshold`.
    fn detect(&mut self, frame: &Frame, confidence_threshold: f32) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
