use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

/// Stub backend for dry runs and tests.
///
/// Hashes the frame pixels and uses the digest to pick at most one of the
/// configured labels. Identical frames always produce identical detections.
pub struct StubBackend {
    labels: Vec<String>,
}

impl StubBackend {
    pub fn new(labels: Vec<String>) -> Self {
        Self { labels }
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn detect(&mut self, frame: &Frame, confidence_threshold: f32) -> Result<Vec<Detection>> {
        if self.labels.is_empty() {
            return Ok(Vec::new());
        }
        let digest: [u8; 32] = Sha256::digest(frame.pixels()).into();

        // One extra slot means "nothing in view".
        let slot = digest[0] as usize % (self.labels.len() + 1);
        let Some(class_name) = self.labels.get(slot) else {
            return Ok(Vec::new());
        };

        let confidence = 0.5 + (digest[1] as f32 / 255.0) * 0.5;
        if confidence < confidence_threshold {
            return Ok(Vec::new());
        }

        let w = frame.width as f32;
        let h = frame.height as f32;
        Ok(vec![Detection {
            class_id: slot,
            class_name: class_name.clone(),
            confidence,
            bounding_box: BoundingBox {
                x1: w * 0.25,
                y1: h * 0.25,
                x2: w * 0.75,
                y2: h * 0.75,
            },
        }])
    }
}
