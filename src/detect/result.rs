use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Axis-aligned box in source-frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Intersection over union with another box. Zero when either box is empty.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// One recognized object in one frame. No identity across ticks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: usize,
    pub class_name: String,
    /// In [0, 1].
    pub confidence: f32,
    pub bounding_box: BoundingBox,
}

/// Order in which a tick's detections reach the coordinator.
///
/// The coordinator acts on the first configured class it sees, so this is the
/// priority policy among simultaneously visible targets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionOrder {
    /// Descending confidence; ties by left edge, then class id.
    #[default]
    Confidence,
    /// Ascending left edge; ties by top edge.
    LeftToRight,
    /// Whatever order the backend returned.
    Model,
}

impl std::str::FromStr for DetectionOrder {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "confidence" => Ok(DetectionOrder::Confidence),
            "left_to_right" | "left-to-right" => Ok(DetectionOrder::LeftToRight),
            "model" => Ok(DetectionOrder::Model),
            other => Err(anyhow::anyhow!("unknown detection order '{}'", other)),
        }
    }
}

/// Sort detections in place according to `order`. Stable for equal keys.
pub fn order_detections(detections: &mut [Detection], order: DetectionOrder) {
    match order {
        DetectionOrder::Confidence => detections.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.bounding_box.x1.total_cmp(&b.bounding_box.x1))
                .then_with(|| a.class_id.cmp(&b.class_id))
        }),
        DetectionOrder::LeftToRight => detections.sort_by(|a, b| {
            a.bounding_box
                .x1
                .total_cmp(&b.bounding_box.x1)
                .then_with(|| a.bounding_box.y1.total_cmp(&b.bounding_box.y1))
        }),
        DetectionOrder::Model => {}
    }
}

pub(crate) fn by_confidence_desc(a: &Detection, b: &Detection) -> Ordering {
    b.confidence.total_cmp(&a.confidence)
}
