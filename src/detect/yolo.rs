//! YOLO post-processing shared by model backends.
//!
//! Frames are letterboxed into a square model input: the longest side is
//! scaled to the input size and the rest is padded evenly. Decoded boxes are
//! mapped back through the same geometry so detections come out in the
//! source frame's pixel coordinates.

use anyhow::{anyhow, Result};

use crate::detect::result::{by_confidence_desc, BoundingBox, Detection};

/// Grey used by YOLO exporters for padding.
pub const LETTERBOX_FILL: u8 = 114;

/// Geometry of one frame-to-model-input letterbox.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Letterbox {
    pub source_width: u32,
    pub source_height: u32,
    pub input_size: u32,
    pub resized_width: u32,
    pub resized_height: u32,
    pub scale: f32,
    pub pad_x: u32,
    pub pad_y: u32,
}

impl Letterbox {
    pub fn fit(source_width: u32, source_height: u32, input_size: u32) -> Result<Self> {
        if source_width == 0 || source_height == 0 || input_size == 0 {
            return Err(anyhow!(
                "cannot letterbox {}x{} into {}",
                source_width,
                source_height,
                input_size
            ));
        }
        let scale = input_size as f32 / source_width.max(source_height) as f32;
        let resized_width = ((source_width as f32 * scale).round() as u32).clamp(1, input_size);
        let resized_height = ((source_height as f32 * scale).round() as u32).clamp(1, input_size);
        Ok(Self {
            source_width,
            source_height,
            input_size,
            resized_width,
            resized_height,
            scale,
            pad_x: (input_size - resized_width) / 2,
            pad_y: (input_size - resized_height) / 2,
        })
    }

    /// Map a box from model-input space back to the source frame, clamped to it.
    pub fn to_source(&self, b: BoundingBox) -> BoundingBox {
        let max_x = self.source_width as f32;
        let max_y = self.source_height as f32;
        let map_x = |x: f32| ((x - self.pad_x as f32) / self.scale).clamp(0.0, max_x);
        let map_y = |y: f32| ((y - self.pad_y as f32) / self.scale).clamp(0.0, max_y);
        BoundingBox {
            x1: map_x(b.x1),
            y1: map_y(b.y1),
            x2: map_x(b.x2),
            y2: map_y(b.y2),
        }
    }
}

/// Thresholds applied after inference.
#[derive(Clone, Copy, Debug)]
pub struct PostProcess {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

/// Decode a raw `[1, 4 + classes, candidates]` (or transposed
/// `[1, candidates, 4 + classes]`) YOLOv8 output into model-space detections.
pub fn decode(
    shape: &[usize],
    data: &[f32],
    labels: &[String],
    confidence_threshold: f32,
) -> Result<Vec<Detection>> {
    let (rows, cols) = match shape {
        [1, rows, cols] => (*rows, *cols),
        [rows, cols] => (*rows, *cols),
        _ => return Err(anyhow!("unexpected model output shape {:?}", shape)),
    };
    if data.len() != rows * cols {
        return Err(anyhow!(
            "model output holds {} values, shape {:?} needs {}",
            data.len(),
            shape,
            rows * cols
        ));
    }

    // Channel-major unless the label count says otherwise.
    let channel_major = if !labels.is_empty() && cols == labels.len() + 4 {
        false
    } else if !labels.is_empty() && rows == labels.len() + 4 {
        true
    } else {
        rows <= cols
    };
    let (channels, candidates) = if channel_major { (rows, cols) } else { (cols, rows) };
    if channels <= 4 {
        return Err(anyhow!("model output has no class scores ({} channels)", channels));
    }
    let at = |channel: usize, candidate: usize| {
        if channel_major {
            data[channel * candidates + candidate]
        } else {
            data[candidate * channels + channel]
        }
    };

    let mut detections = Vec::new();
    for i in 0..candidates {
        let mut class_id = 0usize;
        let mut best = f32::NEG_INFINITY;
        for c in 4..channels {
            let score = at(c, i);
            if score > best {
                best = score;
                class_id = c - 4;
            }
        }
        if !best.is_finite() || best < confidence_threshold {
            continue;
        }

        let cx = at(0, i);
        let cy = at(1, i);
        let w = at(2, i);
        let h = at(3, i);
        detections.push(Detection {
            class_id,
            class_name: labels
                .get(class_id)
                .cloned()
                .unwrap_or_else(|| format!("class{}", class_id)),
            confidence: best.min(1.0),
            bounding_box: BoundingBox {
                x1: cx - w / 2.0,
                y1: cy - h / 2.0,
                x2: cx + w / 2.0,
                y2: cy + h / 2.0,
            },
        });
    }
    Ok(detections)
}

/// Class-aware non-maximum suppression. Output is sorted by confidence.
pub fn non_max_suppression(
    mut detections: Vec<Detection>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<Detection> {
    detections.sort_by(by_confidence_desc);
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len().min(max_detections));
    for det in detections {
        if kept.len() >= max_detections {
            break;
        }
        let suppressed = kept.iter().any(|k| {
            k.class_id == det.class_id && k.bounding_box.iou(&det.bounding_box) > iou_threshold
        });
        if !suppressed {
            kept.push(det);
        }
    }
    kept
}

/// Decode, suppress and map back to the source frame.
pub fn postprocess(
    shape: &[usize],
    data: &[f32],
    labels: &[String],
    letterbox: &Letterbox,
    params: PostProcess,
) -> Result<Vec<Detection>> {
    let decoded = decode(shape, data, labels, params.confidence_threshold)?;
    let mut kept = non_max_suppression(decoded, params.iou_threshold, params.max_detections);
    for det in &mut kept {
        det.bounding_box = letterbox.to_source(det.bounding_box);
    }
    Ok(kept)
}
