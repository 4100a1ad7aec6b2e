#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::detect::yolo::{self, Letterbox, PostProcess, LETTERBOX_FILL};
use crate::frame::Frame;

/// Tract-based backend for YOLO ONNX models.
///
/// Loads a local model with a fixed `1x3xNxN` input. Frames of any size are
/// letterboxed into the input and detections are mapped back to the frame.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    input_size: u32,
    labels: Vec<String>,
    iou_threshold: f32,
    max_detections: usize,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32, labels: Vec<String>) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            labels,
            iou_threshold: 0.45,
            max_detections: 100,
        })
    }

    /// Override the default NMS parameters.
    pub fn with_nms(mut self, iou_threshold: f32, max_detections: usize) -> Self {
        self.iou_threshold = iou_threshold;
        self.max_detections = max_detections;
        self
    }

    fn build_input(&self, frame: &Frame, letterbox: &Letterbox) -> Tensor {
        let resized = imageops::resize(
            frame.as_image(),
            letterbox.resized_width,
            letterbox.resized_height,
            FilterType::Triangle,
        );
        let side = self.input_size as usize;
        let (pad_x, pad_y) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
        let (rw, rh) = (resized.width() as usize, resized.height() as usize);
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, channel, y, x)| {
            let inside = x >= pad_x && x < pad_x + rw && y >= pad_y && y < pad_y + rh;
            let value = if inside {
                resized.get_pixel((x - pad_x) as u32, (y - pad_y) as u32)[channel]
            } else {
                LETTERBOX_FILL
            };
            value as f32 / 255.0
        });
        input.into_tensor()
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn detect(&mut self, frame: &Frame, confidence_threshold: f32) -> Result<Vec<Detection>> {
        let letterbox = Letterbox::fit(frame.width, frame.height, self.input_size)?;
        let input = self.build_input(frame, &letterbox);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let data = output
            .as_slice::<f32>()
            .context("model output tensor was not f32")?;

        yolo::postprocess(
            output.shape(),
            data,
            &self.labels,
            &letterbox,
            PostProcess {
                confidence_threshold,
                iou_threshold: self.iou_threshold,
                max_detections: self.max_detections,
            },
        )
    }

    fn warm_up(&mut self) -> Result<()> {
        let side = self.input_size;
        let blank = Frame::from_rgb(vec![LETTERBOX_FILL; (side * side * 3) as usize], side, side, 0)?;
        self.detect(&blank, 1.0).map(|_| ())
    }
}
