#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::engine::DetectionEngine;
use crate::detect::result::{non_max_suppression, BBox, Detection};
use crate::frame::Frame;

/// Tract-based ONNX detection engine.
///
/// Loads a local model file and performs inference on RGB frames. The model
/// is expected to emit one row per candidate box, `[x1, y1, x2, y2,
/// confidence, class]` in pixel coordinates. Rows below the confidence
/// threshold are dropped and greedy NMS is applied with the configured IoU
/// threshold.
///
/// Tract has no built-in tracker, so detections carry no track id; the
/// ledger then never persists crops for them. Real deployments pair this
/// engine with an external tracker or use an exported model that emits
/// track ids in a seventh column.
pub struct TractEngine {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>,
    width: u32,
    height: u32,
    iou_threshold: f32,
}

impl TractEngine {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn load(model_path: &Path, iou_threshold: f32) -> Result<Self> {
        let width = 640u32;
        let height = 480u32;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
            iou_threshold,
        })
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        if frame.width != self.width || frame.height != self.height {
            return Err(anyhow!(
                "frame size {}x{} does not match model input {}x{}",
                frame.width,
                frame.height,
                self.width,
                self.height
            ));
        }
        if frame.data.len() != frame.expected_len() {
            return Err(anyhow!(
                "expected {} RGB bytes, received {}",
                frame.expected_len(),
                frame.data.len()
            ));
        }

        let width = frame.width as usize;
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, frame.height as usize, width),
            |(_, channel, y, x)| {
                let idx = (y * width + x) * 3 + channel;
                frame.data[idx] as f32 / 255.0
            },
        );
        Ok(input.into_tensor())
    }

    fn parse_output(&self, outputs: TVec<TValue>, confidence_threshold: f32) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape();
        let cols = *shape
            .last()
            .ok_or_else(|| anyhow!("model output has no dimensions"))?;
        if cols < 6 {
            return Err(anyhow!(
                "model output rows have {} columns, expected at least 6",
                cols
            ));
        }

        let flat: Vec<f32> = view.iter().cloned().collect();
        let mut detections = Vec::new();
        for row in flat.chunks_exact(cols) {
            let confidence = row[4];
            if !confidence.is_finite() || confidence < confidence_threshold {
                continue;
            }
            let track_id = if cols >= 7 && row[6].is_finite() && row[6] >= 0.0 {
                Some(row[6] as i64)
            } else {
                None
            };
            detections.push(Detection {
                bbox: BBox::new(row[0], row[1], row[2], row[3]),
                confidence,
                class_id: row[5].max(0.0) as u32,
                track_id,
            });
        }

        Ok(non_max_suppression(detections, self.iou_threshold))
    }
}

impl DetectionEngine for TractEngine {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn track(&mut self, frame: &Frame, confidence_threshold: f32) -> Result<Vec<Detection>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.parse_output(outputs, confidence_threshold)
    }
}
