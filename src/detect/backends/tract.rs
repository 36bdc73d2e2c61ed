#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::nms::non_max_suppression;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

const NMS_IOU: f32 = 0.45;
const PAD_VALUE: f32 = 114.0 / 255.0;

type OnnxPlan = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Tract-based backend for YOLOv8-style ONNX detectors.
///
/// Expects a single `[1, 3, S, S]` float input and a `[1, 4 + classes, anchors]`
/// output of center-format boxes followed by per-class scores. Frames are
/// letterboxed into the square input and boxes are mapped back to frame pixels.
pub struct TractBackend {
    model: OnnxPlan,
    input_size: u32,
    classes: usize,
}

struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32, classes: usize) -> Result<Self> {
        let model_path = model_path.as_ref();
        if input_size == 0 || classes == 0 {
            return Err(anyhow!("model input size and class count must be non-zero"));
        }
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, input_size as usize, input_size as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        log::info!(
            "TractBackend: loaded {} (input {}x{}, {} classes)",
            model_path.display(),
            input_size,
            input_size,
            classes
        );

        Ok(Self {
            model,
            input_size,
            classes,
        })
    }

    fn build_input(&self, frame: &Frame) -> Result<(Tensor, Letterbox)> {
        let (width, height) = frame.dimensions();
        let size = self.input_size as f32;
        let scale = (size / width as f32).min(size / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, self.input_size);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, self.input_size);
        let pad_x = (self.input_size - new_w) / 2;
        let pad_y = (self.input_size - new_h) / 2;

        let rgb = frame.to_rgb_image()?;
        let resized = image::imageops::resize(&rgb, new_w, new_h, FilterType::Triangle);

        let side = self.input_size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            let (x, y) = (x as u32, y as u32);
            if x < pad_x || y < pad_y || x >= pad_x + new_w || y >= pad_y + new_h {
                return PAD_VALUE;
            }
            resized.get_pixel(x - pad_x, y - pad_y).0[c] as f32 / 255.0
        });

        Ok((
            input.into_tensor(),
            Letterbox {
                scale,
                pad_x: pad_x as f32,
                pad_y: pad_y as f32,
            },
        ))
    }

    fn decode(
        &self,
        outputs: TVec<TValue>,
        letterbox: &Letterbox,
        frame: &Frame,
        confidence: f32,
    ) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output is not [1, 4 + classes, anchors]")?;

        let (_, rows, anchors) = view.dim();
        if rows != 4 + self.classes {
            return Err(anyhow!(
                "model output has {} rows, expected {} for {} classes",
                rows,
                4 + self.classes,
                self.classes
            ));
        }

        let (width, height) = frame.dimensions();
        let mut detections = Vec::new();
        for anchor in 0..anchors {
            let (class_id, score) = (0..self.classes)
                .map(|c| (c, view[[0, 4 + c, anchor]]))
                .fold((0, f32::NEG_INFINITY), |best, cur| {
                    if cur.1 > best.1 {
                        cur
                    } else {
                        best
                    }
                });
            if score.is_nan() || score < confidence {
                continue;
            }
            let cx = (view[[0, 0, anchor]] - letterbox.pad_x) / letterbox.scale;
            let cy = (view[[0, 1, anchor]] - letterbox.pad_y) / letterbox.scale;
            let w = view[[0, 2, anchor]] / letterbox.scale;
            let h = view[[0, 3, anchor]] / letterbox.scale;
            detections.push(Detection {
                bbox: BoundingBox::from_center(cx, cy, w, h).clamped(width, height),
                confidence: score,
                class_id,
                track_id: None,
            });
        }

        non_max_suppression(&mut detections, NMS_IOU);
        Ok(detections)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame, confidence: f32) -> Result<Vec<Detection>> {
        let (input, letterbox) = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, &letterbox, frame, confidence)
    }

    fn warm_up(&mut self) -> Result<()> {
        let frame = Frame::filled(
            self.input_size,
            self.input_size,
            crate::frame::ChannelOrder::Rgb,
            [114, 114, 114],
        );
        self.detect(&frame, 1.0).map(|_| ())
    }
}
