#![cfg(feature = "backend-tract")]

use std::path::PathBuf;

use color_eyre::{eyre::eyre, Result};
use tracing::{info, instrument};
use tract_onnx::prelude::*;

use super::engine::{BoundingBox, Detection, InferenceEngine};
use super::preprocess;
use crate::{Frame, InferenceConfig};

type Plan = TypedRunnableModel<TypedModel>;

/// ONNX detector for YOLO-style exports with a `[1, 4 + classes, anchors]` head.
///
/// The model is not touched until `load`, so building the engine on the UI
/// thread stays cheap.
pub struct TractEngine {
    path: PathBuf,
    width: u32,
    height: u32,
    score_threshold: f32,
    iou_threshold: f32,
    labels: Vec<String>,
    model: Option<Plan>,
}

impl TractEngine {
    pub fn new(path: PathBuf, config: &InferenceConfig) -> Self {
        Self {
            path,
            width: config.input_width,
            height: config.input_height,
            score_threshold: config.score_threshold,
            iou_threshold: config.iou_threshold,
            labels: config.labels.clone(),
            model: None,
        }
    }

    fn label(&self, class_id: u32) -> String {
        self.labels
            .get(class_id as usize)
            .cloned()
            .unwrap_or_else(|| format!("class {}", class_id))
    }

    fn decode(&self, output: &Tensor) -> Result<Vec<Detection>> {
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| eyre!("model output is not f32: {e:#}"))?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 {
            return Err(eyre!("unexpected output shape {:?}", shape));
        }

        // Exports disagree on whether anchors or attributes come last.
        let transposed = shape[1] > shape[2];
        let (attrs, anchors) = if transposed {
            (shape[2], shape[1])
        } else {
            (shape[1], shape[2])
        };
        if attrs <= 4 {
            return Err(eyre!("output has no class scores: {:?}", shape));
        }

        let at = |attr: usize, anchor: usize| -> f32 {
            if transposed {
                view[[0, anchor, attr]]
            } else {
                view[[0, attr, anchor]]
            }
        };

        let mut candidates = Vec::new();
        for anchor in 0..anchors {
            let (class_id, score) = (4..attrs)
                .map(|attr| (attr - 4, at(attr, anchor)))
                .fold((0, f32::NEG_INFINITY), |best, cur| {
                    if cur.1 > best.1 {
                        cur
                    } else {
                        best
                    }
                });
            if score < self.score_threshold {
                continue;
            }
            candidates.push(Detection {
                class_id: class_id as u32,
                label: self.label(class_id as u32),
                score,
                bbox: BoundingBox::from_center(
                    at(0, anchor),
                    at(1, anchor),
                    at(2, anchor),
                    at(3, anchor),
                ),
            });
        }

        Ok(non_max_suppression(candidates, self.iou_threshold))
    }
}

impl InferenceEngine for TractEngine {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    #[instrument(skip(self), fields(model = %self.path.display()))]
    fn load(&mut self) -> Result<()> {
        if !self.path.is_file() {
            return Err(eyre!("{} is not a readable file", self.path.display()));
        }

        let plan = tract_onnx::onnx()
            .model_for_path(&self.path)
            .and_then(|model| {
                model.with_input_fact(
                    0,
                    InferenceFact::dt_shape(
                        f32::datum_type(),
                        tvec!(1, 3, self.height as usize, self.width as usize),
                    ),
                )
            })
            .and_then(|model| model.into_optimized())
            .and_then(|model| model.into_runnable())
            .map_err(|e| eyre!("failed to prepare {}: {e:#}", self.path.display()))?;

        self.model = Some(plan);
        info!("Loaded ONNX model at {}x{}", self.width, self.height);
        Ok(())
    }

    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn infer(&mut self, input: &Frame) -> Result<Vec<Detection>> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| eyre!("model used before load"))?;
        if (input.width(), input.height()) != (self.width, self.height) {
            return Err(eyre!(
                "frame size {}x{} does not match model input {}x{}",
                input.width(),
                input.height(),
                self.width,
                self.height
            ));
        }

        let data = preprocess::to_nchw_f32(input);
        let tensor = tract_ndarray::Array4::from_shape_vec(
            (1, 3, self.height as usize, self.width as usize),
            data,
        )
        .map_err(|e| eyre!("input tensor shape: {e}"))?
        .into_tensor();

        let outputs = model
            .run(tvec!(tensor.into()))
            .map_err(|e| eyre!("ONNX inference failed: {e:#}"))?;
        let output = outputs
            .first()
            .ok_or_else(|| eyre!("model produced no outputs"))?;
        self.decode(output)
    }
}

/// Greedy per-class suppression, highest score first.
pub fn non_max_suppression(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Detection> = Vec::new();
    for candidate in candidates {
        let overlaps = kept.iter().any(|k| {
            k.class_id == candidate.class_id && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}
