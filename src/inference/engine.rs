use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};

use super::motion::MotionEngine;
use crate::{Frame, InferenceConfig};

/// Axis-aligned box in pixel coordinates of the engine input
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Box from centre point and size, the layout YOLO-style heads emit.
    pub fn from_center(cx: f32, cy: f32, width: f32, height: f32) -> Self {
        Self {
            x: cx - width / 2.0,
            y: cy - height / 2.0,
            width,
            height,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let intersection = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_id: u32,
    pub label: String,
    pub score: f32,
    pub bbox: BoundingBox,
}

/// Inference output ready for display
#[derive(Debug, Clone)]
pub struct AnnotatedFrame {
    /// Model input with detections drawn on it.
    pub frame: Frame,
    pub detections: Vec<Detection>,
    /// Sequence number of the captured frame this result came from.
    pub source_sequence: u64,
    pub inference_time: Duration,
}

/// A detector the inference stage drives.
///
/// Construction must be cheap; `load` runs on the inference thread and may
/// take seconds. The stage owns the engine exclusively.
pub trait InferenceEngine: Send + 'static {
    fn describe(&self) -> String;

    fn load(&mut self) -> Result<()>;

    /// Width and height the engine expects its input resized to.
    fn input_size(&self) -> (u32, u32);

    /// Run detection on an RGB24 frame of exactly `input_size()`.
    fn infer(&mut self, input: &Frame) -> Result<Vec<Detection>>;

    /// Validate the engine against a synthetic blank input before steady state.
    fn warm_up(&mut self) -> Result<()> {
        let (width, height) = self.input_size();
        let blank = Frame::blank(width, height)?;
        self.infer(&blank).map(|_| ())
    }
}

/// What the UI layer hands us to identify a model
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelDescriptor {
    /// Built-in frame-difference detector.
    Motion,
    /// ONNX detector exported from a YOLO-style model.
    Onnx(PathBuf),
}

impl ModelDescriptor {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        match input {
            "" => Err(eyre!("empty model descriptor")),
            "builtin:motion" => Ok(Self::Motion),
            other if other.starts_with("builtin:") => {
                Err(eyre!("unknown built-in model {:?}", other))
            }
            path => Ok(Self::Onnx(PathBuf::from(path))),
        }
    }

    /// Build the engine for this descriptor without loading it.
    #[cfg_attr(not(feature = "backend-tract"), allow(unused_variables))]
    pub fn build(&self, config: &InferenceConfig) -> Result<Box<dyn InferenceEngine>> {
        match self {
            Self::Motion => Ok(Box::new(MotionEngine::new(
                config.input_width,
                config.input_height,
            ))),
            #[cfg(feature = "backend-tract")]
            Self::Onnx(path) => Ok(Box::new(super::tract::TractEngine::new(
                path.clone(),
                config,
            ))),
            #[cfg(not(feature = "backend-tract"))]
            Self::Onnx(path) => Err(eyre!(
                "{} needs the `backend-tract` feature",
                path.display()
            )),
        }
    }
}

impl FromStr for ModelDescriptor {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ModelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Motion => f.write_str("builtin:motion"),
            Self::Onnx(path) => write!(f, "{}", path.display()),
        }
    }
}
