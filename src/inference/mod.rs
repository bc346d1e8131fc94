pub mod annotate;
pub mod engine;
pub mod motion;
pub mod preprocess;
pub mod stage;
#[cfg(feature = "backend-tract")]
pub mod tract;

pub use engine::{AnnotatedFrame, BoundingBox, Detection, InferenceEngine, ModelDescriptor};
pub use motion::MotionEngine;
pub use stage::{InferenceSettings, InferenceStage};
