use std::time::Duration;

use thiserror::Error;

use crate::pipeline::stage::StageKind;

/// Failures surfaced by the pipeline to the display boundary
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// The capture device could not be opened; the capture loop never ran.
    #[error("could not open capture source {source_name}: {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    /// Too many consecutive read failures from an opened device.
    #[error("capture stalled after {failures} consecutive read failures")]
    CaptureStalled { failures: u32 },

    /// Engine failed to load or failed its warm-up call.
    #[error("model not usable ({model}): {reason}")]
    ModelUnusable { model: String, reason: String },

    /// Engine failed on a real frame during steady state.
    #[error("inference error: {0}")]
    InferenceError(String),

    /// The stage thread unwound from a panic.
    #[error("{stage} stage panicked")]
    StagePanicked { stage: StageKind },

    /// A stage did not finish within its shutdown grace period.
    #[error("{stage} stage did not stop within {grace:?}")]
    ShutdownTimeout { stage: StageKind, grace: Duration },
}

impl PipelineError {
    /// Whether the error terminated the stage that reported it.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::ShutdownTimeout { .. })
    }
}
