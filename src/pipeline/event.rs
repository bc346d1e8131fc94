use crate::error::PipelineError;
use crate::inference::AnnotatedFrame;
use crate::pipeline::stage::{StageKind, StageState};
use crate::Frame;

/// Everything the pipeline tells the display collaborator
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Rate-limited copy of a captured frame for the raw preview.
    RawFrame(Frame),
    /// Inference result rendered over the model input.
    Annotated(AnnotatedFrame),
    /// A failure in one stage, or a non-fatal shutdown warning.
    Error {
        stage: StageKind,
        error: PipelineError,
    },
    /// Sent exactly once per stage when its thread is done.
    Finished {
        stage: StageKind,
        state: StageState,
    },
}
