#[cfg(feature = "sdl-display")]
pub mod display;
pub mod headless;

#[cfg(feature = "sdl-display")]
pub use display::Sdl2Display;

use crate::pipeline::PipelineEvent;

/// What a display collaborator saw over one run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EventTally {
    pub raw: u64,
    pub annotated: u64,
    pub errors: u64,
    pub finished: u64,
}

impl EventTally {
    pub fn record(&mut self, event: &PipelineEvent) {
        match event {
            PipelineEvent::RawFrame(_) => self.raw += 1,
            PipelineEvent::Annotated(_) => self.annotated += 1,
            PipelineEvent::Error { .. } => self.errors += 1,
            PipelineEvent::Finished { .. } => self.finished += 1,
        }
    }
}
