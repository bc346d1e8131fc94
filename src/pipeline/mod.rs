pub mod event;
pub mod rate;
pub mod slot;
pub mod stage;
pub mod supervisor;

pub use event::PipelineEvent;
pub use slot::{LatestFrameSlot, SlotStats};
pub use stage::{StageHandle, StageKind, StageState};
pub use supervisor::{Pipeline, PipelineSettings, ShutdownReport};
