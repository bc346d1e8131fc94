pub mod decoder;
pub mod frame;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_capture;
pub mod source;
pub mod stage;
pub mod test_pattern;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use frame::{CaptureFormat, Frame, FrameError, PixelFormat};
pub use source::{CaptureSource, SourceDescriptor};
pub use stage::{CaptureSettings, CaptureStage};
pub use test_pattern::TestPattern;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Capture;
