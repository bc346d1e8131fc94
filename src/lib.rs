pub mod capture;
pub mod display;
pub mod error;
pub mod inference;
pub mod pipeline;

use std::path::Path;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use capture::frame::{CaptureFormat, Frame, FrameError, PixelFormat};
pub use error::PipelineError;
pub use inference::{AnnotatedFrame, Detection, InferenceEngine, ModelDescriptor};
pub use pipeline::{Pipeline, PipelineEvent, PipelineSettings, ShutdownReport, StageKind, StageState};

use capture::CaptureSettings;
use inference::InferenceSettings;

/// Prefix for environment overrides, e.g. `VISOR__CAPTURE__UI_FPS=10`.
pub const ENV_PREFIX: &str = "VISOR";

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub inference: InferenceConfig,
    pub pipeline: PipelineConfig,
    pub display: DisplayConfig,
    #[cfg(feature = "gstreamer-pipeline")]
    pub gstreamer: GStreamerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Device path, `test://WxH@FPS`, or a GStreamer launch line.
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: CaptureFormat,
    pub buffer_count: u32,
    /// Raw preview emission rate.
    pub ui_fps: f64,
    pub failure_threshold: u32,
    pub failure_backoff_ms: u64,
    pub read_timeout_ms: u64,
    pub pin_core: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// `builtin:motion` or a path to an ONNX file.
    pub model: String,
    pub infer_fps: f64,
    pub input_width: u32,
    pub input_height: u32,
    pub score_threshold: f32,
    pub iou_threshold: f32,
    /// Class names by id; missing ids are shown as `class N`.
    pub labels: Vec<String>,
    pub idle_poll_ms: u64,
    pub empty_slot_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub shutdown_grace_ms: u64,
    pub stop_sibling_on_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    pub title: String,
    pub headless: bool,
}

#[cfg(feature = "gstreamer-pipeline")]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GStreamerConfig {
    /// Open device sources through an MJPEG GStreamer pipeline instead of V4L2.
    pub prefer_pipeline: bool,
    /// JPEG decoder element; detected from the registry when unset.
    pub jpeg_decoder: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig {
                source: "/dev/video0".to_string(),
                width: 1280,
                height: 720,
                fps: 30,
                format: CaptureFormat::Mjpeg,
                buffer_count: 4,
                ui_fps: 15.0,
                failure_threshold: 100,
                failure_backoff_ms: 10,
                read_timeout_ms: 1000,
                pin_core: None,
            },
            inference: InferenceConfig::default(),
            pipeline: PipelineConfig {
                shutdown_grace_ms: 1500,
                stop_sibling_on_error: true,
            },
            display: DisplayConfig {
                width: 1280,
                height: 480,
                title: "visor".to_string(),
                headless: false,
            },
            #[cfg(feature = "gstreamer-pipeline")]
            gstreamer: GStreamerConfig {
                prefer_pipeline: false,
                jpeg_decoder: None,
            },
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            model: "builtin:motion".to_string(),
            infer_fps: 6.0,
            input_width: 640,
            input_height: 640,
            score_threshold: 0.25,
            iou_threshold: 0.45,
            labels: Vec::new(),
            idle_poll_ms: 5,
            empty_slot_poll_ms: 10,
        }
    }
}

impl Config {
    /// Defaults, then `path` if given, then `VISOR__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            debug!("Reading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, fps) in [
            ("capture.ui_fps", self.capture.ui_fps),
            ("inference.infer_fps", self.inference.infer_fps),
        ] {
            if !(fps.is_finite() && fps > 0.0) {
                return Err(eyre!("{} must be positive, got {}", name, fps));
            }
        }
        if self.inference.input_width == 0 || self.inference.input_height == 0 {
            return Err(eyre!("inference input size must be non-zero"));
        }
        if self.capture.failure_threshold == 0 {
            return Err(eyre!("capture.failure_threshold must be at least 1"));
        }
        Ok(())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            capture: self.capture.settings(),
            inference: self.inference.settings(),
            shutdown_grace: Duration::from_millis(self.pipeline.shutdown_grace_ms),
            stop_sibling_on_error: self.pipeline.stop_sibling_on_error,
        }
    }
}

impl CaptureConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn settings(&self) -> CaptureSettings {
        CaptureSettings {
            ui_period: Duration::from_secs_f64(1.0 / self.ui_fps),
            failure_threshold: self.failure_threshold,
            failure_backoff: Duration::from_millis(self.failure_backoff_ms),
            pin_core: self.pin_core,
        }
    }
}

impl InferenceConfig {
    pub fn settings(&self) -> InferenceSettings {
        InferenceSettings {
            period: Duration::from_secs_f64(1.0 / self.infer_fps),
            idle_quantum: Duration::from_millis(self.idle_poll_ms),
            empty_wait: Duration::from_millis(self.empty_slot_poll_ms),
        }
    }
}
