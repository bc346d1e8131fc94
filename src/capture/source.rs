//! Capture source abstraction and descriptor parsing

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};

use super::frame::Frame;
use super::test_pattern::TestPattern;
use crate::CaptureConfig;

/// A device the capture stage pulls frames from.
///
/// Construction must be cheap; all device I/O happens in `open`, which runs on
/// the capture thread. The stage calls `close` exactly once on every exit,
/// including after a failed `open`, so `close` must be a no-op when nothing
/// was opened.
pub trait CaptureSource: Send + 'static {
    /// Human readable identifier used in logs and error reports.
    fn describe(&self) -> String;

    fn open(&mut self) -> Result<()>;

    /// Blocking read of the next frame. Any error counts as one failed read.
    fn read(&mut self) -> Result<Frame>;

    fn close(&mut self);
}

/// What the UI layer hands us to identify a capture source
#[derive(Debug, Clone, PartialEq)]
pub enum SourceDescriptor {
    /// V4L2 device node, e.g. `/dev/video0`.
    Device(PathBuf),
    /// GStreamer launch string ending in an appsink.
    Pipeline(String),
    /// Synthetic solid-colour source, `test://WxH@FPS[/RRGGBB]`.
    TestPattern {
        width: u32,
        height: u32,
        fps: f64,
        rgb: [u8; 3],
    },
}

impl SourceDescriptor {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(eyre!("empty capture source descriptor"));
        }

        if let Some(spec) = input.strip_prefix("test://") {
            return parse_test_pattern(spec);
        }

        // GStreamer launch syntax links elements with '!'
        if input.contains('!') {
            return Ok(Self::Pipeline(input.to_string()));
        }

        Ok(Self::Device(PathBuf::from(input)))
    }

    /// Build the source backend for this descriptor without touching the device.
    #[cfg_attr(
        not(any(feature = "v4l2", feature = "gstreamer-pipeline")),
        allow(unused_variables)
    )]
    pub fn build(&self, config: &CaptureConfig) -> Result<Box<dyn CaptureSource>> {
        match self {
            Self::TestPattern {
                width,
                height,
                fps,
                rgb,
            } => Ok(Box::new(TestPattern::new(
                *width,
                *height,
                Duration::from_secs_f64(1.0 / fps),
                *rgb,
            ))),
            #[cfg(feature = "v4l2")]
            Self::Device(path) => Ok(Box::new(super::v4l2::V4l2Capture::new(
                path.clone(),
                config.clone(),
            ))),
            #[cfg(not(feature = "v4l2"))]
            Self::Device(path) => Err(eyre!(
                "{} requires the `v4l2` feature",
                path.display()
            )),
            #[cfg(feature = "gstreamer-pipeline")]
            Self::Pipeline(launch) => Ok(Box::new(super::gst_capture::GstCapture::new(
                launch.clone(),
                config.read_timeout(),
            ))),
            #[cfg(not(feature = "gstreamer-pipeline"))]
            Self::Pipeline(_) => Err(eyre!(
                "GStreamer pipelines require the `gstreamer-pipeline` feature"
            )),
        }
    }
}

impl FromStr for SourceDescriptor {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(path) => write!(f, "{}", path.display()),
            Self::Pipeline(launch) => write!(f, "{}", launch),
            Self::TestPattern {
                width,
                height,
                fps,
                rgb,
            } => write!(
                f,
                "test://{}x{}@{}/{:02x}{:02x}{:02x}",
                width, height, fps, rgb[0], rgb[1], rgb[2]
            ),
        }
    }
}

fn parse_test_pattern(spec: &str) -> Result<SourceDescriptor> {
    let (geometry, colour) = match spec.split_once('/') {
        Some((geometry, colour)) => (geometry, Some(colour)),
        None => (spec, None),
    };

    let (size, fps) = geometry
        .split_once('@')
        .ok_or_else(|| eyre!("test pattern needs WxH@FPS, got {:?}", spec))?;
    let (width, height) = size
        .split_once('x')
        .ok_or_else(|| eyre!("test pattern size must be WxH, got {:?}", size))?;

    let width: u32 = width.parse()?;
    let height: u32 = height.parse()?;
    let fps: f64 = fps.parse()?;
    if width == 0 || height == 0 {
        return Err(eyre!("test pattern dimensions must be non-zero"));
    }
    if !(fps.is_finite() && fps > 0.0) {
        return Err(eyre!("test pattern fps must be positive, got {}", fps));
    }

    let rgb = match colour {
        Some(hex) if hex.len() == 6 && hex.is_ascii() => {
            let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16);
            [channel(0)?, channel(2)?, channel(4)?]
        }
        Some(hex) => return Err(eyre!("test pattern colour must be RRGGBB, got {:?}", hex)),
        None => [0, 128, 255],
    };

    Ok(SourceDescriptor::TestPattern {
        width,
        height,
        fps,
        rgb,
    })
}

/// GStreamer launch string for an MJPEG V4L2 camera feeding a one-buffer,
/// drop-oldest appsink.
pub fn mjpeg_pipeline(device: &str, width: u32, height: u32, fps: u32, jpeg_decoder: &str) -> String {
    format!(
        "v4l2src device={} io-mode=2 ! \
         image/jpeg,width={},height={},framerate={}/1 ! \
         {} ! videoconvert ! video/x-raw,format=RGB ! \
         queue leaky=downstream max-size-buffers=1 ! \
         appsink name=sink max-buffers=1 drop=true sync=false",
        device, width, height, fps, jpeg_decoder
    )
}
