//! V4L2 mmap capture decoding MJPEG/YUYV payloads into RGB24 frames

use std::path::PathBuf;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::{
    capture::decoder,
    capture::frame::{CaptureFormat, Frame, PixelFormat},
    capture::source::CaptureSource,
    CaptureConfig,
};

/// V4L2 capture source
pub struct V4l2Capture {
    path: PathBuf,
    config: CaptureConfig,
    device: Option<Box<Device>>,
    stream: Option<MmapStream<'static>>,
    negotiated: Option<(u32, u32, CaptureFormat)>,
    sequence: u64,
}

impl V4l2Capture {
    pub fn new(path: PathBuf, config: CaptureConfig) -> Self {
        Self {
            path,
            config,
            device: None,
            stream: None,
            negotiated: None,
            sequence: 0,
        }
    }

    fn fourcc(format: CaptureFormat) -> FourCC {
        match format {
            CaptureFormat::Mjpeg => FourCC::new(b"MJPG"),
            CaptureFormat::Yuyv4 => FourCC::new(b"YUYV"),
            CaptureFormat::Rgb24 => FourCC::new(b"RGB3"),
        }
    }

    fn format_for(fourcc: FourCC) -> Option<CaptureFormat> {
        [CaptureFormat::Mjpeg, CaptureFormat::Yuyv4, CaptureFormat::Rgb24]
            .into_iter()
            .find(|f| Self::fourcc(*f) == fourcc)
    }
}

impl CaptureSource for V4l2Capture {
    fn describe(&self) -> String {
        format!("V4L2 device {}", self.path.display())
    }

    #[instrument(skip(self), fields(device = %self.path.display()))]
    fn open(&mut self) -> Result<()> {
        let device = Device::with_path(&self.path)?;

        // Query capabilities
        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(eyre!("Device doesn't support video capture"));
        }

        let mut fmt = device.format()?;
        fmt.width = self.config.width;
        fmt.height = self.config.height;
        fmt.fourcc = Self::fourcc(self.config.format);
        let actual = device.set_format(&fmt)?;

        let format = Self::format_for(actual.fourcc)
            .ok_or_else(|| eyre!("Device negotiated unsupported format {}", actual.fourcc))?;
        if format != self.config.format || actual.width != fmt.width || actual.height != fmt.height {
            warn!(
                "Requested {}x{} {:?}, device negotiated {}x{} {:?}",
                fmt.width, fmt.height, self.config.format, actual.width, actual.height, format
            );
        }

        let stream =
            MmapStream::with_buffers(&device, Type::VideoCapture, self.config.buffer_count)?;
        info!(
            "Capture stream started with {} buffers",
            self.config.buffer_count
        );

        self.negotiated = Some((actual.width, actual.height, format));
        self.stream = Some(stream);
        self.device = Some(Box::new(device));
        Ok(())
    }

    fn read(&mut self) -> Result<Frame> {
        let (width, height, format) = self
            .negotiated
            .ok_or_else(|| eyre!("Stream not started"))?;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| eyre!("Stream not started"))?;

        let (buf, meta) = stream.next()?;
        let used = (meta.bytesused as usize).min(buf.len());
        let decoded = decoder::decode_frame(&buf[..used], format, width, height)?;

        self.sequence += 1;
        let timestamp = Duration::from_secs(meta.timestamp.sec as u64)
            + Duration::from_micros(meta.timestamp.usec as u64);

        Ok(Frame::new(
            self.sequence,
            decoded.width,
            decoded.height,
            PixelFormat::Rgb24,
            decoded.rgb,
        )?
        .with_device_timestamp(timestamp))
    }

    fn close(&mut self) {
        // Stream unmaps its buffers before the device handle goes away.
        self.stream = None;
        self.device = None;
        self.negotiated = None;
        info!("Released {}", self.path.display());
    }
}
