//! GStreamer appsink capture for arbitrary launch pipelines

use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use crate::capture::frame::{Frame, PixelFormat};
use crate::capture::source::CaptureSource;

/// Capture source backed by a GStreamer launch string ending in an appsink.
///
/// The appsink must be named `sink` (`appsink name=sink ...`).
pub struct GstCapture {
    launch: String,
    read_timeout: Duration,
    pipeline: Option<gst::Pipeline>,
    appsink: Option<gst_app::AppSink>,
    sequence: u64,
}

impl GstCapture {
    pub fn new(launch: String, read_timeout: Duration) -> Self {
        Self {
            launch,
            read_timeout,
            pipeline: None,
            appsink: None,
            sequence: 0,
        }
    }

    /// Detect best available JPEG decoder (hardware > software)
    pub fn detect_jpeg_decoder() -> &'static str {
        let decoders = [
            "nvjpegdec",    // NVIDIA hardware decoder
            "vaapijpegdec", // Intel/AMD VAAPI hardware decoder
            "v4l2jpegdec",  // V4L2 hardware decoder
            "jpegdec",      // Software decoder (fallback)
        ];

        if gst::init().is_err() {
            return "jpegdec";
        }

        for decoder in &decoders {
            if let Some(factory) = gst::ElementFactory::find(decoder) {
                debug!(
                    "Found decoder: {} - {}",
                    decoder,
                    factory.metadata("long-name").unwrap_or("")
                );
                return decoder;
            }
        }

        warn!("No hardware JPEG decoder found, using software decoder");
        "jpegdec"
    }

    fn find_appsink(pipeline: &gst::Pipeline) -> Result<gst_app::AppSink> {
        pipeline
            .by_name("sink")
            .ok_or_else(|| eyre!("pipeline has no element named `sink`"))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| eyre!("element `sink` is not an appsink"))
    }

    fn stop_pipeline(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(e) = pipeline.set_state(gst::State::Null) {
                warn!("Failed to stop pipeline: {:?}", e);
            }
        }
        self.appsink = None;
    }
}

impl CaptureSource for GstCapture {
    fn describe(&self) -> String {
        format!("GStreamer pipeline `{}`", self.launch)
    }

    fn open(&mut self) -> Result<()> {
        gst::init().map_err(|e| eyre!("Failed to initialize GStreamer: {}", e))?;
        info!("Pipeline: {}", self.launch);

        let pipeline = gst::parse::launch(&self.launch)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| eyre!("Failed to create pipeline"))?;
        let appsink = Self::find_appsink(&pipeline)?;

        // Keep only the newest buffer; latency matters more than completeness.
        appsink.set_property("emit-signals", false);
        appsink.set_property("max-buffers", 1u32);
        appsink.set_property("drop", true);
        appsink.set_property("sync", false);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| eyre!("Failed to start pipeline: {:?}", e))?;

        let (state_change, _, _) = pipeline.state(Some(gst::ClockTime::from_seconds(5)));
        match state_change {
            Ok(gst::StateChangeSuccess::Success) => info!("Pipeline started successfully"),
            Ok(gst::StateChangeSuccess::Async) => info!("Pipeline starting asynchronously"),
            Ok(gst::StateChangeSuccess::NoPreroll) => info!("Live pipeline started"),
            Err(_) => {
                let _ = pipeline.set_state(gst::State::Null);
                return Err(eyre!("Failed to start pipeline"));
            }
        }

        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        Ok(())
    }

    fn read(&mut self) -> Result<Frame> {
        let timestamp = Instant::now();
        let appsink = self
            .appsink
            .as_ref()
            .ok_or_else(|| eyre!("Pipeline not started"))?;

        let sample = appsink
            .try_pull_sample(gst::ClockTime::from_mseconds(self.read_timeout.as_millis() as u64))
            .ok_or_else(|| eyre!("No sample within {:?}", self.read_timeout))?;

        let buffer = sample
            .buffer()
            .ok_or_else(|| eyre!("Sample contains no buffer"))?;
        let caps = sample.caps().ok_or_else(|| eyre!("Sample has no caps"))?;
        let video_info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| eyre!("Failed to parse video info from caps"))?;

        let format = match video_info.format() {
            gst_video::VideoFormat::Rgb => PixelFormat::Rgb24,
            gst_video::VideoFormat::Bgr => PixelFormat::Bgr24,
            other => return Err(eyre!("appsink delivered {:?}, expected RGB or BGR", other)),
        };

        let map = buffer
            .map_readable()
            .map_err(|_| eyre!("Failed to map buffer"))?;
        let data = map.as_slice();

        let width = video_info.width();
        let height = video_info.height();
        let row_bytes = width as usize * PixelFormat::BYTES_PER_PIXEL;
        let stride = video_info.stride()[0] as usize;

        // Repack rows when the producer pads them.
        let pixels = if stride == row_bytes {
            data.get(..row_bytes * height as usize)
                .ok_or_else(|| eyre!("Buffer shorter than frame"))?
                .to_vec()
        } else {
            let mut pixels = Vec::with_capacity(row_bytes * height as usize);
            for row in 0..height as usize {
                let start = row * stride;
                pixels.extend_from_slice(
                    data.get(start..start + row_bytes)
                        .ok_or_else(|| eyre!("Buffer row {} out of bounds", row))?,
                );
            }
            pixels
        };

        self.sequence += 1;
        let mut frame = Frame::new(self.sequence, width, height, format, pixels)?;
        frame.timestamp = timestamp;
        if let Some(pts) = buffer.pts() {
            frame = frame.with_device_timestamp(Duration::from_nanos(pts.nseconds()));
        }
        Ok(frame)
    }

    fn close(&mut self) {
        info!("Stopping GStreamer pipeline");
        self.stop_pipeline();
    }
}

impl Drop for GstCapture {
    fn drop(&mut self) {
        self.stop_pipeline();
    }
}
