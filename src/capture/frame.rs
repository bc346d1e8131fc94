use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Frame data with zero-copy semantics
///
/// The pixel buffer is immutable once built: clones share the same bytes and no
/// holder can write through them, so handing a clone to another thread is an
/// independent copy as far as every reader is concerned.
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Packed three-channel layouts a decoded frame can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
}

/// Wire formats requested from a capture device before decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureFormat {
    Mjpeg,
    Yuyv4,
    Rgb24,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame dimensions must be non-zero (got {width}x{height})")]
    EmptyDimensions { width: u32, height: u32 },

    #[error("expected {expected} bytes for a {width}x{height} frame, got {actual}")]
    LengthMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

impl PixelFormat {
    pub const BYTES_PER_PIXEL: usize = 3;
}

impl Frame {
    /// Build a frame from a tightly packed buffer, validating its length.
    pub fn new(
        sequence: u64,
        width: u32,
        height: u32,
        format: PixelFormat,
        data: impl Into<Bytes>,
    ) -> Result<Self, FrameError> {
        let data = data.into();
        if width == 0 || height == 0 {
            return Err(FrameError::EmptyDimensions { width, height });
        }

        let expected = width as usize * height as usize * PixelFormat::BYTES_PER_PIXEL;
        if data.len() != expected {
            return Err(FrameError::LengthMismatch {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            data,
            meta: Arc::new(FrameMetadata {
                sequence,
                width,
                height,
                stride: width * PixelFormat::BYTES_PER_PIXEL as u32,
                format,
                device_timestamp: None,
            }),
            timestamp: Instant::now(),
        })
    }

    /// All-black RGB frame, used for engine warm-up.
    pub fn blank(width: u32, height: u32) -> Result<Self, FrameError> {
        let len = width as usize * height as usize * PixelFormat::BYTES_PER_PIXEL;
        Self::new(0, width, height, PixelFormat::Rgb24, vec![0u8; len])
    }

    /// Solid-colour RGB frame.
    pub fn solid(sequence: u64, width: u32, height: u32, rgb: [u8; 3]) -> Result<Self, FrameError> {
        let pixels = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixels * PixelFormat::BYTES_PER_PIXEL);
        for _ in 0..pixels {
            data.extend_from_slice(&rgb);
        }
        Self::new(sequence, width, height, PixelFormat::Rgb24, data)
    }

    /// Wrap an RGB image produced by a transformation step.
    ///
    /// The capture timestamp of `origin` is carried over so end-to-end latency
    /// stays measurable after resizing or annotation.
    pub fn from_rgb_image(origin: &Frame, image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: Bytes::from(image.into_raw()),
            meta: Arc::new(FrameMetadata {
                sequence: origin.meta.sequence,
                width,
                height,
                stride: width * PixelFormat::BYTES_PER_PIXEL as u32,
                format: PixelFormat::Rgb24,
                device_timestamp: origin.meta.device_timestamp,
            }),
            timestamp: origin.timestamp,
        }
    }

    /// Attach a hardware timestamp reported by the device.
    pub fn with_device_timestamp(mut self, timestamp: Duration) -> Self {
        Arc::make_mut(&mut self.meta).device_timestamp = Some(timestamp);
        self
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }

    pub fn is_rgb(&self) -> bool {
        self.meta.format == PixelFormat::Rgb24
    }

    /// Raw pixel bytes in the stored layout.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Pixel at (x, y) in RGB order regardless of the stored layout.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.meta.width || y >= self.meta.height {
            return None;
        }
        let idx = (y as usize * self.meta.width as usize + x as usize) * PixelFormat::BYTES_PER_PIXEL;
        let px = &self.data[idx..idx + PixelFormat::BYTES_PER_PIXEL];
        Some(match self.meta.format {
            PixelFormat::Rgb24 => [px[0], px[1], px[2]],
            PixelFormat::Bgr24 => [px[2], px[1], px[0]],
        })
    }

    /// Copy into an owned RGB image, swapping channels for BGR frames.
    pub fn to_rgb_image(&self) -> RgbImage {
        let mut raw = self.data.to_vec();
        if self.meta.format == PixelFormat::Bgr24 {
            for px in raw.chunks_exact_mut(PixelFormat::BYTES_PER_PIXEL) {
                px.swap(0, 2);
            }
        }
        // Length is validated at construction, so the buffer always fits.
        RgbImage::from_raw(self.meta.width, self.meta.height, raw)
            .unwrap_or_else(|| RgbImage::new(self.meta.width, self.meta.height))
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("width", &self.meta.width)
            .field("height", &self.meta.height)
            .field("format", &self.meta.format)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_buffer() {
        let err = Frame::new(1, 2, 2, PixelFormat::Rgb24, vec![0u8; 11]).unwrap_err();
        assert_eq!(
            err,
            FrameError::LengthMismatch {
                width: 2,
                height: 2,
                expected: 12,
                actual: 11
            }
        );
    }

    #[test]
    fn rejects_zero_dimensions() {
        assert!(matches!(
            Frame::new(1, 0, 4, PixelFormat::Rgb24, Vec::new()),
            Err(FrameError::EmptyDimensions { .. })
        ));
    }

    #[test]
    fn bgr_pixels_read_back_as_rgb() {
        let frame = Frame::new(7, 1, 1, PixelFormat::Bgr24, vec![10, 20, 30]).unwrap();
        assert_eq!(frame.pixel(0, 0), Some([30, 20, 10]));
        assert_eq!(frame.to_rgb_image().get_pixel(0, 0).0, [30, 20, 10]);
        assert_eq!(frame.pixel(1, 0), None);
    }

    #[test]
    fn derived_frames_keep_origin_sequence() {
        let origin = Frame::solid(42, 2, 2, [1, 2, 3]).unwrap();
        let derived = Frame::from_rgb_image(&origin, RgbImage::new(4, 4));
        assert_eq!(derived.sequence(), 42);
        assert_eq!(derived.width(), 4);
        assert_eq!(derived.timestamp, origin.timestamp);
        // Origin is untouched by the derivation.
        assert_eq!(origin.pixel(1, 1), Some([1, 2, 3]));
    }
}
