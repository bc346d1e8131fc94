//! Frame → engine input conversion

use image::imageops::{self, FilterType};

use crate::Frame;

/// Resize `frame` to the engine input shape, normalised to RGB24.
///
/// Frames that already match are returned as-is (cheap clone).
pub fn prepare(frame: &Frame, width: u32, height: u32) -> Frame {
    if frame.width() == width && frame.height() == height && frame.is_rgb() {
        return frame.clone();
    }

    let image = frame.to_rgb_image();
    let resized = if (image.width(), image.height()) == (width, height) {
        image
    } else {
        imageops::resize(&image, width, height, FilterType::Triangle)
    };
    Frame::from_rgb_image(frame, resized)
}

/// Planar `[1, 3, H, W]` tensor data in `0.0..=1.0`, the layout YOLO exports expect.
pub fn to_nchw_f32(frame: &Frame) -> Vec<f32> {
    let (width, height) = (frame.width() as usize, frame.height() as usize);
    let plane = width * height;
    let mut out = vec![0f32; plane * 3];

    for y in 0..height {
        for x in 0..width {
            let [r, g, b] = frame.pixel(x as u32, y as u32).unwrap_or([0, 0, 0]);
            let idx = y * width + x;
            out[idx] = r as f32 / 255.0;
            out[plane + idx] = g as f32 / 255.0;
            out[2 * plane + idx] = b as f32 / 255.0;
        }
    }
    out
}
