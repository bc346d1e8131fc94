//! Box overlays on the engine input

use image::{Rgb, RgbImage};

use super::engine::{BoundingBox, Detection};
use crate::Frame;

const LINE_WIDTH: i32 = 2;

/// Distinct colours cycled by class id.
const PALETTE: [[u8; 3]; 8] = [
    [255, 56, 56],
    [255, 157, 151],
    [255, 112, 31],
    [255, 178, 29],
    [207, 210, 49],
    [72, 249, 10],
    [26, 147, 52],
    [0, 194, 255],
];

pub fn class_color(class_id: u32) -> Rgb<u8> {
    Rgb(PALETTE[class_id as usize % PALETTE.len()])
}

/// New frame with one outlined box per detection. `input` is left untouched.
pub fn render(input: &Frame, detections: &[Detection]) -> Frame {
    let mut image = input.to_rgb_image();
    for detection in detections {
        draw_box(&mut image, &detection.bbox, class_color(detection.class_id));
    }
    Frame::from_rgb_image(input, image)
}

fn draw_box(image: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let edges = [bbox.x, bbox.y, bbox.x + bbox.width, bbox.y + bbox.height];
    if edges.iter().any(|v| !v.is_finite()) {
        return;
    }
    // Off-image edges stay off-image but small enough for i32 arithmetic.
    let margin = (LINE_WIDTH + 1) as f32;
    let clamp = |v: f32, dim: u32| v.round().clamp(-margin, dim as f32 + margin) as i32;
    let left = clamp(edges[0], image.width());
    let top = clamp(edges[1], image.height());
    let right = clamp(edges[2], image.width()) - 1;
    let bottom = clamp(edges[3], image.height()) - 1;

    for inset in 0..LINE_WIDTH {
        if left + inset > right - inset || top + inset > bottom - inset {
            break;
        }
        draw_rectangle(
            image,
            left + inset,
            top + inset,
            right - inset,
            bottom - inset,
            color,
        );
    }
}

fn draw_rectangle(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    if width == 0 || height == 0 || right < 0 || bottom < 0 || left >= width || top >= height {
        return;
    }

    let l = left.clamp(0, width - 1);
    let r = right.clamp(0, width - 1);
    let t = top.clamp(0, height - 1);
    let b = bottom.clamp(0, height - 1);

    for x in l..=r {
        if top >= 0 {
            image.put_pixel(x as u32, t as u32, color);
        }
        if bottom < height {
            image.put_pixel(x as u32, b as u32, color);
        }
    }
    for y in t..=b {
        if left >= 0 {
            image.put_pixel(l as u32, y as u32, color);
        }
        if right < width {
            image.put_pixel(r as u32, y as u32, color);
        }
    }
}
