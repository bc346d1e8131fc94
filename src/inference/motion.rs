//! Built-in frame-difference detector

use color_eyre::{eyre::eyre, Result};
use tracing::debug;

use super::engine::{BoundingBox, Detection, InferenceEngine};
use crate::Frame;

/// Luma change that counts a pixel as moving.
const PIXEL_DELTA: u8 = 25;
/// Fraction of changed pixels below which a difference is treated as noise.
const MIN_CHANGED_FRACTION: f32 = 0.001;

/// Reports one box around every pixel whose brightness changed since the
/// previous frame.
pub struct MotionEngine {
    width: u32,
    height: u32,
    previous: Option<Vec<u8>>,
    loaded: bool,
}

impl MotionEngine {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            previous: None,
            loaded: false,
        }
    }

    fn luma(frame: &Frame) -> Vec<u8> {
        let mut luma = Vec::with_capacity(frame.width() as usize * frame.height() as usize);
        for y in 0..frame.height() {
            for x in 0..frame.width() {
                let [r, g, b] = frame.pixel(x, y).unwrap_or([0, 0, 0]);
                luma.push(((r as u32 * 77 + g as u32 * 150 + b as u32 * 29) >> 8) as u8);
            }
        }
        luma
    }
}

impl InferenceEngine for MotionEngine {
    fn describe(&self) -> String {
        "builtin:motion".to_string()
    }

    fn load(&mut self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(eyre!("motion input size must be non-zero"));
        }
        self.loaded = true;
        self.previous = None;
        Ok(())
    }

    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn infer(&mut self, input: &Frame) -> Result<Vec<Detection>> {
        if !self.loaded {
            return Err(eyre!("motion engine used before load"));
        }
        if (input.width(), input.height()) != (self.width, self.height) {
            return Err(eyre!(
                "input is {}x{}, engine expects {}x{}",
                input.width(),
                input.height(),
                self.width,
                self.height
            ));
        }

        let current = Self::luma(input);
        let detections = match self.previous.take() {
            Some(previous) => changed_region(&previous, &current, self.width as usize)
                .into_iter()
                .collect(),
            None => Vec::new(),
        };
        self.previous = Some(current);
        Ok(detections)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = Frame::blank(self.width, self.height)?;
        self.infer(&blank)?;
        // The blank frame must not become the motion baseline.
        self.previous = None;
        Ok(())
    }
}

fn changed_region(previous: &[u8], current: &[u8], width: usize) -> Option<Detection> {
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (usize::MAX, usize::MAX, 0, 0);
    let mut changed = 0usize;
    for (idx, (&a, &b)) in previous.iter().zip(current).enumerate() {
        if a.abs_diff(b) >= PIXEL_DELTA {
            let (x, y) = (idx % width, idx / width);
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
            changed += 1;
        }
    }

    let fraction = changed as f32 / current.len().max(1) as f32;
    if changed == 0 || fraction < MIN_CHANGED_FRACTION {
        return None;
    }
    debug!("Motion over {:.2}% of the frame", fraction * 100.0);

    Some(Detection {
        class_id: 0,
        label: "motion".to_string(),
        score: fraction.min(1.0),
        bbox: BoundingBox {
            x: min_x as f32,
            y: min_y as f32,
            width: (max_x - min_x + 1) as f32,
            height: (max_y - min_y + 1) as f32,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;

    fn frame_with_square(size: u32, square: Option<(u32, u32, u32)>) -> Frame {
        let mut data = vec![0u8; (size * size * 3) as usize];
        if let Some((sx, sy, side)) = square {
            for y in sy..sy + side {
                for x in sx..sx + side {
                    let idx = ((y * size + x) * 3) as usize;
                    data[idx..idx + 3].copy_from_slice(&[255, 255, 255]);
                }
            }
        }
        Frame::new(1, size, size, PixelFormat::Rgb24, data).unwrap()
    }

    #[test]
    fn boxes_the_changed_region() {
        let mut engine = MotionEngine::new(32, 32);
        engine.load().unwrap();
        engine.warm_up().unwrap();

        assert!(engine.infer(&frame_with_square(32, None)).unwrap().is_empty());
        let detections = engine
            .infer(&frame_with_square(32, Some((4, 8, 6))))
            .unwrap();

        assert_eq!(detections.len(), 1);
        let bbox = detections[0].bbox;
        assert_eq!((bbox.x, bbox.y, bbox.width, bbox.height), (4.0, 8.0, 6.0, 6.0));
        assert_eq!(detections[0].label, "motion");
    }

    #[test]
    fn static_scene_reports_nothing() {
        let mut engine = MotionEngine::new(16, 16);
        engine.load().unwrap();
        let frame = frame_with_square(16, Some((2, 2, 4)));
        assert!(engine.infer(&frame).unwrap().is_empty());
        assert!(engine.infer(&frame).unwrap().is_empty());
    }

    #[test]
    fn warm_up_does_not_become_baseline() {
        let mut engine = MotionEngine::new(16, 16);
        engine.load().unwrap();
        engine.warm_up().unwrap();
        // First real frame differs from the blank warm-up input but has no predecessor.
        let lit = frame_with_square(16, Some((0, 0, 16)));
        assert!(engine.infer(&lit).unwrap().is_empty());
    }

    #[test]
    fn rejects_wrong_size_and_unloaded_use() {
        let mut engine = MotionEngine::new(16, 16);
        assert!(engine.infer(&frame_with_square(16, None)).is_err());
        engine.load().unwrap();
        assert!(engine.infer(&frame_with_square(8, None)).is_err());
    }
}
