//! Synthetic capture source producing paced solid-colour frames

use std::thread;
use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};
use tracing::debug;

use super::frame::Frame;
use super::source::CaptureSource;

/// Emits a fixed solid-colour RGB frame every `interval`, the way a camera
/// delivers frames at its native rate.
pub struct TestPattern {
    width: u32,
    height: u32,
    interval: Duration,
    rgb: [u8; 3],
    sequence: u64,
    next_due: Option<Instant>,
    opened: bool,
}

impl TestPattern {
    pub fn new(width: u32, height: u32, interval: Duration, rgb: [u8; 3]) -> Self {
        Self {
            width,
            height,
            interval,
            rgb,
            sequence: 0,
            next_due: None,
            opened: false,
        }
    }
}

impl CaptureSource for TestPattern {
    fn describe(&self) -> String {
        format!("test pattern {}x{} every {:?}", self.width, self.height, self.interval)
    }

    fn open(&mut self) -> Result<()> {
        debug!("Opening {}", self.describe());
        self.opened = true;
        self.next_due = Some(Instant::now() + self.interval);
        Ok(())
    }

    fn read(&mut self) -> Result<Frame> {
        if !self.opened {
            return Err(eyre!("test pattern read before open"));
        }

        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            thread::sleep(due - now);
        }
        // Fall behind rather than burst when the reader was slow.
        let after = Instant::now();
        let next = due + self.interval;
        self.next_due = Some(if after > next { after + self.interval } else { next });

        self.sequence += 1;
        Ok(Frame::solid(self.sequence, self.width, self.height, self.rgb)?)
    }

    fn close(&mut self) {
        self.opened = false;
    }
}
