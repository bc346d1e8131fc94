//! Single-slot latest-frame handoff between capture and inference

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;

use crate::Frame;

/// Holds at most one frame: the newest one written.
///
/// Writes swap the whole frame in atomically, so a concurrent reader always
/// sees either the previous frame or the new one in full. Frames are immutable
/// and the reader receives its own handle, so it can never affect the
/// producer's copy. Unread frames are superseded, never queued.
pub struct LatestFrameSlot {
    current: ArcSwapOption<Frame>,

    /// Set on write, cleared by the first read of that frame.
    unread: AtomicBool,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicU64,
    frames_read: AtomicU64,
    frames_superseded: AtomicU64,
}

/// Snapshot of slot counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    pub frames_written: u64,
    pub frames_read: u64,
    /// Writes that replaced a frame nobody had read.
    pub frames_superseded: u64,
}

impl LatestFrameSlot {
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            unread: AtomicBool::new(false),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: replace the held frame unconditionally.
    pub fn write(&self, frame: Frame) {
        let previous = self.current.swap(Some(Arc::new(frame)));
        let was_unread = self.unread.swap(true, Ordering::AcqRel);
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);

        if previous.is_some() && was_unread {
            self.stats.frames_superseded.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("slot_frames_superseded_total").increment(1);
        }
    }

    /// Consumer: copy of the newest frame, or `None` before the first write.
    pub fn read_copy(&self) -> Option<Frame> {
        let guard = self.current.load();
        let frame = guard.as_deref().cloned()?;
        self.unread.store(false, Ordering::Release);
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_none()
    }

    /// Drop the held frame.
    pub fn clear(&self) {
        self.current.store(None);
        self.unread.store(false, Ordering::Release);
    }

    pub fn stats(&self) -> SlotStats {
        SlotStats {
            frames_written: self.stats.frames_written.load(Ordering::Relaxed),
            frames_read: self.stats.frames_read.load(Ordering::Relaxed),
            frames_superseded: self.stats.frames_superseded.load(Ordering::Relaxed),
        }
    }
}

impl Default for LatestFrameSlot {
    fn default() -> Self {
        Self::new()
    }
}
