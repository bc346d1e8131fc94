//! Capture loop: every frame feeds the slot, some frames reach the screen

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::capture::source::CaptureSource;
use crate::error::PipelineError;
use crate::pipeline::event::PipelineEvent;
use crate::pipeline::rate::{FailureCounter, RateLimiter};
use crate::pipeline::slot::LatestFrameSlot;
use crate::pipeline::stage::{StageContext, StageHandle, StageKind, StageState};

/// Timing knobs for the capture loop
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Minimum interval between raw preview emissions.
    pub ui_period: Duration,
    /// Consecutive failed reads tolerated before the stage gives up.
    pub failure_threshold: u32,
    /// Pause after a failed read.
    pub failure_backoff: Duration,
    /// Pin the capture thread to this CPU core.
    pub pin_core: Option<usize>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            ui_period: Duration::from_secs_f64(1.0 / 15.0),
            failure_threshold: 100,
            failure_backoff: Duration::from_millis(10),
            pin_core: None,
        }
    }
}

pub struct CaptureStage;

impl CaptureStage {
    /// Start the capture loop on its own thread.
    pub fn spawn(
        source: Box<dyn CaptureSource>,
        slot: Arc<LatestFrameSlot>,
        settings: CaptureSettings,
        events: flume::Sender<PipelineEvent>,
    ) -> std::io::Result<StageHandle> {
        StageHandle::spawn(StageKind::Capture, events, move |ctx| {
            run(ctx, source, &slot, &settings)
        })
    }
}

fn run(
    ctx: &StageContext,
    mut source: Box<dyn CaptureSource>,
    slot: &LatestFrameSlot,
    settings: &CaptureSettings,
) {
    if let Some(id) = settings.pin_core {
        if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
            warn!("Could not pin capture thread to core {}", id);
        }
    }

    let name = source.describe();
    if let Err(e) = source.open() {
        // Never entered Running; the guard records Stopped.
        source.close();
        ctx.report(PipelineError::SourceUnavailable {
            source_name: name,
            reason: format!("{:#}", e),
        });
        return;
    }

    ctx.control.enter_running();
    info!("Capturing from {}", name);

    let mut ui_gate = RateLimiter::new(settings.ui_period);
    let mut failures = FailureCounter::new(settings.failure_threshold);

    while ctx.should_run() {
        match source.read() {
            Ok(frame) => {
                failures.reset();
                metrics::counter!("capture_frames_total").increment(1);
                slot.write(frame.clone());

                if ui_gate.try_acquire(Instant::now()) {
                    metrics::counter!("raw_frames_emitted_total").increment(1);
                    ctx.emit(PipelineEvent::RawFrame(frame));
                }
            }
            Err(e) => {
                metrics::counter!("capture_read_failures_total").increment(1);
                let exceeded = failures.record_failure();
                debug!(
                    "Read failure {}/{} from {}: {:#}",
                    failures.count(),
                    failures.threshold(),
                    name,
                    e
                );

                thread::sleep(settings.failure_backoff);
                if exceeded {
                    ctx.control.set_state(StageState::Error);
                    ctx.report(PipelineError::CaptureStalled {
                        failures: failures.count(),
                    });
                    break;
                }
            }
        }
    }

    source.close();
    info!("Capture from {} ended", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::test_pattern::TestPattern;

    #[test]
    fn feeds_slot_and_stops_on_request() {
        let slot = Arc::new(LatestFrameSlot::new());
        let (tx, rx) = flume::unbounded();
        let source = Box::new(TestPattern::new(4, 4, Duration::from_millis(2), [1, 2, 3]));

        let mut handle =
            CaptureStage::spawn(source, slot.clone(), CaptureSettings::default(), tx).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(handle.state(), StageState::Running);

        handle.request_stop();
        assert_eq!(handle.wait(Duration::from_millis(500)), Ok(StageState::Stopped));

        let latest = slot.read_copy().unwrap();
        assert_eq!(latest.pixel(0, 0), Some([1, 2, 3]));
        assert!(slot.stats().frames_written > 1);

        // ~50ms at a 66ms UI period: the immediate first emission, maybe one more.
        let raw = rx
            .try_iter()
            .filter(|e| matches!(e, PipelineEvent::RawFrame(_)))
            .count();
        assert!((1..=2).contains(&raw), "raw emissions: {}", raw);
    }
}
