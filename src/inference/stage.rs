//! Inference loop: fixed-cadence sampling of the newest captured frame

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use super::annotate;
use super::engine::{AnnotatedFrame, InferenceEngine};
use super::preprocess;
use crate::error::PipelineError;
use crate::pipeline::event::PipelineEvent;
use crate::pipeline::rate::RateLimiter;
use crate::pipeline::slot::LatestFrameSlot;
use crate::pipeline::stage::{StageContext, StageHandle, StageKind, StageState};

#[derive(Debug, Clone)]
pub struct InferenceSettings {
    /// Minimum interval between inference ticks.
    pub period: Duration,
    /// Sleep granularity while waiting for the next tick.
    pub idle_quantum: Duration,
    /// Sleep when a tick finds the slot empty.
    pub empty_wait: Duration,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            period: Duration::from_secs_f64(1.0 / 6.0),
            idle_quantum: Duration::from_millis(5),
            empty_wait: Duration::from_millis(10),
        }
    }
}

pub struct InferenceStage;

impl InferenceStage {
    /// Start the inference loop on its own thread.
    ///
    /// Loading and warm-up happen on that thread; the slot is not touched
    /// until both succeed.
    pub fn spawn(
        engine: Box<dyn InferenceEngine>,
        slot: Arc<LatestFrameSlot>,
        settings: InferenceSettings,
        events: flume::Sender<PipelineEvent>,
    ) -> std::io::Result<StageHandle> {
        StageHandle::spawn(StageKind::Inference, events, move |ctx| {
            run(ctx, engine, &slot, &settings)
        })
    }
}

fn run(
    ctx: &StageContext,
    mut engine: Box<dyn InferenceEngine>,
    slot: &LatestFrameSlot,
    settings: &InferenceSettings,
) {
    let model = engine.describe();
    let started = Instant::now();
    if let Err(e) = engine.load().and_then(|()| engine.warm_up()) {
        ctx.report(PipelineError::ModelUnusable {
            model,
            reason: format!("{:#}", e),
        });
        return;
    }
    info!("Model {} ready in {:?}", model, started.elapsed());

    ctx.control.enter_running();
    let (width, height) = engine.input_size();
    let mut ticker = RateLimiter::new(settings.period);

    while ctx.should_run() {
        let now = Instant::now();
        if !ticker.is_ready(now) {
            thread::sleep(settings.idle_quantum.min(ticker.remaining(now)));
            continue;
        }

        let Some(frame) = slot.read_copy() else {
            trace!("No frame yet");
            thread::sleep(settings.empty_wait);
            continue;
        };
        ticker.mark(Instant::now());

        let input = preprocess::prepare(&frame, width, height);
        let infer_start = Instant::now();
        match engine.infer(&input) {
            Ok(detections) => {
                let inference_time = infer_start.elapsed();
                metrics::histogram!("inference_time_us").record(inference_time.as_micros() as f64);
                debug!(
                    "Frame {}: {} detections in {:?}",
                    frame.sequence(),
                    detections.len(),
                    inference_time
                );

                let annotated = AnnotatedFrame {
                    frame: annotate::render(&input, &detections),
                    detections,
                    source_sequence: frame.sequence(),
                    inference_time,
                };
                metrics::counter!("annotated_frames_emitted_total").increment(1);
                ctx.emit(PipelineEvent::Annotated(annotated));
            }
            Err(e) => {
                ctx.control.set_state(StageState::Error);
                ctx.report(PipelineError::InferenceError(format!("{:#}", e)));
                break;
            }
        }
    }

    info!("Inference with {} ended", model);
}
