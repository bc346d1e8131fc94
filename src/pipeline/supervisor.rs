//! Owns both stage lifecycles and the ordered shutdown
//!
//! Stage events flow through a router thread on their way to the display so
//! the supervisor can react to fatal errors (stopping the sibling stage)
//! without the display having to know about stage wiring.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use tracing::{error, info, instrument, warn};

use crate::capture::{CaptureSettings, CaptureSource, CaptureStage};
use crate::error::PipelineError;
use crate::inference::{InferenceEngine, InferenceSettings, InferenceStage};
use crate::pipeline::event::PipelineEvent;
use crate::pipeline::slot::{LatestFrameSlot, SlotStats};
use crate::pipeline::stage::{StageControl, StageHandle, StageKind, StageState};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub capture: CaptureSettings,
    pub inference: InferenceSettings,
    /// How long shutdown waits for each stage.
    pub shutdown_grace: Duration,
    /// Stop the other stage once one stage fails fatally.
    pub stop_sibling_on_error: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            capture: CaptureSettings::default(),
            inference: InferenceSettings::default(),
            shutdown_grace: Duration::from_millis(1500),
            stop_sibling_on_error: true,
        }
    }
}

/// Outcome of [`Pipeline::shutdown`]
///
/// A stage state is `None` when the stage missed its grace period; the
/// matching `ShutdownTimeout` is in `warnings`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub capture: Option<StageState>,
    pub inference: Option<StageState>,
    pub warnings: Vec<PipelineError>,
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

struct Running {
    capture: StageHandle,
    inference: StageHandle,
    router: Option<JoinHandle<()>>,
}

enum Lifecycle {
    Running(Running),
    Shutdown(ShutdownReport),
}

/// A running capture + inference pair sharing one frame slot
pub struct Pipeline {
    slot: Arc<LatestFrameSlot>,
    capture: Arc<StageControl>,
    inference: Arc<StageControl>,
    events: Sender<PipelineEvent>,
    grace: Duration,
    lifecycle: Mutex<Lifecycle>,
}

impl Pipeline {
    /// Spawn both stages and the event router.
    ///
    /// The returned receiver carries every raw frame, annotated frame, error
    /// and completion event. Sending on it never blocks a stage.
    #[instrument(skip_all, fields(source = %source.describe(), model = %engine.describe()))]
    pub fn start(
        settings: PipelineSettings,
        source: Box<dyn CaptureSource>,
        engine: Box<dyn InferenceEngine>,
    ) -> std::io::Result<(Self, Receiver<PipelineEvent>)> {
        let slot = Arc::new(LatestFrameSlot::new());
        let (stage_tx, stage_rx) = flume::unbounded();
        let (out_tx, out_rx) = flume::unbounded();

        let mut capture = CaptureStage::spawn(
            source,
            slot.clone(),
            settings.capture.clone(),
            stage_tx.clone(),
        )?;
        let inference = match InferenceStage::spawn(
            engine,
            slot.clone(),
            settings.inference.clone(),
            stage_tx,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                capture.request_stop();
                if capture.wait(settings.shutdown_grace).is_err() {
                    capture.detach();
                }
                return Err(e);
            }
        };

        let router = {
            let capture = capture.control();
            let inference = inference.control();
            let out = out_tx.clone();
            let stop_sibling = settings.stop_sibling_on_error;
            thread::Builder::new()
                .name("visor-router".into())
                .spawn(move || route(stage_rx, out, capture, inference, stop_sibling))
        };
        let router = match router {
            Ok(join) => join,
            Err(e) => {
                // Without the router nobody drains stage events; tear down what started.
                let mut running = Running {
                    capture,
                    inference,
                    router: None,
                };
                stop_and_wait(&mut running, settings.shutdown_grace);
                return Err(e);
            }
        };

        info!("Pipeline started");
        let pipeline = Self {
            slot,
            capture: capture.control(),
            inference: inference.control(),
            events: out_tx,
            grace: settings.shutdown_grace,
            lifecycle: Mutex::new(Lifecycle::Running(Running {
                capture,
                inference,
                router: Some(router),
            })),
        };
        Ok((pipeline, out_rx))
    }

    pub fn capture_state(&self) -> StageState {
        self.capture.state()
    }

    pub fn inference_state(&self) -> StageState {
        self.inference.state()
    }

    /// Both stages have reached `Stopped` or `Error`.
    pub fn is_finished(&self) -> bool {
        self.capture.state().is_terminal() && self.inference.state().is_terminal()
    }

    pub fn slot_stats(&self) -> SlotStats {
        self.slot.stats()
    }

    /// Ask both stages to stop without waiting. Safe to call from a UI callback.
    pub fn request_stop(&self) {
        self.capture.request_stop();
        self.inference.request_stop();
    }

    /// Stop both stages and wait up to the grace period for each.
    ///
    /// Idempotent: concurrent callers are serialized, and every call after the
    /// first returns the first call's report without touching the stages.
    pub fn shutdown(&self) -> ShutdownReport {
        let mut lifecycle = self.lock();
        let running = match &mut *lifecycle {
            Lifecycle::Shutdown(report) => return report.clone(),
            Lifecycle::Running(running) => running,
        };

        info!("Shutting down pipeline");
        let report = stop_and_wait(running, self.grace);
        for warning in &report.warnings {
            if let PipelineError::ShutdownTimeout { stage, .. } = warning {
                let _ = self.events.send(PipelineEvent::Error {
                    stage: *stage,
                    error: warning.clone(),
                });
            }
        }
        self.slot.clear();

        info!(
            "Pipeline shut down in {:?} (capture {:?}, inference {:?})",
            report.elapsed, report.capture, report.inference
        );
        *lifecycle = Lifecycle::Shutdown(report.clone());
        report
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        // A panic while holding the lock leaves the lifecycle usable.
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn stop_and_wait(running: &mut Running, grace: Duration) -> ShutdownReport {
    let started = Instant::now();
    running.capture.request_stop();
    running.inference.request_stop();

    let mut warnings = Vec::new();
    let mut wait = |handle: &mut StageHandle| match handle.wait(grace) {
        Ok(state) => Some(state),
        Err(e) => {
            warn!("{}; leaving it detached", e);
            handle.detach();
            warnings.push(e);
            None
        }
    };
    let capture = wait(&mut running.capture);
    let inference = wait(&mut running.inference);

    if let Some(router) = running.router.take() {
        if warnings.is_empty() {
            // Both stage threads are gone, so the router sees disconnect promptly.
            if router.join().is_err() {
                error!("Event router panicked");
            }
        }
    }

    ShutdownReport {
        capture,
        inference,
        warnings,
        elapsed: started.elapsed(),
    }
}

fn route(
    input: Receiver<PipelineEvent>,
    output: Sender<PipelineEvent>,
    capture: Arc<StageControl>,
    inference: Arc<StageControl>,
    stop_sibling: bool,
) {
    for event in input.iter() {
        if let PipelineEvent::Error { stage, error } = &event {
            if error.is_fatal() {
                error!("{} stage failed: {}", stage, error);
                if stop_sibling {
                    let sibling = match stage {
                        StageKind::Capture => &inference,
                        StageKind::Inference => &capture,
                    };
                    info!("Stopping {} stage after {} failure", sibling.kind(), stage);
                    sibling.request_stop();
                }
            }
        }
        // Display may already be gone; keep draining so stages never notice.
        let _ = output.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::TestPattern;
    use crate::inference::MotionEngine;

    fn quick_settings() -> PipelineSettings {
        PipelineSettings {
            capture: CaptureSettings {
                ui_period: Duration::from_millis(20),
                ..CaptureSettings::default()
            },
            inference: InferenceSettings {
                period: Duration::from_millis(30),
                ..InferenceSettings::default()
            },
            ..PipelineSettings::default()
        }
    }

    #[test]
    fn shutdown_is_idempotent() {
        let source = Box::new(TestPattern::new(8, 8, Duration::from_millis(5), [0, 0, 255]));
        let engine = Box::new(MotionEngine::new(8, 8));
        let (pipeline, events) = Pipeline::start(quick_settings(), source, engine).unwrap();

        thread::sleep(Duration::from_millis(100));
        let first = pipeline.shutdown();
        let second = pipeline.shutdown();

        assert_eq!(first.capture, Some(StageState::Stopped));
        assert_eq!(first.inference, Some(StageState::Stopped));
        assert!(first.is_clean());
        assert_eq!(first, second);
        assert!(pipeline.is_finished());
        // Capture outpaces inference, so most frames are overwritten unread.
        let stats = pipeline.slot_stats();
        assert!(stats.frames_written > stats.frames_read);
        assert!(stats.frames_superseded > 0);

        let finished = events
            .try_iter()
            .filter(|e| matches!(e, PipelineEvent::Finished { .. }))
            .count();
        assert_eq!(finished, 2);
    }

    #[test]
    fn fatal_model_error_stops_capture() {
        let source = Box::new(TestPattern::new(4, 4, Duration::from_millis(5), [1, 1, 1]));
        // Zero-sized motion engine refuses to load.
        let engine = Box::new(MotionEngine::new(0, 0));
        let (pipeline, events) = Pipeline::start(quick_settings(), source, engine).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !pipeline.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(pipeline.is_finished());
        assert_eq!(pipeline.capture_state(), StageState::Stopped);

        let report = pipeline.shutdown();
        assert!(report.is_clean());
        assert!(events.try_iter().any(|e| matches!(
            e,
            PipelineEvent::Error {
                stage: StageKind::Inference,
                error: PipelineError::ModelUnusable { .. }
            }
        )));
    }
}
