//! Stage lifecycle shared by the capture and inference loops
//!
//! A stage is one OS thread running a loop body. The supervisor talks to it
//! only through a [`StageHandle`]: a cooperative stop flag, an observable
//! [`StageState`], and a completion channel that fires exactly once when the
//! thread is about to exit.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::pipeline::event::PipelineEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Capture,
    Inference,
}

impl StageKind {
    pub fn label(self) -> &'static str {
        match self {
            StageKind::Capture => "capture",
            StageKind::Inference => "inference",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StageState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
    /// Terminal: the loop ended on an unrecoverable failure.
    Error = 4,
}

impl StageState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => StageState::Idle,
            1 => StageState::Running,
            2 => StageState::Stopping,
            3 => StageState::Stopped,
            _ => StageState::Error,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StageState::Stopped | StageState::Error)
    }
}

/// State and stop flag shared between a stage thread and its handle
#[derive(Debug)]
pub struct StageControl {
    kind: StageKind,
    state: AtomicU8,
    stop: AtomicBool,
}

impl StageControl {
    pub fn new(kind: StageKind) -> Self {
        Self {
            kind,
            state: AtomicU8::new(StageState::Idle as u8),
            stop: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn state(&self) -> StageState {
        StageState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Ask the loop to exit at its next check. Idempotent.
    pub fn request_stop(&self) {
        if !self.stop.swap(true, Ordering::AcqRel) {
            // Running -> Stopping; leave Idle and terminal states alone.
            let _ = self.state.compare_exchange(
                StageState::Running as u8,
                StageState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            debug!("Stop requested for {} stage", self.kind);
        }
    }

    /// Idle -> Running, unless a stop already arrived.
    pub(crate) fn enter_running(&self) -> bool {
        let entered = self
            .state
            .compare_exchange(
                StageState::Idle as u8,
                StageState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if entered && self.stop_requested() {
            self.state
                .store(StageState::Stopping as u8, Ordering::Release);
        }
        entered
    }

    pub(crate) fn set_state(&self, state: StageState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Context handed to a stage body running on its own thread
pub struct StageContext {
    pub control: Arc<StageControl>,
    events: Sender<PipelineEvent>,
}

impl StageContext {
    pub fn kind(&self) -> StageKind {
        self.control.kind()
    }

    pub fn should_run(&self) -> bool {
        !self.control.stop_requested()
    }

    /// Enqueue an event; never blocks. A gone receiver is not an error for the stage.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }

    pub fn report(&self, error: PipelineError) {
        warn!("{} stage: {}", self.kind(), error);
        self.emit(PipelineEvent::Error {
            stage: self.kind(),
            error,
        });
    }
}

/// Sends the terminal notification when the stage thread unwinds for any reason.
struct FinishGuard {
    control: Arc<StageControl>,
    events: Sender<PipelineEvent>,
    done: Sender<StageState>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let kind = self.control.kind();
        let panicking = thread::panicking();
        let state = match self.control.state() {
            StageState::Error => StageState::Error,
            _ if panicking => StageState::Error,
            _ => StageState::Stopped,
        };
        self.control.set_state(state);

        if panicking {
            warn!("{} stage panicked", kind);
            let _ = self.events.send(PipelineEvent::Error {
                stage: kind,
                error: PipelineError::StagePanicked { stage: kind },
            });
        }
        debug!("{} stage finished in state {:?}", kind, state);
        let _ = self.events.send(PipelineEvent::Finished { stage: kind, state });
        let _ = self.done.send(state);
    }
}

/// Supervisor-side handle to a running stage
pub struct StageHandle {
    control: Arc<StageControl>,
    done: Receiver<StageState>,
    join: Option<JoinHandle<()>>,
    final_state: Option<StageState>,
}

impl StageHandle {
    /// Spawn `body` on a named thread.
    ///
    /// The body owns its resources and returns when the loop ends; the
    /// terminal `Finished` event and completion signal are sent afterwards
    /// exactly once, even if the body panics.
    pub fn spawn<F>(kind: StageKind, events: Sender<PipelineEvent>, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(&StageContext) + Send + 'static,
    {
        let control = Arc::new(StageControl::new(kind));
        let (done_tx, done_rx) = flume::bounded(1);

        let thread_control = control.clone();
        let join = thread::Builder::new()
            .name(format!("visor-{}", kind))
            .spawn(move || {
                let _guard = FinishGuard {
                    control: thread_control.clone(),
                    events: events.clone(),
                    done: done_tx,
                };
                let ctx = StageContext {
                    control: thread_control,
                    events,
                };
                body(&ctx);
            })?;

        Ok(Self {
            control,
            done: done_rx,
            join: Some(join),
            final_state: None,
        })
    }

    pub fn kind(&self) -> StageKind {
        self.control.kind()
    }

    pub fn state(&self) -> StageState {
        self.control.state()
    }

    pub fn control(&self) -> Arc<StageControl> {
        self.control.clone()
    }

    pub fn request_stop(&self) {
        self.control.request_stop();
    }

    /// Wait up to `grace` for the stage to finish.
    ///
    /// On success the thread is joined. On timeout the thread is left detached
    /// and keeps its resources until its loop observes the stop flag.
    pub fn wait(&mut self, grace: Duration) -> Result<StageState, PipelineError> {
        if let Some(state) = self.final_state {
            return Ok(state);
        }

        let state = match self.done.recv_timeout(grace) {
            Ok(state) => state,
            Err(RecvTimeoutError::Timeout) => {
                return Err(PipelineError::ShutdownTimeout {
                    stage: self.kind(),
                    grace,
                })
            }
            // Sender dropped without sending: thread died before the guard existed.
            Err(RecvTimeoutError::Disconnected) => StageState::Error,
        };

        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("{} stage thread panicked", self.kind());
            }
        }
        self.final_state = Some(state);
        Ok(state)
    }

    /// Drop the join handle without waiting.
    pub fn detach(&mut self) {
        self.join.take();
    }
}
