use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};

use visor::capture::{CaptureSettings, CaptureSource, CaptureStage, TestPattern};
use visor::inference::{Detection, InferenceEngine, InferenceSettings, InferenceStage, MotionEngine};
use visor::pipeline::{LatestFrameSlot, PipelineEvent, PipelineSettings, StageState};
use visor::{Frame, Pipeline, PipelineError, StageKind};

#[derive(Default)]
struct Calls {
    opens: AtomicU32,
    reads: AtomicU32,
    closes: AtomicU32,
}

impl Calls {
    fn get(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }
}

/// Wraps another source and counts every call into it.
struct Counting<S> {
    inner: S,
    calls: Arc<Calls>,
}

impl<S: CaptureSource> CaptureSource for Counting<S> {
    fn describe(&self) -> String {
        format!("counting {}", self.inner.describe())
    }

    fn open(&mut self) -> Result<()> {
        self.calls.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.open()
    }

    fn read(&mut self) -> Result<Frame> {
        self.calls.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read()
    }

    fn close(&mut self) {
        self.calls.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close()
    }
}

/// Opens fine, then every read fails.
struct Broken;

impl CaptureSource for Broken {
    fn describe(&self) -> String {
        "broken".into()
    }
    fn open(&mut self) -> Result<()> {
        Ok(())
    }
    fn read(&mut self) -> Result<Frame> {
        Err(eyre!("VIDIOC_DQBUF: No such device"))
    }
    fn close(&mut self) {}
}

/// Refuses to open.
struct Unplugged;

impl CaptureSource for Unplugged {
    fn describe(&self) -> String {
        "/dev/video9".into()
    }
    fn open(&mut self) -> Result<()> {
        Err(eyre!("No such file or directory"))
    }
    fn read(&mut self) -> Result<Frame> {
        Err(eyre!("not open"))
    }
    fn close(&mut self) {}
}

/// Engine that counts calls and can be told to fail every inference.
struct Scripted {
    fail: bool,
    infers: Arc<AtomicU32>,
}

impl InferenceEngine for Scripted {
    fn describe(&self) -> String {
        "scripted".into()
    }
    fn load(&mut self) -> Result<()> {
        Ok(())
    }
    fn input_size(&self) -> (u32, u32) {
        (2, 2)
    }
    fn infer(&mut self, _input: &Frame) -> Result<Vec<Detection>> {
        self.infers.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(eyre!("output tensor has wrong rank"))
        } else {
            Ok(Vec::new())
        }
    }
}

/// Opens fine, but every read takes far longer than a frame interval.
struct Sluggish {
    read_time: Duration,
}

impl CaptureSource for Sluggish {
    fn describe(&self) -> String {
        "sluggish".into()
    }
    fn open(&mut self) -> Result<()> {
        Ok(())
    }
    fn read(&mut self) -> Result<Frame> {
        thread::sleep(self.read_time);
        Ok(Frame::blank(2, 2)?)
    }
    fn close(&mut self) {}
}

/// Survives warm-up, then panics on the first real frame.
struct Explosive {
    infers: u32,
}

impl InferenceEngine for Explosive {
    fn describe(&self) -> String {
        "explosive".into()
    }
    fn load(&mut self) -> Result<()> {
        Ok(())
    }
    fn input_size(&self) -> (u32, u32) {
        (2, 2)
    }
    fn infer(&mut self, _input: &Frame) -> Result<Vec<Detection>> {
        self.infers += 1;
        if self.infers > 1 {
            panic!("kernel index out of bounds");
        }
        Ok(Vec::new())
    }
}

fn counting(source: impl CaptureSource) -> (Box<dyn CaptureSource>, Arc<Calls>) {
    let calls = Arc::new(Calls::default());
    let source = Counting {
        inner: source,
        calls: calls.clone(),
    };
    (Box::new(source), calls)
}

fn errors(events: &[PipelineEvent]) -> Vec<PipelineError> {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::Error { error, .. } => Some(error.clone()),
            _ => None,
        })
        .collect()
}

fn count(events: &[PipelineEvent], pred: impl Fn(&PipelineEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

fn is_raw(e: &PipelineEvent) -> bool {
    matches!(e, PipelineEvent::RawFrame(_))
}

fn is_annotated(e: &PipelineEvent) -> bool {
    matches!(e, PipelineEvent::Annotated(_))
}

fn bound(elapsed: Duration, period: Duration) -> usize {
    (elapsed.as_secs_f64() / period.as_secs_f64()).ceil() as usize
}

#[test]
fn always_failing_source_stalls_after_101_reads() {
    let (source, calls) = counting(Broken);
    let slot = Arc::new(LatestFrameSlot::new());
    let (tx, rx) = flume::unbounded();
    let settings = CaptureSettings {
        failure_backoff: Duration::from_millis(1),
        ..CaptureSettings::default()
    };

    let mut handle = CaptureStage::spawn(source, slot.clone(), settings, tx).unwrap();
    assert_eq!(handle.wait(Duration::from_secs(5)), Ok(StageState::Error));

    assert_eq!(Calls::get(&calls.reads), 101);
    assert_eq!(Calls::get(&calls.closes), 1);
    assert!(slot.is_empty());

    let events: Vec<_> = rx.try_iter().collect();
    assert_eq!(
        errors(&events),
        vec![PipelineError::CaptureStalled { failures: 101 }]
    );
    assert_eq!(count(&events, is_raw), 0);
    assert!(matches!(
        events.last(),
        Some(PipelineEvent::Finished {
            stage: StageKind::Capture,
            state: StageState::Error
        })
    ));
}

#[test]
fn unopenable_source_stops_without_running() {
    let (source, calls) = counting(Unplugged);
    let (tx, rx) = flume::unbounded();

    let mut handle = CaptureStage::spawn(
        source,
        Arc::new(LatestFrameSlot::new()),
        CaptureSettings::default(),
        tx,
    )
    .unwrap();
    assert_eq!(handle.wait(Duration::from_secs(1)), Ok(StageState::Stopped));
    assert_eq!(Calls::get(&calls.reads), 0);
    // Released even though it never opened.
    assert_eq!(Calls::get(&calls.closes), 1);

    let events: Vec<_> = rx.try_iter().collect();
    assert!(matches!(
        errors(&events).as_slice(),
        [PipelineError::SourceUnavailable { source_name, .. }] if source_name.contains("/dev/video9")
    ));
}

#[test]
fn raw_emissions_respect_ui_period() {
    let period = Duration::from_millis(30);
    let slot = Arc::new(LatestFrameSlot::new());
    let (tx, rx) = flume::unbounded();
    let source = Box::new(TestPattern::new(4, 4, Duration::from_millis(2), [5, 5, 5]));
    let settings = CaptureSettings {
        ui_period: period,
        ..CaptureSettings::default()
    };

    let started = Instant::now();
    let mut handle = CaptureStage::spawn(source, slot.clone(), settings, tx).unwrap();
    thread::sleep(Duration::from_millis(300));
    handle.request_stop();
    assert_eq!(handle.wait(Duration::from_secs(1)), Ok(StageState::Stopped));
    let elapsed = started.elapsed();

    let events: Vec<_> = rx.try_iter().collect();
    let raw = count(&events, is_raw);
    assert!(raw >= 1);
    assert!(raw <= bound(elapsed, period), "{} raw in {:?}", raw, elapsed);
    // Every captured frame reached the slot, far more than were displayed.
    assert!(slot.stats().frames_written as usize > raw);

    let sequences: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::RawFrame(frame) => Some(frame.sequence()),
            _ => None,
        })
        .collect();
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn annotated_emissions_respect_inference_period() {
    let period = Duration::from_millis(40);
    let slot = Arc::new(LatestFrameSlot::new());
    slot.write(Frame::solid(1, 2, 2, [0, 255, 0]).unwrap());
    let (tx, rx) = flume::unbounded();
    let infers = Arc::new(AtomicU32::new(0));
    let engine = Box::new(Scripted {
        fail: false,
        infers: infers.clone(),
    });
    let settings = InferenceSettings {
        period,
        ..InferenceSettings::default()
    };

    let started = Instant::now();
    let mut handle = InferenceStage::spawn(engine, slot, settings, tx).unwrap();
    thread::sleep(Duration::from_millis(400));
    handle.request_stop();
    assert_eq!(handle.wait(Duration::from_secs(1)), Ok(StageState::Stopped));
    let elapsed = started.elapsed();

    let events: Vec<_> = rx.try_iter().collect();
    let annotated = count(&events, is_annotated);
    assert!(annotated >= 5, "only {} annotated", annotated);
    assert!(annotated <= bound(elapsed, period));
    // Warm-up plus one call per emitted result.
    assert_eq!(infers.load(Ordering::SeqCst) as usize, annotated + 1);
}

#[test]
fn empty_slot_never_reaches_the_engine() {
    let (tx, rx) = flume::unbounded();
    let infers = Arc::new(AtomicU32::new(0));
    let engine = Box::new(Scripted {
        fail: false,
        infers: infers.clone(),
    });
    let settings = InferenceSettings {
        period: Duration::from_millis(10),
        ..InferenceSettings::default()
    };

    let mut handle =
        InferenceStage::spawn(engine, Arc::new(LatestFrameSlot::new()), settings, tx).unwrap();
    thread::sleep(Duration::from_millis(150));
    handle.request_stop();
    assert_eq!(handle.wait(Duration::from_secs(1)), Ok(StageState::Stopped));

    let events: Vec<_> = rx.try_iter().collect();
    assert_eq!(count(&events, is_annotated), 0);
    assert_eq!(infers.load(Ordering::SeqCst), 1);
}

#[test]
fn failing_warm_up_is_model_unusable() {
    let slot = Arc::new(LatestFrameSlot::new());
    slot.write(Frame::solid(1, 2, 2, [0, 0, 0]).unwrap());
    let (tx, rx) = flume::unbounded();
    let infers = Arc::new(AtomicU32::new(0));
    let engine = Box::new(Scripted {
        fail: true,
        infers: infers.clone(),
    });

    let mut handle =
        InferenceStage::spawn(engine, slot.clone(), InferenceSettings::default(), tx).unwrap();
    assert_eq!(handle.wait(Duration::from_secs(1)), Ok(StageState::Stopped));

    // Only the synthetic warm-up input was ever inferred.
    assert_eq!(infers.load(Ordering::SeqCst), 1);
    assert_eq!(slot.stats().frames_read, 0);

    let events: Vec<_> = rx.try_iter().collect();
    assert!(matches!(
        errors(&events).as_slice(),
        [PipelineError::ModelUnusable { model, .. }] if model == "scripted"
    ));
    assert_eq!(count(&events, is_annotated), 0);
}

#[test]
fn concurrent_shutdown_releases_source_once() {
    let (source, calls) = counting(TestPattern::new(8, 8, Duration::from_millis(5), [3, 2, 1]));
    let engine = Box::new(MotionEngine::new(8, 8));
    let (pipeline, events) = Pipeline::start(PipelineSettings::default(), source, engine).unwrap();
    let pipeline = Arc::new(pipeline);
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    let callers: Vec<_> = (0..2)
        .map(|_| {
            let pipeline = pipeline.clone();
            thread::spawn(move || pipeline.shutdown())
        })
        .collect();
    let reports: Vec<_> = callers.into_iter().map(|c| c.join().unwrap()).collect();
    assert!(started.elapsed() < Duration::from_millis(1500));

    assert_eq!(reports[0], reports[1]);
    assert!(reports[0].is_clean());
    assert_eq!(reports[0].capture, Some(StageState::Stopped));
    assert_eq!(reports[0].inference, Some(StageState::Stopped));

    // A third call after the fact changes nothing either.
    assert_eq!(pipeline.shutdown(), reports[0]);
    drop(pipeline);

    assert_eq!(Calls::get(&calls.opens), 1);
    assert_eq!(Calls::get(&calls.closes), 1);

    let events: Vec<_> = events.try_iter().collect();
    assert_eq!(
        count(&events, |e| matches!(e, PipelineEvent::Finished { .. })),
        2
    );
    assert!(errors(&events).is_empty());
}

#[test]
fn capture_stall_stops_inference_too() {
    let settings = PipelineSettings {
        capture: CaptureSettings {
            failure_backoff: Duration::from_millis(1),
            ..CaptureSettings::default()
        },
        ..PipelineSettings::default()
    };
    let (pipeline, events) =
        Pipeline::start(settings, Box::new(Broken), Box::new(MotionEngine::new(2, 2))).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !pipeline.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(pipeline.capture_state(), StageState::Error);
    assert_eq!(pipeline.inference_state(), StageState::Stopped);

    let report = pipeline.shutdown();
    assert!(report.is_clean());
    let events: Vec<_> = events.try_iter().collect();
    assert_eq!(
        errors(&events),
        vec![PipelineError::CaptureStalled { failures: 101 }]
    );
}

#[test]
fn end_to_end_rates() {
    let settings = PipelineSettings {
        capture: CaptureSettings {
            ui_period: Duration::from_millis(66),
            ..CaptureSettings::default()
        },
        inference: InferenceSettings {
            period: Duration::from_millis(166),
            ..InferenceSettings::default()
        },
        ..PipelineSettings::default()
    };
    let source = Box::new(TestPattern::new(2, 2, Duration::from_millis(10), [200, 0, 0]));
    let engine = Box::new(MotionEngine::new(2, 2));

    let (pipeline, events) = Pipeline::start(settings, source, engine).unwrap();
    thread::sleep(Duration::from_secs(1));
    let report = pipeline.shutdown();
    assert!(report.is_clean());

    let events: Vec<_> = events.try_iter().collect();
    let raw = count(&events, is_raw);
    let annotated = count(&events, is_annotated);
    assert!((14..=16).contains(&raw), "{} raw events", raw);
    assert!((5..=7).contains(&annotated), "{} annotated events", annotated);

    for event in &events {
        if let PipelineEvent::Annotated(result) = event {
            assert_eq!((result.frame.width(), result.frame.height()), (2, 2));
            assert!(result.detections.is_empty());
        }
    }
}

#[test]
fn engine_panic_stops_capture() {
    let source = Box::new(TestPattern::new(2, 2, Duration::from_millis(5), [9, 9, 9]));
    let engine = Box::new(Explosive { infers: 0 });
    let (pipeline, events) =
        Pipeline::start(PipelineSettings::default(), source, engine).unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    while !pipeline.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(pipeline.inference_state(), StageState::Error);
    assert_eq!(pipeline.capture_state(), StageState::Stopped);

    let report = pipeline.shutdown();
    assert!(report.is_clean());
    assert_eq!(report.inference, Some(StageState::Error));

    let events: Vec<_> = events.try_iter().collect();
    assert_eq!(
        errors(&events),
        vec![PipelineError::StagePanicked {
            stage: StageKind::Inference
        }]
    );
    assert_eq!(
        count(&events, |e| matches!(e, PipelineEvent::Finished { .. })),
        2
    );
}

#[test]
fn slow_stage_misses_grace_and_is_reported() {
    let grace = Duration::from_millis(100);
    let settings = PipelineSettings {
        shutdown_grace: grace,
        ..PipelineSettings::default()
    };
    let source = Box::new(Sluggish {
        read_time: Duration::from_millis(600),
    });
    let (pipeline, events) =
        Pipeline::start(settings, source, Box::new(MotionEngine::new(2, 2))).unwrap();
    thread::sleep(Duration::from_millis(50));

    let report = pipeline.shutdown();
    assert_eq!(report.capture, None);
    assert_eq!(report.inference, Some(StageState::Stopped));
    assert_eq!(
        report.warnings,
        vec![PipelineError::ShutdownTimeout {
            stage: StageKind::Capture,
            grace
        }]
    );
    assert!(!report.is_clean());
    assert!(report.warnings.iter().all(|w| !w.is_fatal()));
    // Bounded by the grace of each stage, not by the stuck read.
    assert!(report.elapsed < Duration::from_millis(450), "{:?}", report.elapsed);

    let started = Instant::now();
    assert_eq!(pipeline.shutdown(), report);
    assert!(started.elapsed() < Duration::from_millis(50));

    let events: Vec<_> = events.try_iter().collect();
    assert!(events.iter().any(|e| matches!(
        e,
        PipelineEvent::Error {
            stage: StageKind::Capture,
            error: PipelineError::ShutdownTimeout { .. }
        }
    )));
}
