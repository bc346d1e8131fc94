//! visor: live camera preview with a decoupled detection overlay

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use visor::capture::{CaptureSource, SourceDescriptor};
use visor::display::{headless, EventTally};
use visor::{Config, InferenceEngine, ModelDescriptor, Pipeline, ShutdownReport};

#[derive(Debug, Parser)]
#[command(name = "visor", version, about)]
struct Args {
    /// TOML configuration file layered over the built-in defaults
    #[arg(short, long, env = "VISOR_CONFIG")]
    config: Option<PathBuf>,

    /// Device path, `test://WxH@FPS[/RRGGBB]`, or a GStreamer launch line
    #[arg(short, long)]
    source: Option<String>,

    /// `builtin:motion` or a path to an ONNX model
    #[arg(short, long)]
    model: Option<String>,

    /// Run without a window, logging events instead
    #[arg(long)]
    headless: bool,

    /// Stop after this many seconds
    #[arg(short, long, value_parser = parse_seconds)]
    duration: Option<Duration>,
}

fn parse_seconds(input: &str) -> std::result::Result<Duration, String> {
    let secs: f64 = input.parse().map_err(|e| format!("{}", e))?;
    if !(secs.is_finite() && secs > 0.0) {
        return Err(format!("duration must be positive, got {}", secs));
    }
    Ok(Duration::from_secs_f64(secs))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("visor=debug"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

fn build_source(config: &Config) -> Result<Box<dyn CaptureSource>> {
    let descriptor = SourceDescriptor::parse(&config.capture.source)?;

    #[cfg(feature = "gstreamer-pipeline")]
    {
        if let SourceDescriptor::Device(path) = &descriptor {
            if config.gstreamer.prefer_pipeline {
                let decoder = config.gstreamer.jpeg_decoder.clone().unwrap_or_else(|| {
                    visor::capture::gst_capture::GstCapture::detect_jpeg_decoder().to_string()
                });
                let launch = visor::capture::source::mjpeg_pipeline(
                    &path.display().to_string(),
                    config.capture.width,
                    config.capture.height,
                    config.capture.fps,
                    &decoder,
                );
                info!("Opening {} through GStreamer", path.display());
                return SourceDescriptor::Pipeline(launch).build(&config.capture);
            }
        }
    }

    descriptor.build(&config.capture)
}

fn build_engine(config: &Config) -> Result<Box<dyn InferenceEngine>> {
    ModelDescriptor::parse(&config.inference.model)?.build(&config.inference)
}

fn summarize(tally: &EventTally, report: &ShutdownReport) {
    info!(
        "Shown {} raw and {} annotated frames, {} errors",
        tally.raw, tally.annotated, tally.errors
    );
    for warning in &report.warnings {
        warn!("{}", warning);
    }
}

#[cfg(feature = "sdl-display")]
fn run_window(
    config: &Config,
    pipeline: Arc<Pipeline>,
    events: flume::Receiver<visor::PipelineEvent>,
) -> Result<(EventTally, ShutdownReport)> {
    let sdl_context = sdl2::init().map_err(|e| eyre!(e))?;
    let mut window = visor::display::Sdl2Display::new(&sdl_context, &config.display)?;
    window.run(&sdl_context, &pipeline, events)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(source) = args.source {
        config.capture.source = source;
    }
    if let Some(model) = args.model {
        config.inference.model = model;
    }
    config.display.headless |= args.headless;
    config.validate()?;

    info!("visor launching: {} -> {}", config.capture.source, config.inference.model);

    let source = build_source(&config)?;
    let engine = build_engine(&config)?;
    let (pipeline, events) = Pipeline::start(config.pipeline_settings(), source, engine)
        .map_err(|e| eyre!("could not start pipeline threads: {}", e))?;
    let pipeline = Arc::new(pipeline);

    let (tally, report) = if config.display.headless {
        headless::run(pipeline, events, args.duration).await?
    } else {
        #[cfg(feature = "sdl-display")]
        {
            if args.duration.is_some() {
                warn!("--duration only applies to headless runs");
            }
            run_window(&config, pipeline, events)?
        }
        #[cfg(not(feature = "sdl-display"))]
        {
            warn!("Built without `sdl-display`; running headless");
            headless::run(pipeline, events, args.duration).await?
        }
    };

    summarize(&tally, &report);
    info!("visor shutting down");
    Ok(())
}
