use anyhow::{Context, Result};
use camola_backdrop::capture::TestPatternTrack;
use camola_backdrop::gpu::software_context_factory;
use camola_backdrop::output::{NullOutput, WriterSink};
use camola_backdrop::transformer::FrameObserver;
use camola_backdrop::{
    Config, Effect, FrameProcessingStats, ProcessingPipeline, TrackSink, VideoTrack,
};
use clap::Parser;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input webcam device index
    #[arg(short, long, default_value_t = 0)]
    input_device: u32,

    /// Output v4l2loopback device path
    #[arg(short, long, default_value = "/dev/video10")]
    output_device: String,

    /// Use a synthetic test pattern instead of the webcam
    #[arg(long)]
    test_pattern: bool,

    /// Discard output frames instead of writing to v4l2loopback
    #[arg(long)]
    null_output: bool,

    /// Capture resolution width
    #[arg(long, default_value_t = 1280)]
    capture_width: u32,

    /// Capture resolution height
    #[arg(long, default_value_t = 720)]
    capture_height: u32,

    /// Capture frames per second
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Background effect
    #[arg(long, value_enum)]
    effect: Option<Effect>,

    /// Blur radius (5-25)
    #[arg(long)]
    blur_radius: Option<u32>,

    /// Background image for the virtual background effect
    #[arg(long)]
    background: Option<String>,

    /// Frame rate cap when the track has to be polled
    #[arg(long)]
    max_fps: Option<u32>,

    /// Path to segmentation model (ONNX file)
    #[arg(long)]
    model: Option<PathBuf>,

    /// Composite on the CPU instead of a GPU adapter
    #[arg(long)]
    software_gpu: bool,

    /// JSON settings file; command line flags take precedence
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(effect) = self.effect {
            config.effect = effect;
        }
        if let Some(radius) = self.blur_radius {
            config.blur_radius = radius;
        }
        if let Some(background) = &self.background {
            config.image_path = Some(background.clone());
        }
        if let Some(max_fps) = self.max_fps {
            config.max_fps = max_fps;
        }
        if let Some(model) = &self.model {
            config.assets.model = model.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let config = args.config()?;

    tracing::info!("Camola backdrop starting");
    tracing::info!("Capture: {}x{} @ {} fps", args.capture_width, args.capture_height, args.fps);
    tracing::info!("Effect: {:?}, blur radius {}", config.effect, config.blur_radius);

    let track = open_track(&args)?;
    let sink = open_sink(&args)?;

    let mut options = config.transformer_options();
    options.on_frame_processed = Some(stats_logger());

    let mut pipeline = ProcessingPipeline::new(config.pipeline_config(), options);
    if args.software_gpu {
        tracing::info!("Compositing on the CPU");
        pipeline = pipeline.with_gpu_factory(software_context_factory());
    }
    pipeline
        .init(track, sink)
        .await
        .context("Failed to start processing pipeline")?;

    if let Some(reason) = pipeline.disabled_reason() {
        tracing::warn!("Running in passthrough mode: {}", reason);
    }
    tracing::info!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    tracing::info!("Shutting down");
    pipeline.destroy().await;
    Ok(())
}

fn open_track(args: &Args) -> Result<Box<dyn VideoTrack>> {
    if args.test_pattern {
        tracing::info!("Using synthetic test pattern");
        let track = TestPatternTrack::new(args.capture_width, args.capture_height)
            .with_frame_rate(f64::from(args.fps));
        return Ok(Box::new(track));
    }
    open_webcam(args)
}

#[cfg(feature = "camera")]
fn open_webcam(args: &Args) -> Result<Box<dyn VideoTrack>> {
    let capture = camola_backdrop::capture::WebcamCapture::new(
        args.input_device,
        args.capture_width,
        args.capture_height,
        args.fps,
    )
    .context("Failed to initialize webcam capture")?;
    Ok(Box::new(capture))
}

#[cfg(not(feature = "camera"))]
fn open_webcam(args: &Args) -> Result<Box<dyn VideoTrack>> {
    anyhow::bail!(
        "webcam {} requested but built without the `camera` feature; use --test-pattern",
        args.input_device
    )
}

fn open_sink(args: &Args) -> Result<Box<dyn TrackSink>> {
    if args.null_output {
        let output = NullOutput::new(args.capture_width, args.capture_height);
        return Ok(Box::new(WriterSink::new(output)));
    }
    open_loopback(args)
}

#[cfg(feature = "camera")]
fn open_loopback(args: &Args) -> Result<Box<dyn TrackSink>> {
    let output = camola_backdrop::output::V4L2Output::new(
        &args.output_device,
        args.capture_width,
        args.capture_height,
    )
    .context("Failed to initialize v4l2loopback output")?;
    Ok(Box::new(WriterSink::new(output)))
}

#[cfg(not(feature = "camera"))]
fn open_loopback(args: &Args) -> Result<Box<dyn TrackSink>> {
    anyhow::bail!(
        "{} requested but built without the `camera` feature; use --null-output",
        args.output_device
    )
}

/// Running totals behind the stats log.
#[derive(Debug, Default)]
struct FrameTimings {
    frames: u64,
    segment_ms: f64,
    filter_ms: f64,
    total_ms: f64,
}

impl FrameTimings {
    fn record(&mut self, stats: &FrameProcessingStats) {
        self.frames += 1;
        self.segment_ms += stats.segmentation_time_ms;
        self.filter_ms += stats.filter_time_ms;
        self.total_ms += stats.processing_time_ms;
    }

    /// Mean segment, filter and total time per frame.
    fn averages(&self) -> (f64, f64, f64) {
        if self.frames == 0 {
            return (0.0, 0.0, 0.0);
        }
        let n = self.frames as f64;
        (self.segment_ms / n, self.filter_ms / n, self.total_ms / n)
    }
}

/// Log averaged frame timings every 30 frames.
fn stats_logger() -> FrameObserver {
    let timings = Mutex::new(FrameTimings::default());
    Arc::new(move |stats: &FrameProcessingStats| {
        let mut timings = timings.lock();
        timings.record(stats);
        if timings.frames % 30 == 0 {
            let (segment, filter, total) = timings.averages();
            let fps = if total > 0.0 { 1000.0 / total } else { 0.0 };
            tracing::info!(
                "Frame {}: avg segment={:.1}ms, filter={:.1}ms, total={:.1}ms ({:.1} fps)",
                timings.frames,
                segment,
                filter,
                total,
                fps
            );
        }
    })
}
