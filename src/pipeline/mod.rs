//! Lifecycle of one processed camera track.
//!
//! [`ProcessingPipeline`] owns the GPU device, the transformer and a single
//! worker task that pulls frames from the source, transforms them and
//! emits them on the processed track handed to the sink.

mod capabilities;
mod source;

pub use capabilities::{ExecutionPath, PlatformCapabilities};
pub use source::FrameSource;

use crate::capture::VideoTrack;
use crate::constants::{DEFAULT_MAX_FPS, OUTPUT_CHANNEL_CAPACITY};
use crate::errors::{PipelineError, TransformerError};
use crate::frame::Frame;
use crate::gpu::{wgpu_context_factory, GpuContextFactory};
use crate::output::{ProcessedTrack, TrackSink};
use crate::segmentation::{default_factory, SegmenterFactory};
use crate::transformer::{Effect, FrameTransformer, Transformer, TransformerOptions};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Uninitialized,
    Initializing,
    Running,
    Restarting,
    Destroyed,
}

/// Pipeline-level settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub effect: Effect,
    /// Frame rate cap for the polling path.
    pub max_fps: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            effect: Effect::default(),
            max_fps: DEFAULT_MAX_FPS,
        }
    }
}

type SharedTransformer = Arc<Mutex<Transformer>>;

/// The task moving frames from source to processed track.
struct Worker {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<FrameSource>,
}

impl Worker {
    fn spawn(source: FrameSource, transformer: SharedTransformer, output: mpsc::Sender<Frame>) -> Self {
        let (stop, stopped) = oneshot::channel();
        let handle = tokio::spawn(run_worker(source, transformer, output, stopped));
        Self {
            stop: Some(stop),
            handle,
        }
    }

    /// Signal the worker and wait for it to hand back the source.
    async fn stop(mut self) -> Option<FrameSource> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match (&mut self.handle).await {
            Ok(source) => Some(source),
            Err(e) => {
                tracing::error!("Frame worker failed: {}", e);
                None
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.stop.is_some() {
            self.handle.abort();
        }
    }
}

async fn run_worker(
    mut source: FrameSource,
    transformer: SharedTransformer,
    output: mpsc::Sender<Frame>,
    mut stop: oneshot::Receiver<()>,
) -> FrameSource {
    tracing::debug!(path = ?source.path(), "Frame worker started");
    let mut emitted: u64 = 0;

    loop {
        let frame = tokio::select! {
            biased;
            _ = &mut stop => break,
            frame = source.next_frame() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        // Dropping the in-flight frame on stop releases it.
        let processed = {
            let mut guard = tokio::select! {
                biased;
                _ = &mut stop => break,
                guard = transformer.lock() => guard,
            };
            tokio::select! {
                biased;
                _ = &mut stop => break,
                processed = guard.transform(frame) => processed,
            }
        };

        tokio::select! {
            biased;
            _ = &mut stop => break,
            sent = output.send(processed) => {
                if sent.is_err() {
                    tracing::debug!("Processed track receiver dropped");
                    break;
                }
                emitted += 1;
            }
        }
    }

    tracing::debug!(emitted, "Frame worker stopped");
    source
}

/// Owns the transform of one camera track from start to teardown.
pub struct ProcessingPipeline {
    config: PipelineConfig,
    options: TransformerOptions,
    gpu_factory: GpuContextFactory,
    segmenters: SegmenterFactory,
    state: ProcessorState,
    transformer: Option<SharedTransformer>,
    worker: Option<Worker>,
    sink: Option<Box<dyn TrackSink>>,
    gpu_context: bool,
    capabilities: Option<PlatformCapabilities>,
    path: Option<ExecutionPath>,
    disabled_reason: Option<String>,
}

impl ProcessingPipeline {
    pub fn new(config: PipelineConfig, options: TransformerOptions) -> Self {
        Self {
            config,
            options,
            gpu_factory: wgpu_context_factory(),
            segmenters: default_factory(),
            state: ProcessorState::Uninitialized,
            transformer: None,
            worker: None,
            sink: None,
            gpu_context: false,
            capabilities: None,
            path: None,
            disabled_reason: None,
        }
    }

    pub fn with_gpu_factory(mut self, factory: GpuContextFactory) -> Self {
        self.gpu_factory = factory;
        self
    }

    pub fn with_segmenter_factory(mut self, factory: SegmenterFactory) -> Self {
        self.segmenters = factory;
        self
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    pub fn effect(&self) -> Effect {
        self.config.effect
    }

    pub fn capabilities(&self) -> Option<PlatformCapabilities> {
        self.capabilities
    }

    pub fn execution_path(&self) -> Option<ExecutionPath> {
        self.path
    }

    /// Why the effect fell back to pass-through, if the engine failed to load.
    pub fn disabled_reason(&self) -> Option<&str> {
        self.disabled_reason.as_deref()
    }

    /// Whether frames currently leave the pipeline unmodified.
    pub async fn is_disabled(&self) -> bool {
        match &self.transformer {
            Some(transformer) => transformer.lock().await.is_disabled(),
            None => true,
        }
    }

    fn expect_state(
        &self,
        operation: &'static str,
        allowed: &[ProcessorState],
    ) -> Result<(), PipelineError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(PipelineError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// Start processing `track` and hand the result to `sink`.
    pub async fn init(
        &mut self,
        track: Box<dyn VideoTrack>,
        sink: Box<dyn TrackSink>,
    ) -> Result<(), PipelineError> {
        self.expect_state("init", &[ProcessorState::Uninitialized])?;
        self.state = ProcessorState::Initializing;

        match self.start(track, sink).await {
            Ok(()) => {
                self.state = ProcessorState::Running;
                tracing::info!(effect = ?self.config.effect, path = ?self.path, "Pipeline running");
                Ok(())
            }
            Err(e) => {
                self.reset_partial();
                self.state = ProcessorState::Uninitialized;
                Err(e)
            }
        }
    }

    async fn start(
        &mut self,
        track: Box<dyn VideoTrack>,
        sink: Box<dyn TrackSink>,
    ) -> Result<(), PipelineError> {
        let device = match (self.gpu_factory)() {
            Ok(device) => device,
            Err(e) => {
                tracing::error!("GPU context unavailable: {}", e);
                return Err(PipelineError::UnsupportedPlatform(e.to_string()));
            }
        };
        self.gpu_context = !device.is_context_lost();

        let mut transformer = Transformer::new(
            self.config.effect,
            self.options.clone(),
            device,
            Arc::clone(&self.segmenters),
        )?;
        self.disabled_reason = transformer.init().await.err().map(|e| e.to_string());

        let transformer = Arc::new(Mutex::new(transformer));
        self.transformer = Some(Arc::clone(&transformer));
        self.attach(track, sink, transformer)
    }

    /// Inspect the track, attach the processed track and spawn the worker.
    fn attach(
        &mut self,
        mut track: Box<dyn VideoTrack>,
        mut sink: Box<dyn TrackSink>,
        transformer: SharedTransformer,
    ) -> Result<(), PipelineError> {
        let capabilities = PlatformCapabilities::detect(self.gpu_context, track.as_ref());
        let path = capabilities.execution_path(self.config.max_fps);
        let settings = track.settings();
        tracing::info!(
            width = settings.width,
            height = settings.height,
            device = settings.device_id.as_deref().unwrap_or("unknown"),
            ?path,
            "Attaching to track"
        );

        let (output, processed) = ProcessedTrack::channel(settings, OUTPUT_CHANNEL_CAPACITY);
        if let Err(e) = sink.attach(processed) {
            track.stop();
            return Err(PipelineError::Sink(format!("{:#}", e)));
        }

        let source = FrameSource::open(track, path, self.config.max_fps);
        // The stream may already be taken, so record what was actually opened.
        self.path = Some(source.path());
        self.worker = Some(Worker::spawn(source, transformer, output));
        self.sink = Some(sink);
        self.capabilities = Some(capabilities);
        Ok(())
    }

    fn reset_partial(&mut self) {
        if let Some(transformer) = self.transformer.take() {
            if let Ok(mut transformer) = transformer.try_lock() {
                transformer.destroy();
            }
        }
        self.gpu_context = false;
        self.capabilities = None;
        self.path = None;
    }

    async fn detach(&mut self) {
        if let Some(worker) = self.worker.take() {
            if let Some(source) = worker.stop().await {
                source.into_track().stop();
            }
        }
        if let Some(mut sink) = self.sink.take() {
            sink.detach();
        }
    }

    /// Move to a new track and sink, rebuilding the transformer on the same device.
    pub async fn restart(
        &mut self,
        track: Box<dyn VideoTrack>,
        sink: Box<dyn TrackSink>,
    ) -> Result<(), PipelineError> {
        self.expect_state("restart", &[ProcessorState::Running])?;
        self.state = ProcessorState::Restarting;
        tracing::info!("Restarting pipeline");

        self.detach().await;
        let result = self.reattach(track, sink).await;
        match result {
            Ok(()) => {
                self.state = ProcessorState::Running;
                Ok(())
            }
            Err(e) => {
                tracing::error!("Pipeline restart failed: {}", e);
                self.reset_partial();
                self.state = ProcessorState::Destroyed;
                Err(e)
            }
        }
    }

    async fn reattach(
        &mut self,
        track: Box<dyn VideoTrack>,
        sink: Box<dyn TrackSink>,
    ) -> Result<(), PipelineError> {
        let Some(transformer) = self.transformer.clone() else {
            return Err(PipelineError::InvalidState {
                operation: "restart",
                state: self.state,
            });
        };

        let restarted = transformer.lock().await.restart(self.options.clone()).await;
        self.disabled_reason = match restarted {
            Ok(()) => None,
            Err(e @ TransformerError::SegmenterInit(_)) => Some(e.to_string()),
            Err(e) => return Err(e.into()),
        };
        self.attach(track, sink, transformer)
    }

    /// Apply live transformer options.
    ///
    /// Changes to `segmenter_options` or `asset_paths` are rejected; use
    /// [`restart_transformer`](Self::restart_transformer).
    pub async fn update_transformer_options(
        &mut self,
        options: TransformerOptions,
    ) -> Result<(), PipelineError> {
        self.expect_state(
            "update transformer options",
            &[ProcessorState::Uninitialized, ProcessorState::Running],
        )?;
        if let Some(transformer) = &self.transformer {
            transformer.lock().await.update(&options)?;
        }
        self.options = options;
        Ok(())
    }

    /// Rebuild inference engine and compositor with new options.
    ///
    /// Frames keep flowing, unprocessed, while the new engine loads.
    pub async fn restart_transformer(
        &mut self,
        options: TransformerOptions,
    ) -> Result<(), PipelineError> {
        self.expect_state("restart transformer", &[ProcessorState::Running])?;
        let Some(transformer) = self.transformer.clone() else {
            return Err(PipelineError::InvalidState {
                operation: "restart transformer",
                state: self.state,
            });
        };

        let current = std::mem::replace(&mut *transformer.lock().await, Transformer::passthrough());
        let device = match current.into_device() {
            Some(device) => device,
            None => (self.gpu_factory)()
                .map_err(|e| PipelineError::UnsupportedPlatform(e.to_string()))?,
        };

        tracing::info!("Rebuilding transformer");
        let mut fresh = Transformer::new(
            self.config.effect,
            options.clone(),
            device,
            Arc::clone(&self.segmenters),
        )?;
        self.disabled_reason = fresh.init().await.err().map(|e| e.to_string());

        *transformer.lock().await = fresh;
        self.options = options;
        Ok(())
    }

    /// Switch the background effect without reloading the engine.
    pub async fn set_effect(&mut self, effect: Effect) -> Result<(), PipelineError> {
        self.expect_state(
            "set effect",
            &[ProcessorState::Uninitialized, ProcessorState::Running],
        )?;
        self.config.effect = effect;
        if let Some(transformer) = &self.transformer {
            let mut guard = transformer.lock().await;
            let current = std::mem::replace(&mut *guard, Transformer::passthrough());
            *guard = current.with_effect(effect);
        }
        Ok(())
    }

    /// Stop the worker and release everything. Idempotent.
    pub async fn destroy(&mut self) {
        if self.state == ProcessorState::Destroyed {
            return;
        }
        self.state = ProcessorState::Destroyed;
        tracing::info!("Destroying pipeline");

        self.detach().await;
        if let Some(transformer) = self.transformer.take() {
            transformer.lock().await.destroy();
        }
    }
}

impl Drop for ProcessingPipeline {
    fn drop(&mut self) {
        if self.state != ProcessorState::Destroyed {
            tracing::debug!("Pipeline dropped without destroy");
        }
    }
}
