//! Per-frame background transforms.
//!
//! [`BackgroundTransformer`] is the engine shared by the effects: it runs
//! segmentation and drives the compositor. The effect variants wrap it and
//! [`Transformer`] dispatches between them by [`Effect`].

mod background;
mod mask;
mod variants;

pub use background::{load_background, placeholder_background, BackgroundTransformer};
pub use mask::MaskRegister;
pub use variants::{BlurTransformer, PassthroughTransformer, VirtualBackgroundTransformer};

use crate::constants::DEFAULT_BLUR_RADIUS;
use crate::errors::TransformerError;
use crate::frame::Frame;
use crate::gpu::GpuDevice;
use crate::segmentation::{AssetPaths, SegmenterFactory, SegmenterOptions};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Background effect applied to the stream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    #[default]
    None,
    Blur,
    #[serde(rename = "virtual")]
    #[value(name = "virtual")]
    VirtualBackground,
}

/// Timings for one processed frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameProcessingStats {
    pub processing_time_ms: f64,
    pub segmentation_time_ms: f64,
    pub filter_time_ms: f64,
}

pub type FrameObserver = Arc<dyn Fn(&FrameProcessingStats) + Send + Sync>;

/// Transformer configuration.
///
/// `segmenter_options` and `asset_paths` are fixed once the inference
/// engine exists; everything else can change through `update`.
#[derive(Clone)]
pub struct TransformerOptions {
    pub blur_radius: u32,
    pub image_path: Option<String>,
    pub segmenter_options: SegmenterOptions,
    pub asset_paths: AssetPaths,
    pub on_frame_processed: Option<FrameObserver>,
}

impl Default for TransformerOptions {
    fn default() -> Self {
        Self {
            blur_radius: DEFAULT_BLUR_RADIUS,
            image_path: None,
            segmenter_options: SegmenterOptions::default(),
            asset_paths: AssetPaths::default(),
            on_frame_processed: None,
        }
    }
}

impl std::fmt::Debug for TransformerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformerOptions")
            .field("blur_radius", &self.blur_radius)
            .field("image_path", &self.image_path)
            .field("segmenter_options", &self.segmenter_options)
            .field("asset_paths", &self.asset_paths)
            .field("on_frame_processed", &self.on_frame_processed.is_some())
            .finish()
    }
}

/// Common surface of every transformer variant.
#[allow(async_fn_in_trait)]
pub trait FrameTransformer {
    /// Load the inference engine and background assets.
    ///
    /// An error here leaves the transformer in pass-through; it is not
    /// retried.
    async fn init(&mut self) -> Result<(), TransformerError>;

    /// Rebuild inference engine and GPU resources with new options.
    async fn restart(&mut self, options: TransformerOptions) -> Result<(), TransformerError>;

    /// Process one frame. Always returns a frame to emit.
    async fn transform(&mut self, frame: Frame) -> Frame;

    /// Apply live-updatable options.
    fn update(&mut self, options: &TransformerOptions) -> Result<(), TransformerError>;

    /// Release everything. Idempotent.
    fn destroy(&mut self);

    /// Whether frames currently pass through unmodified.
    fn is_disabled(&self) -> bool;
}

/// Effect-tagged transformer.
pub enum Transformer {
    Passthrough(PassthroughTransformer),
    Blur(BlurTransformer),
    VirtualBackground(VirtualBackgroundTransformer),
}

impl Transformer {
    /// Build the engine on `device` and wrap it for `effect`.
    pub fn new(
        effect: Effect,
        options: TransformerOptions,
        device: Box<dyn GpuDevice>,
        segmenters: SegmenterFactory,
    ) -> Result<Self, TransformerError> {
        let engine = BackgroundTransformer::new(options, device, segmenters)?;
        Ok(Self::wrap(effect, Some(engine)))
    }

    /// A transformer without an engine; frames always pass through.
    pub fn passthrough() -> Self {
        Self::Passthrough(PassthroughTransformer::default())
    }

    fn wrap(effect: Effect, engine: Option<BackgroundTransformer>) -> Self {
        match (effect, engine) {
            (Effect::Blur, Some(engine)) => Self::Blur(BlurTransformer::new(engine)),
            (Effect::VirtualBackground, Some(engine)) => {
                Self::VirtualBackground(VirtualBackgroundTransformer::new(engine))
            }
            (_, engine) => Self::Passthrough(PassthroughTransformer::parked(engine)),
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Self::Passthrough(_) => Effect::None,
            Self::Blur(_) => Effect::Blur,
            Self::VirtualBackground(_) => Effect::VirtualBackground,
        }
    }

    /// Switch effect, keeping the engine but none of its per-stream state.
    pub fn with_effect(self, effect: Effect) -> Self {
        if effect == self.effect() {
            return self;
        }
        tracing::info!(from = ?self.effect(), to = ?effect, "Switching background effect");
        let mut engine = self.into_engine();
        if let Some(engine) = engine.as_mut() {
            engine.reset_stream_state();
        }
        Self::wrap(effect, engine)
    }

    pub fn engine(&self) -> Option<&BackgroundTransformer> {
        match self {
            Self::Passthrough(t) => t.engine(),
            Self::Blur(t) => Some(t.engine()),
            Self::VirtualBackground(t) => Some(t.engine()),
        }
    }

    fn into_engine(self) -> Option<BackgroundTransformer> {
        match self {
            Self::Passthrough(t) => t.into_engine(),
            Self::Blur(t) => Some(t.into_engine()),
            Self::VirtualBackground(t) => Some(t.into_engine()),
        }
    }

    /// Destroy and hand back the GPU device for a new transformer.
    pub fn into_device(self) -> Option<Box<dyn GpuDevice>> {
        self.into_engine().and_then(BackgroundTransformer::into_device)
    }
}

impl FrameTransformer for Transformer {
    async fn init(&mut self) -> Result<(), TransformerError> {
        match self {
            Self::Passthrough(t) => t.init().await,
            Self::Blur(t) => t.init().await,
            Self::VirtualBackground(t) => t.init().await,
        }
    }

    async fn restart(&mut self, options: TransformerOptions) -> Result<(), TransformerError> {
        match self {
            Self::Passthrough(t) => t.restart(options).await,
            Self::Blur(t) => t.restart(options).await,
            Self::VirtualBackground(t) => t.restart(options).await,
        }
    }

    async fn transform(&mut self, frame: Frame) -> Frame {
        match self {
            Self::Passthrough(t) => t.transform(frame).await,
            Self::Blur(t) => t.transform(frame).await,
            Self::VirtualBackground(t) => t.transform(frame).await,
        }
    }

    fn update(&mut self, options: &TransformerOptions) -> Result<(), TransformerError> {
        match self {
            Self::Passthrough(t) => t.update(options),
            Self::Blur(t) => t.update(options),
            Self::VirtualBackground(t) => t.update(options),
        }
    }

    fn destroy(&mut self) {
        match self {
            Self::Passthrough(t) => t.destroy(),
            Self::Blur(t) => t.destroy(),
            Self::VirtualBackground(t) => t.destroy(),
        }
    }

    fn is_disabled(&self) -> bool {
        match self {
            Self::Passthrough(t) => t.is_disabled(),
            Self::Blur(t) => t.is_disabled(),
            Self::VirtualBackground(t) => t.is_disabled(),
        }
    }
}
