//! Real-time background blur and virtual backgrounds for camera tracks.
//!
//! A [`ProcessingPipeline`] pulls frames from a [`VideoTrack`], runs them
//! through a [`Transformer`] (segmentation plus GPU compositing) and emits
//! the result on a [`ProcessedTrack`] handed to a [`TrackSink`].

pub mod capture;
pub mod config;
pub mod constants;
pub mod errors;
pub mod frame;
pub mod gpu;
pub mod output;
pub mod pipeline;
pub mod segmentation;
pub mod transformer;

pub use capture::{TrackSettings, VideoTrack};
pub use config::Config;
pub use errors::{PipelineError, TransformerError};
pub use frame::{Frame, FrameLedger};
pub use output::{ProcessedTrack, TrackSink};
pub use pipeline::{
    ExecutionPath, PipelineConfig, PlatformCapabilities, ProcessingPipeline, ProcessorState,
};
pub use transformer::{
    Effect, FrameProcessingStats, FrameTransformer, Transformer, TransformerOptions,
};
