//! Error types surfaced by the transformer and the pipeline.

use crate::gpu::GpuError;
use crate::pipeline::ProcessorState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransformerError {
    /// The field is fixed for the lifetime of the inference engine.
    #[error("{field} can only change through a transformer restart")]
    RestartRequired { field: &'static str },

    #[error("segmentation engine unavailable: {0}")]
    SegmenterInit(String),

    #[error("segmentation failed: {0}")]
    Inference(String),

    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error("transformer has been destroyed")]
    Destroyed,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("cannot {operation} while the pipeline is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ProcessorState,
    },

    #[error(transparent)]
    Transformer(#[from] TransformerError),

    #[error("sink rejected the processed track: {0}")]
    Sink(String),
}
