use anyhow::Result;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Alpha matte: grayscale values where 0.0 = background, 1.0 = foreground.
///
/// Stored at the model's output resolution; the compositor stretches it
/// over the frame when sampling.
#[derive(Debug, Clone, PartialEq)]
pub struct Matte {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl Matte {
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), (width * height) as usize);
        Self {
            width,
            height,
            data,
        }
    }

    /// A matte that keeps the whole frame.
    pub fn foreground(width: u32, height: u32) -> Self {
        Self::new(width, height, vec![1.0; (width * height) as usize])
    }
}

/// Trait for segmentation models
/// Allows swapping between different backends (RVM, MODNet, MediaPipe, etc.)
pub trait SegmentationModel: Send {
    /// Process a frame and return an alpha matte
    fn segment(&mut self, frame: &RgbImage) -> Result<Matte>;

    /// Reset internal state (for models with temporal/recurrent components)
    ///
    /// Call this when:
    /// - Switching cameras
    /// - Switching effects
    /// - Starting a new video session
    fn reset_state(&mut self) {
        // Default implementation: no-op for stateless models
    }

    /// Get the model's preferred input dimensions
    ///
    /// Returns (width, height)
    fn input_size(&self) -> (u32, u32);
}

/// Execution provider requested from the inference runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProvider {
    #[default]
    Cpu,
    Cuda,
    TensorRt,
}

/// Inference engine settings. Changing them needs a new engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterOptions {
    pub input_width: u32,
    pub input_height: u32,
    /// Resolution of the recurrent states relative to the input.
    pub downsample_ratio: f32,
    pub intra_threads: usize,
    pub execution_provider: ExecutionProvider,
}

impl Default for SegmenterOptions {
    fn default() -> Self {
        Self {
            input_width: 512,
            input_height: 512,
            downsample_ratio: 0.25,
            intra_threads: 4,
            execution_provider: ExecutionProvider::Cpu,
        }
    }
}

/// Where the inference engine finds its assets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetPaths {
    pub model: PathBuf,
}

impl Default for AssetPaths {
    fn default() -> Self {
        Self {
            model: PathBuf::from("models/rvm_mobilenetv3_fp32.onnx"),
        }
    }
}
