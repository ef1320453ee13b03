use super::preprocess::Preprocessor;
use super::types::{ExecutionProvider, Matte, SegmentationModel, SegmenterOptions};
use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use ndarray::{ArrayD, IxDyn};
use ort::execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;

fn ort_error(e: impl std::fmt::Display) -> anyhow::Error {
    anyhow!("onnx runtime: {e}")
}

/// RobustVideoMatting segmentation model
///
/// This model uses recurrent connections to maintain temporal consistency.
/// Hidden states (r1-r4) are carried between frames for smooth results.
pub struct RobustVideoMatting {
    session: Session,
    preprocessor: Preprocessor,

    // Recurrent hidden states, fed back in on the next frame
    recurrent: [ArrayD<f32>; 4],

    // Downsample ratio for hidden states
    downsample_ratio: f32,
}

fn initial_state() -> [ArrayD<f32>; 4] {
    // RVM accepts 1x1x1x1 zero tensors for the first frame.
    std::array::from_fn(|_| ArrayD::zeros(IxDyn(&[1, 1, 1, 1])))
}

impl RobustVideoMatting {
    /// Create a new RVM model from an ONNX file
    pub fn new<P: AsRef<Path>>(model_path: P, options: &SegmenterOptions) -> Result<Self> {
        let path = model_path.as_ref();

        tracing::info!("Loading RVM model from {}", path.display());

        let mut builder = Session::builder()
            .map_err(ort_error)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(ort_error)?
            .with_intra_threads(options.intra_threads)
            .map_err(ort_error)?;

        builder = match options.execution_provider {
            ExecutionProvider::Cpu => builder,
            ExecutionProvider::Cuda => builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])
                .map_err(ort_error)?,
            ExecutionProvider::TensorRt => builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default().build(),
                    CUDAExecutionProvider::default().build(),
                ])
                .map_err(ort_error)?,
        };

        let session = builder
            .commit_from_file(path)
            .map_err(ort_error)
            .with_context(|| format!("Failed to load model from {}", path.display()))?;

        tracing::info!(
            provider = ?options.execution_provider,
            "RVM model loaded successfully"
        );

        Ok(Self {
            session,
            preprocessor: Preprocessor::new(options.input_width, options.input_height),
            recurrent: initial_state(),
            downsample_ratio: options.downsample_ratio,
        })
    }
}

impl SegmentationModel for RobustVideoMatting {
    fn segment(&mut self, frame: &RgbImage) -> Result<Matte> {
        let _span = tracing::debug_span!("rvm_segment").entered();

        let src = Tensor::from_array(self.preprocessor.preprocess(frame)).map_err(ort_error)?;
        let [r1, r2, r3, r4] = self
            .recurrent
            .clone()
            .map(|state| Tensor::from_array(state).map_err(ort_error));
        let ratio =
            Tensor::from_array(([1usize], vec![self.downsample_ratio])).map_err(ort_error)?;

        let _infer_span = tracing::debug_span!("inference").entered();
        let outputs = self
            .session
            .run(ort::inputs![
                "src" => src,
                "r1i" => r1?,
                "r2i" => r2?,
                "r3i" => r3?,
                "r4i" => r4?,
                "downsample_ratio" => ratio,
            ])
            .map_err(ort_error)
            .context("Failed to run inference")?;
        drop(_infer_span);

        // Outputs: fgr (foreground), pha (alpha), r1o..r4o (next hidden states)
        for (slot, name) in self.recurrent.iter_mut().zip(["r1o", "r2o", "r3o", "r4o"]) {
            *slot = outputs[name]
                .try_extract_array::<f32>()
                .map_err(ort_error)?
                .to_owned();
        }

        // Alpha matte has shape [1, 1, H, W]
        let (shape, data) = outputs["pha"]
            .try_extract_tensor::<f32>()
            .map_err(ort_error)?;
        let height = shape[2] as u32;
        let width = shape[3] as u32;

        Ok(Matte::new(width, height, data.to_vec()))
    }

    fn reset_state(&mut self) {
        tracing::info!("Resetting RVM hidden states");
        self.recurrent = initial_state();
    }

    fn input_size(&self) -> (u32, u32) {
        self.preprocessor.target_size()
    }
}
