#[cfg(feature = "onnx")]
mod preprocess;
#[cfg(feature = "onnx")]
mod rvm;
pub mod types;

#[cfg(feature = "onnx")]
pub use preprocess::Preprocessor;
#[cfg(feature = "onnx")]
pub use rvm::RobustVideoMatting;
pub use types::{AssetPaths, ExecutionProvider, Matte, SegmentationModel, SegmenterOptions};

use anyhow::{bail, Result};
use std::sync::Arc;

/// Builds the inference engine for a transformer.
pub type SegmenterFactory = Arc<
    dyn Fn(&SegmenterOptions, &AssetPaths) -> Result<Box<dyn SegmentationModel>> + Send + Sync,
>;

/// Create a default segmentation model (RVM)
pub fn create_default_model(
    options: &SegmenterOptions,
    assets: &AssetPaths,
) -> Result<Box<dyn SegmentationModel>> {
    if !assets.model.is_file() {
        bail!("segmentation model not found at {}", assets.model.display());
    }

    #[cfg(feature = "onnx")]
    {
        let model = RobustVideoMatting::new(&assets.model, options)?;
        Ok(Box::new(model))
    }

    #[cfg(not(feature = "onnx"))]
    {
        let _ = options;
        bail!(
            "cannot load {}: built without the `onnx` feature",
            assets.model.display()
        )
    }
}

/// Factory wrapping [`create_default_model`].
pub fn default_factory() -> SegmenterFactory {
    Arc::new(create_default_model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn missing_model_is_reported() {
        let assets = AssetPaths {
            model: PathBuf::from("/nonexistent/model.onnx"),
        };
        let err = create_default_model(&SegmenterOptions::default(), &assets)
            .err()
            .unwrap();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: SegmenterOptions =
            serde_json::from_str(r#"{"execution_provider": "cuda"}"#).unwrap();
        assert_eq!(options.execution_provider, ExecutionProvider::Cuda);
        assert_eq!(options.input_width, 512);
    }
}
