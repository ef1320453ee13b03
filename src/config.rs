use crate::constants::{DEFAULT_BLUR_RADIUS, DEFAULT_MAX_FPS};
use crate::pipeline::PipelineConfig;
use crate::segmentation::{AssetPaths, SegmenterOptions};
use crate::transformer::{Effect, TransformerOptions};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings file contents. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub effect: Effect,
    pub blur_radius: u32,
    pub image_path: Option<String>,
    pub max_fps: u32,
    pub segmenter: SegmenterOptions,
    pub assets: AssetPaths,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            effect: Effect::Blur,
            blur_radius: DEFAULT_BLUR_RADIUS,
            image_path: None,
            max_fps: DEFAULT_MAX_FPS,
            segmenter: SegmenterOptions::default(),
            assets: AssetPaths::default(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn transformer_options(&self) -> TransformerOptions {
        TransformerOptions {
            blur_radius: self.blur_radius,
            image_path: self.image_path.clone(),
            segmenter_options: self.segmenter.clone(),
            asset_paths: self.assets.clone(),
            on_frame_processed: None,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            effect: self.effect,
            max_fps: self.max_fps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmentation::ExecutionProvider;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = serde_json::from_str(
            r#"{ "effect": "virtual", "image_path": "beach.jpg", "segmenter": { "execution_provider": "cuda" } }"#,
        )
        .unwrap();
        assert_eq!(config.effect, Effect::VirtualBackground);
        assert_eq!(config.blur_radius, DEFAULT_BLUR_RADIUS);
        assert_eq!(config.max_fps, DEFAULT_MAX_FPS);
        assert_eq!(config.segmenter.execution_provider, ExecutionProvider::Cuda);
        assert_eq!(config.segmenter.input_width, 512);

        let options = config.transformer_options();
        assert_eq!(options.image_path.as_deref(), Some("beach.jpg"));
        assert_eq!(config.pipeline_config().effect, Effect::VirtualBackground);
    }

    #[test]
    fn missing_file_is_reported() {
        let err = Config::load("/nonexistent/camola.json").unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to read config file"));
    }
}
