use crate::capture::VideoTrack;
use image::ImageFormat;

/// How frames are pulled from the source track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPath {
    /// Consume the track's native frame stream.
    Streaming,
    /// Read the presented frame on a timer.
    Fallback { max_fps: u32 },
}

/// What the platform offers for this attachment. Detected once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformCapabilities {
    pub gpu_context: bool,
    pub frame_streaming: bool,
    pub bitmap_decode: bool,
}

impl PlatformCapabilities {
    pub fn detect(gpu_context: bool, track: &dyn VideoTrack) -> Self {
        let caps = Self {
            gpu_context,
            frame_streaming: track.supports_streaming(),
            bitmap_decode: ImageFormat::Png.reading_enabled()
                && ImageFormat::Jpeg.reading_enabled(),
        };
        tracing::debug!(?caps, "Detected platform capabilities");
        caps
    }

    pub fn is_supported(&self) -> bool {
        self.gpu_context && self.frame_streaming && self.bitmap_decode
    }

    pub fn has_modern_api_support(&self) -> bool {
        self.frame_streaming && self.bitmap_decode
    }

    pub fn execution_path(&self, max_fps: u32) -> ExecutionPath {
        if self.has_modern_api_support() {
            ExecutionPath::Streaming
        } else {
            ExecutionPath::Fallback {
                max_fps: max_fps.max(1),
            }
        }
    }
}
