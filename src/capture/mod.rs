mod retry;
mod test_pattern;
#[cfg(feature = "camera")]
mod v4l_capture;

pub use retry::{CaptureRetry, RetryDecision};
pub use test_pattern::TestPatternTrack;
#[cfg(feature = "camera")]
pub use v4l_capture::WebcamCapture;

use crate::frame::Frame;
use anyhow::Result;
use futures::stream::BoxStream;

/// Native push stream of frames from a source.
pub type FrameStream = BoxStream<'static, Frame>;

/// Settings reported by a video track.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrackSettings {
    pub width: u32,
    pub height: u32,
    pub frame_rate: Option<f64>,
    pub device_id: Option<String>,
}

/// A live camera track feeding the pipeline.
pub trait VideoTrack: Send {
    fn settings(&self) -> TrackSettings;

    /// Whether the track can hand out a native frame stream.
    fn supports_streaming(&self) -> bool;

    /// Take the native frame stream.
    ///
    /// Returns `None` when streaming is unsupported or the stream was
    /// already taken.
    fn frames(&mut self) -> Option<FrameStream>;

    /// Copy of the currently presented frame, if one is available.
    fn grab(&mut self) -> Result<Option<Frame>>;

    /// Stop producing frames.
    fn stop(&mut self);
}
