//! Tunables shared across the pipeline.

use std::time::Duration;

/// Smallest effective blur radius.
pub const MIN_BLUR_RADIUS: u32 = 5;

/// Largest effective blur radius.
pub const MAX_BLUR_RADIUS: u32 = 25;

pub const DEFAULT_BLUR_RADIUS: u32 = 10;

/// Frame rate cap for the fallback render loop.
pub const DEFAULT_MAX_FPS: u32 = 30;

/// Linear downscale applied before blurring.
pub const DOWNSAMPLE_FACTOR: u32 = 4;

/// Mask values between these edges are feathered with a smoothstep.
pub const MASK_EDGE_LOW: f32 = 0.4;
pub const MASK_EDGE_HIGH: f32 = 0.6;

/// Output frames buffered between the worker and the sink.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 4;

/// Placeholder background size when no image could be loaded.
pub const PLACEHOLDER_SIZE: (u32, u32) = (320, 180);

/// Consecutive capture failures tolerated before a track is closed.
pub const MAX_CAPTURE_FAILURES: u32 = 30;

/// Backoff between capture retries, doubling up to the cap.
pub const CAPTURE_RETRY_BASE: Duration = Duration::from_millis(10);
pub const CAPTURE_RETRY_MAX: Duration = Duration::from_millis(500);
