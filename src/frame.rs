use image::{DynamicImage, RgbImage, RgbaImage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A single-use RGBA raster travelling through the pipeline.
///
/// Frames are not `Clone`: whoever holds a frame last releases it, and the
/// release happens exactly once when the frame is dropped.
pub struct Frame {
    image: RgbaImage,
    timestamp: Option<Duration>,
    coded_width: u32,
    coded_height: u32,
    lease: Option<FrameLease>,
}

impl Frame {
    /// Create a frame whose coded size matches its display size.
    pub fn new(image: RgbaImage, timestamp: Option<Duration>) -> Self {
        let (width, height) = image.dimensions();
        Self {
            image,
            timestamp,
            coded_width: width,
            coded_height: height,
            lease: None,
        }
    }

    /// Create a frame from a decoded RGB capture.
    pub fn from_rgb(image: &RgbImage, timestamp: Option<Duration>) -> Self {
        Self::new(DynamicImage::ImageRgb8(image.clone()).into_rgba8(), timestamp)
    }

    /// Override the coded size reported by the source.
    pub fn with_coded_size(mut self, width: u32, height: u32) -> Self {
        self.coded_width = width;
        self.coded_height = height;
        self
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn timestamp(&self) -> Option<Duration> {
        self.timestamp
    }

    pub fn display_width(&self) -> u32 {
        self.image.width()
    }

    pub fn display_height(&self) -> u32 {
        self.image.height()
    }

    pub fn coded_width(&self) -> u32 {
        self.coded_width
    }

    pub fn coded_height(&self) -> u32 {
        self.coded_height
    }

    /// Whether the coded size is usable for processing.
    pub fn has_content(&self) -> bool {
        self.coded_width > 0 && self.coded_height > 0
    }

    /// Build the output frame for a rendered raster.
    ///
    /// The timestamp is carried over when present, otherwise the capture
    /// time is substituted. The lease stays with `self`.
    pub fn derive(&self, image: RgbaImage) -> Frame {
        let timestamp = self.timestamp.unwrap_or_else(capture_time);
        let mut out = Frame::new(image, Some(timestamp));
        if let Some(lease) = &self.lease {
            out.lease = Some(lease.ledger.open());
        }
        out
    }

    /// Release the frame now.
    pub fn close(self) {}
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("display", &self.image.dimensions())
            .field("coded", &(self.coded_width, self.coded_height))
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Wall-clock time since the UNIX epoch.
pub fn capture_time() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Counts frames opened and released by a source.
#[derive(Clone, Default)]
pub struct FrameLedger {
    counts: Arc<LedgerCounts>,
}

#[derive(Default)]
struct LedgerCounts {
    opened: AtomicU64,
    released: AtomicU64,
}

impl FrameLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a lease to `frame` so its release is recorded.
    pub fn track(&self, mut frame: Frame) -> Frame {
        frame.lease = Some(self.open());
        frame
    }

    fn open(&self) -> FrameLease {
        self.counts.opened.fetch_add(1, Ordering::SeqCst);
        FrameLease {
            ledger: self.clone(),
        }
    }

    pub fn opened(&self) -> u64 {
        self.counts.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.counts.released.load(Ordering::SeqCst)
    }

    /// Frames opened but not yet released.
    pub fn outstanding(&self) -> u64 {
        self.opened().saturating_sub(self.released())
    }
}

struct FrameLease {
    ledger: FrameLedger,
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        self.ledger.counts.released.fetch_add(1, Ordering::SeqCst);
    }
}
