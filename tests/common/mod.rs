#![allow(dead_code)]

use camola_backdrop::capture::{FrameStream, TrackSettings, VideoTrack};
use camola_backdrop::gpu::{GpuContextFactory, GpuDevice, SoftwareDevice};
use camola_backdrop::output::HandoffSink;
use camola_backdrop::segmentation::{
    AssetPaths, Matte, SegmentationModel, SegmenterFactory, SegmenterOptions,
};
use camola_backdrop::Frame;
use futures::StreamExt;
use image::{Rgba, RgbImage, RgbaImage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counters shared by every model a factory hands out.
#[derive(Clone, Default)]
pub struct ModelMonitor {
    pub calls: Arc<AtomicUsize>,
    pub in_flight: Arc<AtomicUsize>,
    pub overlaps: Arc<AtomicUsize>,
    pub resets: Arc<AtomicUsize>,
}

impl ModelMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn factory(&self, delay: Duration) -> SegmenterFactory {
        let monitor = self.clone();
        Arc::new(move |_: &SegmenterOptions, _: &AssetPaths| {
            Ok(Box::new(MonitoredModel {
                monitor: monitor.clone(),
                delay,
                since_reset: 0,
            }) as Box<dyn SegmentationModel>)
        })
    }
}

/// Low resolution matte whose right half firms up with every frame since
/// the last reset, like a recurrent model settling.
struct MonitoredModel {
    monitor: ModelMonitor,
    delay: Duration,
    since_reset: u32,
}

impl SegmentationModel for MonitoredModel {
    fn segment(&mut self, _frame: &RgbImage) -> anyhow::Result<Matte> {
        if self.monitor.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.monitor.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.monitor.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        self.since_reset += 1;
        let right = (self.since_reset as f32 * 0.3).min(1.0);
        let (w, h) = (16, 12);
        let data = (0..w * h)
            .map(|i| if i % w < w / 2 { 1.0 } else { right })
            .collect();

        self.monitor.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Matte::new(w, h, data))
    }

    fn reset_state(&mut self) {
        self.since_reset = 0;
        self.monitor.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn input_size(&self) -> (u32, u32) {
        (16, 12)
    }
}

/// Factory handing out handles to one shared software device.
pub fn shared_device_factory(device: &SoftwareDevice) -> GpuContextFactory {
    let device = device.clone();
    Arc::new(move || Ok(Box::new(device.clone()) as Box<dyn GpuDevice>))
}

/// Track that streams a fixed list of frames and then ends.
pub struct ScriptedTrack {
    width: u32,
    height: u32,
    frames: Option<Vec<Frame>>,
}

impl ScriptedTrack {
    pub fn new(width: u32, height: u32, frames: Vec<Frame>) -> Self {
        Self {
            width,
            height,
            frames: Some(frames),
        }
    }
}

impl VideoTrack for ScriptedTrack {
    fn settings(&self) -> TrackSettings {
        TrackSettings {
            width: self.width,
            height: self.height,
            frame_rate: Some(30.0),
            device_id: Some("scripted".to_string()),
        }
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn frames(&mut self) -> Option<FrameStream> {
        self.frames
            .take()
            .map(|frames| futures::stream::iter(frames).boxed())
    }

    fn grab(&mut self) -> anyhow::Result<Option<Frame>> {
        Ok(None)
    }

    fn stop(&mut self) {
        self.frames = None;
    }
}

/// A recognisable test image.
pub fn pattern(width: u32, height: u32, seed: u8) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| {
        Rgba([
            (x % 256) as u8 ^ seed,
            (y % 256) as u8,
            ((x + y) % 256) as u8,
            255,
        ])
    })
}

/// Read processed frames until the pipeline closes the track.
pub async fn collect(sink: &HandoffSink) -> Vec<Frame> {
    let mut track = sink.take_track().expect("processed track attached");
    let mut frames = Vec::new();
    let drained = tokio::time::timeout(Duration::from_secs(60), async {
        while let Some(frame) = track.next_frame().await {
            frames.push(frame);
        }
    })
    .await;
    assert!(drained.is_ok(), "processed track never closed");
    frames
}

/// Drain processed frames in the background, counting them.
pub fn drain(sink: &HandoffSink) -> (Arc<AtomicUsize>, tokio::task::JoinHandle<()>) {
    let mut track = sink.take_track().expect("processed track attached");
    let count = Arc::new(AtomicUsize::new(0));
    let handle = tokio::spawn({
        let count = Arc::clone(&count);
        async move {
            while let Some(frame) = track.next_frame().await {
                count.fetch_add(1, Ordering::SeqCst);
                drop(frame);
            }
        }
    });
    (count, handle)
}
