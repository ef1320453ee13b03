use super::{FrameStream, TrackSettings, VideoTrack};
use crate::frame::{capture_time, Frame, FrameLedger};
use anyhow::{bail, Result};
use futures::StreamExt;
use image::{Rgba, RgbaImage};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Synthetic camera: a gradient with a bright block sweeping across it.
///
/// Useful without hardware and as the source in tests. Every frame it hands
/// out can be tracked by a [`FrameLedger`].
pub struct TestPatternTrack {
    width: u32,
    height: u32,
    frame_rate: f64,
    streaming: bool,
    stream_taken: bool,
    ledger: Option<FrameLedger>,
    produced: Arc<AtomicU64>,
    stopped: Arc<AtomicBool>,
}

impl TestPatternTrack {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame_rate: 30.0,
            streaming: true,
            stream_taken: false,
            ledger: None,
            produced: Arc::new(AtomicU64::new(0)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_frame_rate(mut self, frame_rate: f64) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    /// Disable the native stream so consumers must poll with `grab`.
    pub fn without_streaming(mut self) -> Self {
        self.streaming = false;
        self
    }

    pub fn with_ledger(mut self, ledger: FrameLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Counter of frames produced so far, shared with any taken stream.
    pub fn produced(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.produced)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn generator(&self) -> Generator {
        Generator {
            width: self.width,
            height: self.height,
            ledger: self.ledger.clone(),
            produced: Arc::clone(&self.produced),
        }
    }
}

struct Generator {
    width: u32,
    height: u32,
    ledger: Option<FrameLedger>,
    produced: Arc<AtomicU64>,
}

impl Generator {
    fn next(&self) -> Frame {
        let index = self.produced.fetch_add(1, Ordering::SeqCst);
        let frame = Frame::new(render(self.width, self.height, index), Some(capture_time()));
        match &self.ledger {
            Some(ledger) => ledger.track(frame),
            None => frame,
        }
    }
}

fn render(width: u32, height: u32, index: u64) -> RgbaImage {
    let block = (width / 4).max(1);
    let left = ((index * 4) % u64::from(width.max(1))) as u32;
    RgbaImage::from_fn(width, height, |x, y| {
        if x >= left && x < left + block && y > height / 4 && y < height * 3 / 4 {
            Rgba([235, 200, 170, 255])
        } else {
            let r = (x * 255 / width.max(1)) as u8;
            let b = (y * 255 / height.max(1)) as u8;
            Rgba([r, 96, b, 255])
        }
    })
}

impl VideoTrack for TestPatternTrack {
    fn settings(&self) -> TrackSettings {
        TrackSettings {
            width: self.width,
            height: self.height,
            frame_rate: Some(self.frame_rate),
            device_id: Some("test-pattern".to_string()),
        }
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    fn frames(&mut self) -> Option<FrameStream> {
        if !self.streaming || self.stream_taken {
            return None;
        }
        self.stream_taken = true;

        let period = Duration::from_secs_f64(1.0 / self.frame_rate.max(1.0));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let state = (ticker, self.generator(), Arc::clone(&self.stopped));

        let stream = futures::stream::unfold(state, |(mut ticker, generator, stopped)| async move {
            ticker.tick().await;
            if stopped.load(Ordering::SeqCst) {
                return None;
            }
            let frame = generator.next();
            Some((frame, (ticker, generator, stopped)))
        });
        Some(stream.boxed())
    }

    fn grab(&mut self) -> Result<Option<Frame>> {
        if self.is_stopped() {
            bail!("test pattern track is stopped");
        }
        Ok(Some(self.generator().next()))
    }

    fn stop(&mut self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!("Test pattern track stopped");
        }
    }
}
