use super::OutputSink;
use crate::frame::Frame;
use anyhow::Result;
use std::time::Instant;

const REPORT_EVERY: u64 = 30;

/// Discards frames, logging throughput every few frames.
pub struct NullOutput {
    width: u32,
    height: u32,
    frames: u64,
    window_start: Instant,
}

impl NullOutput {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frames: 0,
            window_start: Instant::now(),
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl OutputSink for NullOutput {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.frames += 1;
        if self.frames % REPORT_EVERY == 0 {
            let elapsed = self.window_start.elapsed().as_secs_f64();
            let fps = REPORT_EVERY as f64 / elapsed.max(f64::EPSILON);
            tracing::info!(
                frames = self.frames,
                width = frame.display_width(),
                height = frame.display_height(),
                "Output running at {:.1} fps",
                fps
            );
            self.window_start = Instant::now();
        }
        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
