#[cfg(feature = "camera")]
mod loopback;
mod null;

#[cfg(feature = "camera")]
pub use loopback::V4L2Output;
pub use null::NullOutput;

use crate::capture::TrackSettings;
use crate::frame::Frame;
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Trait for output destinations
pub trait OutputSink: Send {
    /// Write a frame to the output
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Get the expected output resolution
    fn resolution(&self) -> (u32, u32);
}

/// Processed frames leaving the pipeline, with the source's settings.
pub struct ProcessedTrack {
    settings: TrackSettings,
    frames: mpsc::Receiver<Frame>,
}

impl ProcessedTrack {
    pub fn channel(settings: TrackSettings, capacity: usize) -> (mpsc::Sender<Frame>, Self) {
        let (tx, frames) = mpsc::channel(capacity);
        (tx, Self { settings, frames })
    }

    pub fn settings(&self) -> &TrackSettings {
        &self.settings
    }

    /// Next processed frame; `None` once the pipeline closed the track.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }
}

/// Consumer of the processed track.
pub trait TrackSink: Send {
    fn attach(&mut self, track: ProcessedTrack) -> Result<()>;

    fn detach(&mut self);
}

/// Drains the processed track into an [`OutputSink`] on a tokio task.
///
/// Device writes block, so each one runs on the blocking pool.
pub struct WriterSink<O> {
    output: Arc<Mutex<O>>,
    task: Option<JoinHandle<u64>>,
}

impl<O: OutputSink + 'static> WriterSink<O> {
    pub fn new(output: O) -> Self {
        Self {
            output: Arc::new(Mutex::new(output)),
            task: None,
        }
    }
}

impl<O: OutputSink + 'static> TrackSink for WriterSink<O> {
    fn attach(&mut self, mut track: ProcessedTrack) -> Result<()> {
        self.detach();
        let output = Arc::clone(&self.output);
        let (width, height) = output.lock().resolution();
        tracing::info!(
            source_width = track.settings().width,
            source_height = track.settings().height,
            width,
            height,
            "Attaching processed track to output"
        );

        self.task = Some(tokio::spawn(async move {
            let mut written = 0;
            while let Some(frame) = track.next_frame().await {
                let output = Arc::clone(&output);
                let write = tokio::task::spawn_blocking(move || {
                    let mut output = output.lock();
                    output.write_frame(&frame)
                })
                .await;
                match write {
                    Ok(Ok(())) => written += 1,
                    Ok(Err(e)) => tracing::warn!("Failed to write frame: {:#}", e),
                    Err(e) => {
                        tracing::error!("Output writer failed: {}", e);
                        break;
                    }
                }
            }
            written
        }));
        Ok(())
    }

    fn detach(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Sink that parks the processed track for someone else to consume.
#[derive(Clone, Default)]
pub struct HandoffSink {
    slot: Arc<Mutex<Option<ProcessedTrack>>>,
    attached: Arc<Mutex<bool>>,
}

impl HandoffSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_track(&self) -> Option<ProcessedTrack> {
        self.slot.lock().take()
    }

    pub fn is_attached(&self) -> bool {
        *self.attached.lock()
    }
}

impl TrackSink for HandoffSink {
    fn attach(&mut self, track: ProcessedTrack) -> Result<()> {
        *self.slot.lock() = Some(track);
        *self.attached.lock() = true;
        Ok(())
    }

    fn detach(&mut self) {
        self.slot.lock().take();
        *self.attached.lock() = false;
    }
}
