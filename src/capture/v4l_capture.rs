use super::{CaptureRetry, FrameStream, RetryDecision, TrackSettings, VideoTrack};
use crate::frame::{capture_time, Frame};
use anyhow::{anyhow, bail, Context, Result};
use futures::StreamExt;
use image::RgbImage;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;
use tokio::sync::mpsc;

const STREAM_CAPACITY: usize = 2;

/// Webcam track backed by a dedicated capture thread.
///
/// The camera handle lives on that thread. Decoded frames are pushed to
/// the native stream (dropped when the consumer lags) and kept as the
/// presented frame for `grab`.
pub struct WebcamCapture {
    device_index: u32,
    width: u32,
    height: u32,
    frame_rate: u32,
    latest: Arc<Mutex<Option<RgbImage>>>,
    stream: Option<mpsc::Receiver<Frame>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WebcamCapture {
    pub fn new(device_index: u32, width: u32, height: u32, frame_rate: u32) -> Result<Self> {
        tracing::info!(
            "Initializing webcam {} at {}x{}",
            device_index,
            width,
            height
        );

        let latest = Arc::new(Mutex::new(None));
        let running = Arc::new(AtomicBool::new(true));
        let (frames_tx, frames_rx) = mpsc::channel(STREAM_CAPACITY);
        let (ready_tx, ready_rx) = std_mpsc::channel();

        let thread = std::thread::Builder::new()
            .name(format!("webcam-{}", device_index))
            .spawn({
                let latest = Arc::clone(&latest);
                let running = Arc::clone(&running);
                move || capture_loop(device_index, latest, running, frames_tx, ready_tx)
            })
            .context("Failed to spawn capture thread")?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => return Err(anyhow!("capture thread exited during startup")),
        }

        tracing::info!("Webcam initialized successfully");

        Ok(Self {
            device_index,
            width,
            height,
            frame_rate,
            latest,
            stream: Some(frames_rx),
            running,
            thread: Some(thread),
        })
    }
}

fn open_camera(device_index: u32) -> Result<Camera> {
    let index = CameraIndex::Index(device_index);
    let requested =
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestResolution);

    let mut camera = Camera::new(index, requested).context("Failed to open camera")?;
    camera
        .open_stream()
        .context("Failed to open camera stream")?;
    Ok(camera)
}

fn decode(camera: &mut Camera) -> Result<RgbImage> {
    let frame = camera.frame().context("Failed to capture frame")?;
    let decoded = frame
        .decode_image::<RgbFormat>()
        .context("Failed to decode frame")?;
    let (width, height) = (decoded.width(), decoded.height());
    RgbImage::from_raw(width, height, decoded.into_raw())
        .ok_or_else(|| anyhow!("decoded frame has an unexpected buffer size"))
}

fn capture_loop(
    device_index: u32,
    latest: Arc<Mutex<Option<RgbImage>>>,
    running: Arc<AtomicBool>,
    frames: mpsc::Sender<Frame>,
    ready: std_mpsc::Sender<Result<()>>,
) {
    let mut camera = match open_camera(device_index) {
        Ok(camera) => {
            let _ = ready.send(Ok(()));
            camera
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let mut retry = CaptureRetry::default();
    while running.load(Ordering::SeqCst) {
        let image = match decode(&mut camera) {
            Ok(image) => {
                retry.succeeded();
                image
            }
            Err(e) => match retry.failed() {
                RetryDecision::RetryAfter(delay) => {
                    tracing::warn!("Capture error ({} in a row): {:#}", retry.consecutive(), e);
                    std::thread::sleep(delay);
                    continue;
                }
                RetryDecision::GiveUp => {
                    tracing::error!(
                        "Webcam {} failed {} times in a row, closing track: {:#}",
                        device_index,
                        retry.consecutive(),
                        e
                    );
                    break;
                }
            },
        };
        let frame = Frame::from_rgb(&image, Some(capture_time()));
        *latest.lock() = Some(image);
        // A full channel means the consumer is still busy; skip the frame.
        let _ = frames.try_send(frame);
    }

    if let Err(e) = camera.stop_stream() {
        tracing::warn!("Failed to stop camera stream: {}", e);
    }
    // Dropping `frames` here ends the native stream.
    tracing::debug!("Capture thread for webcam {} exiting", device_index);
}

impl VideoTrack for WebcamCapture {
    fn settings(&self) -> TrackSettings {
        TrackSettings {
            width: self.width,
            height: self.height,
            frame_rate: Some(f64::from(self.frame_rate)),
            device_id: Some(format!("/dev/video{}", self.device_index)),
        }
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn frames(&mut self) -> Option<FrameStream> {
        let receiver = self.stream.take()?;
        let stream = futures::stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        });
        Some(stream.boxed())
    }

    fn grab(&mut self) -> Result<Option<Frame>> {
        if self.thread.as_ref().map_or(true, |t| t.is_finished()) {
            bail!("webcam {} capture has stopped", self.device_index);
        }
        Ok(self
            .latest
            .lock()
            .as_ref()
            .map(|image| Frame::from_rgb(image, Some(capture_time()))))
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Capture thread panicked");
            }
        }
    }
}

impl Drop for WebcamCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
