use super::mask::MaskRegister;
use super::{FrameProcessingStats, TransformerOptions};
use crate::constants::PLACEHOLDER_SIZE;
use crate::errors::TransformerError;
use crate::frame::Frame;
use crate::gpu::{Compositor, GpuDevice, RenderMode};
use crate::segmentation::{Matte, SegmentationModel, SegmenterFactory};
use anyhow::Context;
use futures::FutureExt;
use image::{Rgba, RgbaImage};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

type SharedModel = Arc<Mutex<Box<dyn SegmentationModel>>>;

/// Turns a background image path into pixels. Runs on the blocking pool.
type BackgroundDecoder = Arc<dyn Fn(&str) -> anyhow::Result<RgbaImage> + Send + Sync>;

/// Background image decode running on the blocking pool.
struct PendingBackground {
    path: String,
    task: JoinHandle<anyhow::Result<RgbaImage>>,
}

/// Segmentation plus compositing for one stream.
///
/// Each [`transform`](Self::transform) starts inference on its frame and
/// draws with the mask completed for the previous frame, so the cutout
/// trails the picture by one frame. The call only returns once its own
/// inference has finished, which keeps a single inference in flight.
pub struct BackgroundTransformer {
    options: TransformerOptions,
    segmenters: SegmenterFactory,
    model: Option<SharedModel>,
    masks: Arc<MaskRegister>,
    compositor: Option<Compositor>,
    pending_background: Option<PendingBackground>,
    decoder: BackgroundDecoder,
    disabled: Option<String>,
    destroyed: bool,
}

struct FrameTimings {
    segmentation: Duration,
    filter: Duration,
}

impl BackgroundTransformer {
    /// Create the engine and its GPU resources on `device`.
    ///
    /// The inference engine is loaded by [`init`](Self::init).
    pub fn new(
        options: TransformerOptions,
        device: Box<dyn GpuDevice>,
        segmenters: SegmenterFactory,
    ) -> Result<Self, TransformerError> {
        let compositor = Compositor::new(device, options.blur_radius)?;
        Ok(Self {
            options,
            segmenters,
            model: None,
            masks: Arc::new(MaskRegister::new()),
            compositor: Some(compositor),
            pending_background: None,
            decoder: Arc::new(load_background),
            disabled: None,
            destroyed: false,
        })
    }

    pub fn options(&self) -> &TransformerOptions {
        &self.options
    }

    pub fn compositor(&self) -> Option<&Compositor> {
        self.compositor.as_ref()
    }

    /// Why the effect is permanently off, if it is.
    pub fn disabled_reason(&self) -> Option<&str> {
        self.disabled.as_deref()
    }

    pub fn is_disabled(&self) -> bool {
        self.destroyed || self.disabled.is_some()
    }

    /// Load the inference engine and the background image.
    ///
    /// Engine failure disables the effect for good and is reported once.
    pub async fn init(&mut self) -> Result<(), TransformerError> {
        if self.destroyed {
            return Err(TransformerError::Destroyed);
        }

        let factory = Arc::clone(&self.segmenters);
        let segmenter_options = self.options.segmenter_options.clone();
        let asset_paths = self.options.asset_paths.clone();
        let loaded =
            tokio::task::spawn_blocking(move || factory(&segmenter_options, &asset_paths)).await;

        let model = match loaded {
            Ok(Ok(model)) => model,
            Ok(Err(e)) => return Err(self.disable(format!("{:#}", e))),
            Err(e) => return Err(self.disable(e.to_string())),
        };
        let (input_w, input_h) = model.input_size();
        tracing::info!(input_w, input_h, "Segmentation engine ready");
        self.model = Some(Arc::new(Mutex::new(model)));

        let background = match self.options.image_path.clone() {
            Some(path) => {
                let loaded = tokio::task::spawn_blocking({
                    let path = path.clone();
                    let decoder = Arc::clone(&self.decoder);
                    move || decoder(&path)
                })
                .await;
                finish_background(&path, loaded)
            }
            None => placeholder_background(),
        };
        self.install_background(background);
        Ok(())
    }

    fn disable(&mut self, reason: String) -> TransformerError {
        tracing::warn!("Background effect disabled: {}", reason);
        self.disabled = Some(reason.clone());
        TransformerError::SegmenterInit(reason)
    }

    /// Process one frame with the given background treatment.
    pub async fn transform(&mut self, frame: Frame, mode: RenderMode) -> Frame {
        if !frame.has_content() {
            tracing::trace!("Passing through frame without coded size");
            return frame;
        }
        if self.is_disabled() {
            return frame;
        }

        let started = Instant::now();
        match self.process(&frame, mode).await {
            Ok((image, timings)) => {
                let output = frame.derive(image);
                frame.close();
                self.report(FrameProcessingStats {
                    processing_time_ms: as_ms(started.elapsed()),
                    segmentation_time_ms: as_ms(timings.segmentation),
                    filter_time_ms: as_ms(timings.filter),
                });
                output
            }
            Err(e) => {
                tracing::warn!("Frame processing failed, passing frame through: {}", e);
                frame
            }
        }
    }

    async fn process(
        &mut self,
        frame: &Frame,
        mode: RenderMode,
    ) -> Result<(RgbaImage, FrameTimings), TransformerError> {
        let model = self.model.clone().ok_or(TransformerError::Destroyed)?;
        self.poll_background();

        // Claim the previous frame's mask before this frame's inference can land.
        let previous = self.masks.take();
        let rgb = image::DynamicImage::ImageRgba8(frame.image().clone()).into_rgb8();
        let register = Arc::clone(&self.masks);
        let inference = tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let matte = model.lock().segment(&rgb)?;
            if !register.publish(matte) {
                tracing::debug!("Dropping segmentation result after dispose");
            }
            Ok::<_, anyhow::Error>(started.elapsed())
        });

        let filter_started = Instant::now();
        let drawn = self.draw(frame.image(), previous, mode);
        let filter = filter_started.elapsed();

        // Frame N's mask must be in the register before frame N+1 starts.
        let segmentation = match inference.await {
            Ok(Ok(elapsed)) => elapsed,
            Ok(Err(e)) => return Err(TransformerError::Inference(format!("{:#}", e))),
            Err(e) => return Err(TransformerError::Inference(e.to_string())),
        };

        Ok((
            drawn?,
            FrameTimings {
                segmentation,
                filter,
            },
        ))
    }

    fn draw(
        &mut self,
        image: &RgbaImage,
        matte: Option<Matte>,
        mode: RenderMode,
    ) -> Result<RgbaImage, TransformerError> {
        let compositor = self.compositor.as_mut().ok_or(TransformerError::Destroyed)?;
        if let Some(matte) = matte {
            compositor.update_mask(&matte)?;
        }
        Ok(compositor.render_frame(image, mode)?)
    }

    fn report(&self, stats: FrameProcessingStats) {
        tracing::trace!(
            total_ms = stats.processing_time_ms,
            segmentation_ms = stats.segmentation_time_ms,
            filter_ms = stats.filter_time_ms,
            "Frame processed"
        );
        if let Some(observer) = &self.options.on_frame_processed {
            observer(&stats);
        }
    }

    /// Apply live-updatable options.
    pub fn update(&mut self, options: &TransformerOptions) -> Result<(), TransformerError> {
        if options.segmenter_options != self.options.segmenter_options {
            return Err(TransformerError::RestartRequired {
                field: "segmenter_options",
            });
        }
        if options.asset_paths != self.options.asset_paths {
            return Err(TransformerError::RestartRequired {
                field: "asset_paths",
            });
        }

        if let Some(compositor) = self.compositor.as_mut() {
            compositor.set_blur_radius(options.blur_radius);
        }
        if options.image_path != self.options.image_path {
            self.load_background_async(options.image_path.clone());
        }

        self.options.blur_radius = options.blur_radius;
        self.options.image_path = options.image_path.clone();
        self.options.on_frame_processed = options.on_frame_processed.clone();
        Ok(())
    }

    /// Decode a new background off the frame path.
    ///
    /// The current background keeps rendering until the decode finishes.
    fn load_background_async(&mut self, path: Option<String>) {
        if let Some(stale) = self.pending_background.take() {
            tracing::debug!("Abandoning background decode of {}", stale.path);
            stale.task.abort();
        }

        let Some(path) = path else {
            self.install_background(placeholder_background());
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let task = runtime.spawn_blocking({
                    let path = path.clone();
                    let decoder = Arc::clone(&self.decoder);
                    move || decoder(&path)
                });
                self.pending_background = Some(PendingBackground { path, task });
            }
            Err(_) => {
                let image = (self.decoder)(&path).unwrap_or_else(|e| {
                    tracing::warn!("Using placeholder background: {:#}", e);
                    placeholder_background()
                });
                self.install_background(image);
            }
        }
    }

    fn poll_background(&mut self) {
        let Some(pending) = self.pending_background.as_mut() else {
            return;
        };
        let Some(result) = (&mut pending.task).now_or_never() else {
            return;
        };
        if let Some(pending) = self.pending_background.take() {
            let image = finish_background(&pending.path, result);
            self.install_background(image);
        }
    }

    /// Wait for an in-progress background decode to be swapped in.
    pub async fn settle_background(&mut self) {
        if let Some(pending) = self.pending_background.take() {
            let result = pending.task.await;
            let image = finish_background(&pending.path, result);
            self.install_background(image);
        }
    }

    fn install_background(&mut self, image: RgbaImage) {
        if let Some(compositor) = self.compositor.as_mut() {
            if let Err(e) = compositor.set_background_image(image) {
                tracing::warn!("Failed to upload background image: {}", e);
            }
        }
    }

    /// Forget per-stream state so a new effect starts clean.
    pub fn reset_stream_state(&mut self) {
        self.masks.clear();
        if let Some(compositor) = self.compositor.as_mut() {
            if let Err(e) = compositor.reset_mask() {
                tracing::warn!("Failed to reset mask texture: {}", e);
            }
        }
        if let Some(model) = &self.model {
            model.lock().reset_state();
        }
    }

    /// Replace inference engine and GPU resources, keeping the device.
    pub async fn restart(&mut self, options: TransformerOptions) -> Result<(), TransformerError> {
        if self.destroyed {
            return Err(TransformerError::Destroyed);
        }
        let compositor = self.compositor.take().ok_or(TransformerError::Destroyed)?;
        self.masks.dispose();

        tracing::info!("Restarting background transformer");
        let device = compositor.into_device();
        let mut fresh = Self::new(options, device, Arc::clone(&self.segmenters))?;
        fresh.decoder = Arc::clone(&self.decoder);
        let result = fresh.init().await;
        *self = fresh;
        result
    }

    /// Release the engine and GPU resources. Idempotent.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        // Late inference results must not reach the compositor.
        self.destroyed = true;
        self.masks.dispose();

        if let Some(pending) = self.pending_background.take() {
            pending.task.abort();
        }
        if let Some(compositor) = self.compositor.as_mut() {
            compositor.cleanup();
        }
        self.model = None;
        tracing::debug!("Background transformer destroyed");
    }

    /// Destroy and hand the device to a new owner.
    pub fn into_device(mut self) -> Option<Box<dyn GpuDevice>> {
        self.destroy();
        self.compositor.take().map(Compositor::into_device)
    }
}

impl Drop for BackgroundTransformer {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn finish_background(
    path: &str,
    result: Result<anyhow::Result<RgbaImage>, tokio::task::JoinError>,
) -> RgbaImage {
    match result {
        Ok(Ok(image)) => {
            tracing::info!("Background image {} ready", path);
            image
        }
        Ok(Err(e)) => {
            tracing::warn!("Using placeholder background: {:#}", e);
            placeholder_background()
        }
        Err(e) => {
            tracing::warn!("Background decode for {} failed: {}", path, e);
            placeholder_background()
        }
    }
}

fn as_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Decode a background image from disk.
pub fn load_background(path: &str) -> anyhow::Result<RgbaImage> {
    let _span = tracing::debug_span!("load_background").entered();
    let image = image::open(path)
        .with_context(|| format!("Failed to load background image {}", path))?;
    Ok(image.to_rgba8())
}

/// Built-in background used when no image is configured or loading fails.
pub fn placeholder_background() -> RgbaImage {
    let (width, height) = PLACEHOLDER_SIZE;
    let top = [58.0, 74.0, 96.0];
    let bottom = [22.0, 28.0, 38.0];
    RgbaImage::from_fn(width, height, |_, y| {
        let t = y as f32 / (height - 1) as f32;
        let c = |i: usize| (top[i] + (bottom[i] - top[i]) * t) as u8;
        Rgba([c(0), c(1), c(2), 255])
    })
}
