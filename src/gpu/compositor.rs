use super::shaders::clamp_blur_radius;
use super::{
    BlurKernel, DrawTarget, GpuDevice, GpuError, GpuResources, PassParams, TexelData,
};
use crate::constants::{MASK_EDGE_HIGH, MASK_EDGE_LOW};
use crate::segmentation::Matte;
use image::{imageops, RgbaImage};

/// What the composite pass puts behind the person.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Blurred copy of the frame.
    Blur,
    /// Static background image.
    VirtualBackground,
}

/// Draws frames through the downsample, blur and composite passes.
///
/// The compositor owns its device and the [`GpuResources`] created on it.
/// [`Compositor::cleanup`] must run before the device is reused or dropped;
/// [`Compositor::into_device`] does both.
pub struct Compositor {
    device: Box<dyn GpuDevice>,
    resources: Option<GpuResources>,
    kernel: BlurKernel,
    background: Option<RgbaImage>,
    size: (u32, u32),
    rebuilds: u64,
}

impl Compositor {
    pub fn new(mut device: Box<dyn GpuDevice>, blur_radius: u32) -> Result<Self, GpuError> {
        if device.is_context_lost() {
            device.restore_context()?;
        }
        let resources = GpuResources::create(device.as_mut(), 1, 1)?;

        Ok(Self {
            device,
            resources: Some(resources),
            kernel: BlurKernel::new(blur_radius),
            background: None,
            size: (0, 0),
            rebuilds: 0,
        })
    }

    pub fn resources(&self) -> Option<&GpuResources> {
        self.resources.as_ref()
    }

    /// Current frame size, `(0, 0)` before the first frame.
    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn blur_radius(&self) -> u32 {
        self.kernel.radius()
    }

    /// How many times the resource set was rebuilt after a context loss.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// Change the blur radius. Only the kernel table is recomputed.
    pub fn set_blur_radius(&mut self, radius: u32) {
        let radius = clamp_blur_radius(radius);
        if radius != self.kernel.radius() {
            tracing::debug!(radius, "Recomputing blur kernel");
            self.kernel = BlurKernel::new(radius);
        }
    }

    /// Match the surface and blur targets to a new frame size.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), GpuError> {
        if (width, height) == self.size {
            return Ok(());
        }
        let resources = self.resources.as_ref().ok_or_else(cleaned_up)?;

        tracing::debug!(width, height, "Resizing compositor");
        self.device.resize_surface(width, height)?;
        resources.resize(self.device.as_mut(), width, height)?;
        self.size = (width, height);
        self.upload_background()
    }

    /// Install the virtual background, cover-fitted to the frame size.
    pub fn set_background_image(&mut self, image: RgbaImage) -> Result<(), GpuError> {
        self.background = Some(image);
        self.upload_background()
    }

    pub fn has_background(&self) -> bool {
        self.background.is_some()
    }

    fn upload_background(&mut self) -> Result<(), GpuError> {
        let (Some(resources), Some(image)) = (&self.resources, &self.background) else {
            return Ok(());
        };
        let (width, height) = self.size;
        if width == 0 || height == 0 {
            return Ok(());
        }
        let covered = cover(image, width, height);
        self.device.upload(
            resources.background,
            width,
            height,
            TexelData::Rgba8(covered.as_raw()),
        )
    }

    /// Replace the mask texture with a completed segmentation result.
    pub fn update_mask(&mut self, matte: &Matte) -> Result<(), GpuError> {
        self.upload_mask(matte.width, matte.height, &matte.data)
    }

    /// Reset the mask texture to full foreground.
    pub fn reset_mask(&mut self) -> Result<(), GpuError> {
        self.upload_mask(1, 1, &[1.0])
    }

    fn upload_mask(&mut self, width: u32, height: u32, data: &[f32]) -> Result<(), GpuError> {
        let mask = self.resources.as_ref().ok_or_else(cleaned_up)?.mask;
        match self.device.upload(mask, width, height, TexelData::Luma32F(data)) {
            Err(GpuError::ContextLost) => {
                tracing::warn!("GPU context lost during mask upload, rebuilding");
                self.rebuild()?;
                let mask = self.resources.as_ref().ok_or_else(cleaned_up)?.mask;
                self.device
                    .upload(mask, width, height, TexelData::Luma32F(data))
            }
            result => result,
        }
    }

    /// Render `frame` with the given background treatment.
    ///
    /// A lost context is rebuilt and the draw retried once.
    pub fn render_frame(
        &mut self,
        frame: &RgbaImage,
        mode: RenderMode,
    ) -> Result<RgbaImage, GpuError> {
        match self.draw(frame, mode) {
            Err(GpuError::ContextLost) => {
                tracing::warn!("GPU context lost, rebuilding compositor resources");
                self.rebuild()?;
                self.draw(frame, mode)
            }
            result => result,
        }
    }

    fn draw(&mut self, frame: &RgbaImage, mode: RenderMode) -> Result<RgbaImage, GpuError> {
        let resources = self.resources.clone().ok_or_else(cleaned_up)?;
        let (width, height) = frame.dimensions();
        self.resize(width, height)?;

        let device = self.device.as_mut();
        device.upload(resources.source, width, height, TexelData::Rgba8(frame.as_raw()))?;

        let programs = resources.programs;
        let background = match mode {
            RenderMode::Blur => {
                let _span = tracing::debug_span!("blur_passes").entered();
                device.draw(
                    programs.downsample,
                    &[resources.source],
                    DrawTarget::Framebuffer(resources.pong.framebuffer),
                    &PassParams::Downsample,
                )?;
                device.draw(
                    programs.blur_horizontal,
                    &[resources.pong.texture],
                    DrawTarget::Framebuffer(resources.ping.framebuffer),
                    &PassParams::Blur(&self.kernel),
                )?;
                device.draw(
                    programs.blur_vertical,
                    &[resources.ping.texture],
                    DrawTarget::Framebuffer(resources.pong.framebuffer),
                    &PassParams::Blur(&self.kernel),
                )?;
                resources.pong.texture
            }
            RenderMode::VirtualBackground => resources.background,
        };

        let _span = tracing::debug_span!("composite_pass").entered();
        device.draw(
            programs.composite,
            &[resources.source, background, resources.mask],
            DrawTarget::Surface,
            &PassParams::Composite {
                edge_low: MASK_EDGE_LOW,
                edge_high: MASK_EDGE_HIGH,
            },
        )?;
        device.read_surface()
    }

    fn rebuild(&mut self) -> Result<(), GpuError> {
        if let Some(stale) = self.resources.take() {
            stale.dispose(self.device.as_mut());
        }
        self.device.restore_context()?;

        let (width, height) = self.size;
        let resources = GpuResources::create(self.device.as_mut(), width.max(1), height.max(1))?;
        if width > 0 && height > 0 {
            self.device.resize_surface(width, height)?;
        }
        self.resources = Some(resources);
        self.rebuilds += 1;
        self.upload_background()
    }

    /// Delete every GPU object this compositor created. Idempotent.
    pub fn cleanup(&mut self) {
        if let Some(resources) = self.resources.take() {
            tracing::debug!("Releasing compositor resources");
            resources.dispose(self.device.as_mut());
        }
    }

    /// Clean up and hand the device to a new owner.
    pub fn into_device(mut self) -> Box<dyn GpuDevice> {
        self.cleanup();
        self.device
    }
}

fn cleaned_up() -> GpuError {
    GpuError::Unavailable("compositor resources were released".to_string())
}

/// Scale `image` to cover `width` x `height`, cropping the overflow evenly.
pub fn cover(image: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    let (src_w, src_h) = image.dimensions();
    if (src_w, src_h) == (width, height) {
        return image.clone();
    }
    if src_w == 0 || src_h == 0 {
        return RgbaImage::new(width, height);
    }

    let scale = (width as f32 / src_w as f32).max(height as f32 / src_h as f32);
    let crop_w = ((width as f32 / scale).round() as u32).clamp(1, src_w);
    let crop_h = ((height as f32 / scale).round() as u32).clamp(1, src_h);
    let x = (src_w - crop_w) / 2;
    let y = (src_h - crop_h) / 2;

    let cropped = imageops::crop_imm(image, x, y, crop_w, crop_h).to_image();
    imageops::resize(&cropped, width, height, imageops::FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{ObjectCounts, SoftwareDevice};
    use image::Rgba;

    fn frame(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x * 4) as u8, (y * 4) as u8, 128, 255])
        })
    }

    #[test]
    fn blur_radius_change_keeps_resources() {
        let device = SoftwareDevice::new();
        let mut compositor = Compositor::new(Box::new(device.clone()), 10).unwrap();
        compositor.render_frame(&frame(32, 24), RenderMode::Blur).unwrap();
        let before = compositor.resources().cloned();
        let counts = device.object_counts();

        compositor.set_blur_radius(20);
        compositor.render_frame(&frame(32, 24), RenderMode::Blur).unwrap();

        assert_eq!(compositor.resources().cloned(), before);
        assert_eq!(device.object_counts(), counts);
        assert_eq!(compositor.blur_radius(), 20);
    }

    #[test]
    fn blur_runs_four_passes_virtual_runs_one() {
        let device = SoftwareDevice::new();
        let mut compositor = Compositor::new(Box::new(device.clone()), 5).unwrap();

        compositor.render_frame(&frame(16, 16), RenderMode::Blur).unwrap();
        assert_eq!(device.draw_calls(), 4);

        compositor
            .set_background_image(RgbaImage::from_pixel(8, 8, Rgba([0, 255, 0, 255])))
            .unwrap();
        compositor
            .render_frame(&frame(16, 16), RenderMode::VirtualBackground)
            .unwrap();
        assert_eq!(device.draw_calls(), 5);
    }

    #[test]
    fn full_foreground_mask_keeps_frame_sharp() {
        let mut compositor = Compositor::new(Box::new(SoftwareDevice::new()), 10).unwrap();
        let input = frame(16, 12);
        let out = compositor.render_frame(&input, RenderMode::Blur).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn empty_mask_shows_virtual_background() {
        let mut compositor = Compositor::new(Box::new(SoftwareDevice::new()), 10).unwrap();
        compositor
            .set_background_image(RgbaImage::from_pixel(4, 4, Rgba([0, 0, 255, 255])))
            .unwrap();
        compositor
            .update_mask(&Matte::new(2, 2, vec![0.0; 4]))
            .unwrap();

        let out = compositor
            .render_frame(&frame(8, 8), RenderMode::VirtualBackground)
            .unwrap();
        assert!(out.pixels().all(|p| p.0[0] <= 1 && p.0[2] >= 254));
    }

    #[test]
    fn context_loss_triggers_rebuild() {
        let device = SoftwareDevice::new();
        let mut compositor = Compositor::new(Box::new(device.clone()), 10).unwrap();
        compositor.render_frame(&frame(16, 16), RenderMode::Blur).unwrap();
        let counts = device.object_counts();

        device.lose_context();
        let out = compositor.render_frame(&frame(16, 16), RenderMode::Blur);

        assert!(out.is_ok());
        assert_eq!(compositor.rebuilds(), 1);
        assert_eq!(device.object_counts(), counts);
    }

    #[test]
    fn mask_upload_recovers_lost_context() {
        let device = SoftwareDevice::new();
        let mut compositor = Compositor::new(Box::new(device.clone()), 10).unwrap();
        compositor.render_frame(&frame(8, 8), RenderMode::Blur).unwrap();

        device.lose_context();
        compositor
            .update_mask(&Matte::new(2, 2, vec![0.5; 4]))
            .unwrap();
        assert_eq!(compositor.rebuilds(), 1);
        assert!(compositor.render_frame(&frame(8, 8), RenderMode::Blur).is_ok());
    }

    #[test]
    fn cleanup_is_idempotent_and_complete() {
        let device = SoftwareDevice::new();
        let mut compositor = Compositor::new(Box::new(device.clone()), 10).unwrap();
        compositor.render_frame(&frame(8, 8), RenderMode::Blur).unwrap();

        compositor.cleanup();
        compositor.cleanup();
        assert_eq!(device.object_counts(), ObjectCounts::default());
        assert!(compositor.render_frame(&frame(8, 8), RenderMode::Blur).is_err());
    }

    #[test]
    fn cover_crops_to_target_aspect() {
        let wide = RgbaImage::from_fn(200, 100, |x, _| {
            if x < 50 || x >= 150 {
                Rgba([255, 0, 0, 255])
            } else {
                Rgba([0, 255, 0, 255])
            }
        });
        let out = cover(&wide, 50, 50);
        assert_eq!(out.dimensions(), (50, 50));
        // The red side bands are cropped away.
        assert!(out.pixels().all(|p| p.0[1] > p.0[0]));
    }
}
