use super::{BackgroundTransformer, FrameTransformer, TransformerOptions};
use crate::errors::TransformerError;
use crate::frame::Frame;
use crate::gpu::RenderMode;

/// Blurs everything behind the person.
pub struct BlurTransformer {
    engine: BackgroundTransformer,
}

impl BlurTransformer {
    pub fn new(engine: BackgroundTransformer) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &BackgroundTransformer {
        &self.engine
    }

    pub fn into_engine(self) -> BackgroundTransformer {
        self.engine
    }
}

impl FrameTransformer for BlurTransformer {
    async fn init(&mut self) -> Result<(), TransformerError> {
        self.engine.init().await
    }

    async fn restart(&mut self, options: TransformerOptions) -> Result<(), TransformerError> {
        self.engine.restart(options).await
    }

    async fn transform(&mut self, frame: Frame) -> Frame {
        self.engine.transform(frame, RenderMode::Blur).await
    }

    fn update(&mut self, options: &TransformerOptions) -> Result<(), TransformerError> {
        self.engine.update(options)
    }

    fn destroy(&mut self) {
        self.engine.destroy();
    }

    fn is_disabled(&self) -> bool {
        self.engine.is_disabled()
    }
}

/// Replaces everything behind the person with a static image.
pub struct VirtualBackgroundTransformer {
    engine: BackgroundTransformer,
}

impl VirtualBackgroundTransformer {
    pub fn new(engine: BackgroundTransformer) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &BackgroundTransformer {
        &self.engine
    }

    pub fn into_engine(self) -> BackgroundTransformer {
        self.engine
    }
}

impl FrameTransformer for VirtualBackgroundTransformer {
    async fn init(&mut self) -> Result<(), TransformerError> {
        self.engine.init().await
    }

    async fn restart(&mut self, options: TransformerOptions) -> Result<(), TransformerError> {
        self.engine.restart(options).await
    }

    async fn transform(&mut self, frame: Frame) -> Frame {
        self.engine
            .transform(frame, RenderMode::VirtualBackground)
            .await
    }

    fn update(&mut self, options: &TransformerOptions) -> Result<(), TransformerError> {
        self.engine.update(options)
    }

    fn destroy(&mut self) {
        self.engine.destroy();
    }

    fn is_disabled(&self) -> bool {
        self.engine.is_disabled()
    }
}

/// Emits frames untouched.
///
/// May hold a parked engine so a later effect switch can pick it up
/// without reloading the model.
#[derive(Default)]
pub struct PassthroughTransformer {
    engine: Option<BackgroundTransformer>,
}

impl PassthroughTransformer {
    pub fn parked(engine: Option<BackgroundTransformer>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> Option<&BackgroundTransformer> {
        self.engine.as_ref()
    }

    pub fn into_engine(self) -> Option<BackgroundTransformer> {
        self.engine
    }
}

impl FrameTransformer for PassthroughTransformer {
    async fn init(&mut self) -> Result<(), TransformerError> {
        match self.engine.as_mut() {
            Some(engine) => engine.init().await,
            None => Ok(()),
        }
    }

    async fn restart(&mut self, options: TransformerOptions) -> Result<(), TransformerError> {
        match self.engine.as_mut() {
            Some(engine) => engine.restart(options).await,
            None => Ok(()),
        }
    }

    async fn transform(&mut self, frame: Frame) -> Frame {
        frame
    }

    fn update(&mut self, options: &TransformerOptions) -> Result<(), TransformerError> {
        match self.engine.as_mut() {
            Some(engine) => engine.update(options),
            None => Ok(()),
        }
    }

    fn destroy(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.destroy();
        }
    }

    fn is_disabled(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Effect, Transformer};
    use super::*;
    use crate::gpu::{GpuDevice, ObjectCounts, SoftwareDevice};
    use crate::segmentation::{
        AssetPaths, Matte, SegmentationModel, SegmenterFactory, SegmenterOptions,
    };
    use image::{Rgba, RgbImage, RgbaImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Everything is background.
    struct EmptyModel {
        resets: Arc<AtomicUsize>,
    }

    impl SegmentationModel for EmptyModel {
        fn segment(&mut self, frame: &RgbImage) -> anyhow::Result<Matte> {
            let (w, h) = frame.dimensions();
            Ok(Matte::new(w, h, vec![0.0; (w * h) as usize]))
        }

        fn reset_state(&mut self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }

        fn input_size(&self) -> (u32, u32) {
            (0, 0)
        }
    }

    fn factory(resets: Arc<AtomicUsize>) -> SegmenterFactory {
        Arc::new(move |_: &SegmenterOptions, _: &AssetPaths| {
            Ok(Box::new(EmptyModel {
                resets: Arc::clone(&resets),
            }) as Box<dyn SegmentationModel>)
        })
    }

    fn checker() -> Frame {
        Frame::new(
            RgbaImage::from_fn(16, 16, |x, y| {
                if (x + y) % 2 == 0 {
                    Rgba([255, 255, 255, 255])
                } else {
                    Rgba([0, 0, 0, 255])
                }
            }),
            None,
        )
    }

    async fn transformer(effect: Effect, device: &SoftwareDevice) -> Transformer {
        let mut t = Transformer::new(
            effect,
            TransformerOptions::default(),
            Box::new(device.clone()),
            factory(Arc::new(AtomicUsize::new(0))),
        )
        .unwrap();
        t.init().await.unwrap();
        t
    }

    #[tokio::test]
    async fn passthrough_returns_the_same_frame() {
        let mut t = PassthroughTransformer::default();
        let input = checker();
        let expected = input.image().clone();
        let out = t.transform(input).await;
        assert_eq!(out.image(), &expected);
        assert!(t.is_disabled());
    }

    #[tokio::test]
    async fn effects_dispatch_to_their_render_mode() {
        let device = SoftwareDevice::new();
        let mut blur = transformer(Effect::Blur, &device).await;
        blur.transform(checker()).await;
        let out = blur.transform(checker()).await;
        // Blurred checkerboard settles towards grey.
        let p = out.image().get_pixel(8, 8);
        assert!(p[0] > 40 && p[0] < 215, "pixel {:?}", p);
        assert!(!blur.is_disabled());

        let device = SoftwareDevice::new();
        let mut virt = transformer(Effect::VirtualBackground, &device).await;
        let before = device.draw_calls();
        virt.transform(checker()).await;
        assert_eq!(device.draw_calls() - before, 1);
    }

    #[tokio::test]
    async fn switching_effect_keeps_engine_and_resets_state() {
        let resets = Arc::new(AtomicUsize::new(0));
        let device = SoftwareDevice::new();
        let mut t = Transformer::new(
            Effect::Blur,
            TransformerOptions::default(),
            Box::new(device.clone()),
            factory(Arc::clone(&resets)),
        )
        .unwrap();
        t.init().await.unwrap();
        t.transform(checker()).await;
        let counts = device.object_counts();

        let mut t = t.with_effect(Effect::None);
        assert_eq!(t.effect(), Effect::None);
        assert!(t.engine().is_some());
        assert_eq!(device.object_counts(), counts);
        assert_eq!(resets.load(Ordering::SeqCst), 1);

        // With the mask reset, the first frame after switching is untouched.
        let mut t = t.with_effect(Effect::Blur);
        let input = checker();
        let expected = input.image().clone();
        assert_eq!(t.transform(input).await.image(), &expected);

        t.destroy();
        assert_eq!(device.object_counts(), ObjectCounts::default());
    }

    #[tokio::test]
    async fn effect_none_passes_through_with_engine_parked() {
        let device = SoftwareDevice::new();
        let mut t = transformer(Effect::None, &device).await;
        let input = checker();
        let expected = input.image().clone();
        assert_eq!(t.transform(input).await.image(), &expected);
        assert_eq!(device.draw_calls(), 0);
        assert!(t.is_disabled());
    }

    #[tokio::test]
    async fn restart_reuses_device() {
        let device = SoftwareDevice::new();
        let mut t = transformer(Effect::Blur, &device).await;
        let counts = device.object_counts();

        let options = TransformerOptions {
            blur_radius: 20,
            ..TransformerOptions::default()
        };
        t.restart(options).await.unwrap();
        assert_eq!(device.object_counts(), counts);
        assert_eq!(t.engine().unwrap().compositor().unwrap().blur_radius(), 20);

        let device = t.into_device().unwrap();
        assert_eq!(device.object_counts(), ObjectCounts::default());
    }
}
