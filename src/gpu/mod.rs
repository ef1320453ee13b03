//! GPU abstraction used by the compositor.
//!
//! The compositor talks to a [`GpuDevice`], a small GL-style object model:
//! textures, framebuffers that render into a texture, compiled programs and
//! the default surface the final composite is drawn into. [`WgpuDevice`]
//! runs the passes as WGSL compute shaders; [`SoftwareDevice`] rasterizes
//! the same kernels on the CPU and can be instrumented.

mod compositor;
mod resources;
pub mod shaders;
mod software;
mod wgpu_device;

pub use compositor::{Compositor, RenderMode};
pub use resources::{GpuResources, Programs, RenderTarget};
pub use shaders::BlurKernel;
pub use software::SoftwareDevice;
pub use wgpu_device::WgpuDevice;

use image::RgbaImage;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(pub u32);

/// The four programs of the background pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderKind {
    Downsample,
    BlurHorizontal,
    BlurVertical,
    Composite,
}

/// Where a draw call writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawTarget {
    Framebuffer(FramebufferId),
    Surface,
}

/// Texel payload for a texture upload.
#[derive(Debug, Clone, Copy)]
pub enum TexelData<'a> {
    /// 8-bit RGBA, row-major.
    Rgba8(&'a [u8]),
    /// Single float channel, row-major.
    Luma32F(&'a [f32]),
}

/// Per-pass uniforms.
#[derive(Debug, Clone, Copy)]
pub enum PassParams<'a> {
    Downsample,
    Blur(&'a BlurKernel),
    Composite { edge_low: f32, edge_high: f32 },
}

/// Live object counts on a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectCounts {
    pub textures: usize,
    pub framebuffers: usize,
    pub programs: usize,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GpuError {
    #[error("GPU context lost")]
    ContextLost,

    #[error("no GPU context available: {0}")]
    Unavailable(String),

    #[error("unknown {kind} {id}")]
    UnknownObject { kind: &'static str, id: u32 },

    #[error("invalid size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },

    #[error("texel data has {got} values, expected {expected}")]
    DataLength { expected: usize, got: usize },

    #[error("program {kind:?} got {got} input textures, expected {expected}")]
    InputCount {
        kind: ShaderKind,
        expected: usize,
        got: usize,
    },

    #[error("pass parameters do not match program {0:?}")]
    ParamsMismatch(ShaderKind),

    #[error("texture {0} is both sampled and rendered to")]
    FeedbackLoop(u32),

    #[error("GPU backend error: {0}")]
    Backend(String),
}

/// GL-style device owning textures, framebuffers, programs and a surface.
///
/// Once the context is lost every call except deletion fails with
/// [`GpuError::ContextLost`] and all objects are gone; the owner has to
/// call [`GpuDevice::restore_context`] and recreate them.
pub trait GpuDevice: Send {
    fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureId, GpuError>;

    /// Reallocate texture storage, keeping the handle.
    fn resize_texture(&mut self, texture: TextureId, width: u32, height: u32)
        -> Result<(), GpuError>;

    /// Replace texture storage and contents.
    fn upload(
        &mut self,
        texture: TextureId,
        width: u32,
        height: u32,
        data: TexelData<'_>,
    ) -> Result<(), GpuError>;

    fn delete_texture(&mut self, texture: TextureId);

    fn create_framebuffer(&mut self, attachment: TextureId) -> Result<FramebufferId, GpuError>;

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId);

    fn create_program(&mut self, kind: ShaderKind) -> Result<ProgramId, GpuError>;

    fn delete_program(&mut self, program: ProgramId);

    /// Resize the default surface. Storage is only reallocated when growing.
    fn resize_surface(&mut self, width: u32, height: u32) -> Result<(), GpuError>;

    fn surface_size(&self) -> (u32, u32);

    fn draw(
        &mut self,
        program: ProgramId,
        inputs: &[TextureId],
        target: DrawTarget,
        params: &PassParams<'_>,
    ) -> Result<(), GpuError>;

    /// Read back the surface contents.
    fn read_surface(&mut self) -> Result<RgbaImage, GpuError>;

    fn is_context_lost(&self) -> bool;

    fn restore_context(&mut self) -> Result<(), GpuError>;

    fn object_counts(&self) -> ObjectCounts;
}

/// Creates the GPU context for a pipeline attachment.
pub type GpuContextFactory = Arc<dyn Fn() -> Result<Box<dyn GpuDevice>, GpuError> + Send + Sync>;

/// Factory opening a [`WgpuDevice`] per attachment. Fails with
/// [`GpuError::Unavailable`] when no compute-capable adapter exists.
pub fn wgpu_context_factory() -> GpuContextFactory {
    Arc::new(|| Ok(Box::new(WgpuDevice::new()?) as Box<dyn GpuDevice>))
}

/// Factory producing a fresh [`SoftwareDevice`] per attachment.
pub fn software_context_factory() -> GpuContextFactory {
    Arc::new(|| Ok(Box::new(SoftwareDevice::new()) as Box<dyn GpuDevice>))
}
