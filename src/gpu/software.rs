use super::shaders::{self, Texel, TexelView};
use super::{
    DrawTarget, FramebufferId, GpuDevice, GpuError, ObjectCounts, PassParams, ProgramId,
    ShaderKind, TexelData, TextureId,
};
use image::RgbaImage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// CPU rasterizer implementing [`GpuDevice`].
///
/// Clones share the same device, so a test can keep a handle to inspect
/// object counts or simulate a lost context while a compositor owns the
/// boxed device.
#[derive(Clone, Default)]
pub struct SoftwareDevice {
    state: Arc<Mutex<DeviceState>>,
}

#[derive(Default)]
struct DeviceState {
    next_id: u32,
    textures: HashMap<u32, Texture>,
    framebuffers: HashMap<u32, TextureId>,
    programs: HashMap<u32, ShaderKind>,
    surface: Surface,
    context_lost: bool,
    draw_calls: u64,
    uploads: u64,
}

struct Texture {
    width: u32,
    height: u32,
    texels: Vec<Texel>,
}

impl Texture {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            texels: vec![[0.0; 4]; width as usize * height as usize],
        }
    }

    fn view(&self) -> TexelView<'_> {
        TexelView {
            width: self.width,
            height: self.height,
            texels: &self.texels,
        }
    }
}

#[derive(Default)]
struct Surface {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    allocations: u64,
}

impl DeviceState {
    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn check_context(&self) -> Result<(), GpuError> {
        if self.context_lost {
            Err(GpuError::ContextLost)
        } else {
            Ok(())
        }
    }

    fn texture_mut(&mut self, texture: TextureId) -> Result<&mut Texture, GpuError> {
        self.textures
            .get_mut(&texture.0)
            .ok_or(GpuError::UnknownObject {
                kind: "texture",
                id: texture.0,
            })
    }
}

fn check_size(width: u32, height: u32) -> Result<(), GpuError> {
    if width == 0 || height == 0 {
        return Err(GpuError::InvalidSize { width, height });
    }
    Ok(())
}

fn to_unorm(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every object and fail subsequent calls until restored.
    pub fn lose_context(&self) {
        let mut state = self.state.lock();
        tracing::warn!("Simulating GPU context loss");
        state.context_lost = true;
        state.textures.clear();
        state.framebuffers.clear();
        state.programs.clear();
    }

    pub fn draw_calls(&self) -> u64 {
        self.state.lock().draw_calls
    }

    pub fn uploads(&self) -> u64 {
        self.state.lock().uploads
    }

    /// How many times surface storage was (re)allocated.
    pub fn surface_allocations(&self) -> u64 {
        self.state.lock().surface.allocations
    }
}

impl GpuDevice for SoftwareDevice {
    fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureId, GpuError> {
        let mut state = self.state.lock();
        state.check_context()?;
        check_size(width, height)?;
        let id = state.alloc_id();
        state.textures.insert(id, Texture::new(width, height));
        Ok(TextureId(id))
    }

    fn resize_texture(
        &mut self,
        texture: TextureId,
        width: u32,
        height: u32,
    ) -> Result<(), GpuError> {
        let mut state = self.state.lock();
        state.check_context()?;
        check_size(width, height)?;
        let tex = state.texture_mut(texture)?;
        if (tex.width, tex.height) != (width, height) {
            *tex = Texture::new(width, height);
        }
        Ok(())
    }

    fn upload(
        &mut self,
        texture: TextureId,
        width: u32,
        height: u32,
        data: TexelData<'_>,
    ) -> Result<(), GpuError> {
        let mut state = self.state.lock();
        state.check_context()?;
        check_size(width, height)?;

        let count = width as usize * height as usize;
        let texels: Vec<Texel> = match data {
            TexelData::Rgba8(bytes) => {
                if bytes.len() != count * 4 {
                    return Err(GpuError::DataLength {
                        expected: count * 4,
                        got: bytes.len(),
                    });
                }
                bytes
                    .chunks_exact(4)
                    .map(|p| {
                        [
                            p[0] as f32 / 255.0,
                            p[1] as f32 / 255.0,
                            p[2] as f32 / 255.0,
                            p[3] as f32 / 255.0,
                        ]
                    })
                    .collect()
            }
            TexelData::Luma32F(values) => {
                if values.len() != count {
                    return Err(GpuError::DataLength {
                        expected: count,
                        got: values.len(),
                    });
                }
                values.iter().map(|&v| [v, v, v, 1.0]).collect()
            }
        };

        let tex = state.texture_mut(texture)?;
        tex.width = width;
        tex.height = height;
        tex.texels = texels;
        state.uploads += 1;
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureId) {
        self.state.lock().textures.remove(&texture.0);
    }

    fn create_framebuffer(&mut self, attachment: TextureId) -> Result<FramebufferId, GpuError> {
        let mut state = self.state.lock();
        state.check_context()?;
        if !state.textures.contains_key(&attachment.0) {
            return Err(GpuError::UnknownObject {
                kind: "texture",
                id: attachment.0,
            });
        }
        let id = state.alloc_id();
        state.framebuffers.insert(id, attachment);
        Ok(FramebufferId(id))
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) {
        self.state.lock().framebuffers.remove(&framebuffer.0);
    }

    fn create_program(&mut self, kind: ShaderKind) -> Result<ProgramId, GpuError> {
        let mut state = self.state.lock();
        state.check_context()?;
        let id = state.alloc_id();
        state.programs.insert(id, kind);
        Ok(ProgramId(id))
    }

    fn delete_program(&mut self, program: ProgramId) {
        self.state.lock().programs.remove(&program.0);
    }

    fn resize_surface(&mut self, width: u32, height: u32) -> Result<(), GpuError> {
        let mut state = self.state.lock();
        state.check_context()?;
        check_size(width, height)?;

        let surface = &mut state.surface;
        let needed = width as usize * height as usize * 4;
        if needed > surface.pixels.capacity() {
            tracing::debug!(width, height, "Growing surface storage");
            surface.allocations += 1;
        }
        surface.pixels.resize(needed, 0);
        surface.width = width;
        surface.height = height;
        Ok(())
    }

    fn surface_size(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.surface.width, state.surface.height)
    }

    fn draw(
        &mut self,
        program: ProgramId,
        inputs: &[TextureId],
        target: DrawTarget,
        params: &PassParams<'_>,
    ) -> Result<(), GpuError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.check_context()?;
        state.draw_calls += 1;

        let kind = *state
            .programs
            .get(&program.0)
            .ok_or(GpuError::UnknownObject {
                kind: "program",
                id: program.0,
            })?;

        let target_texture = match target {
            DrawTarget::Surface => None,
            DrawTarget::Framebuffer(fb) => Some(*state.framebuffers.get(&fb.0).ok_or(
                GpuError::UnknownObject {
                    kind: "framebuffer",
                    id: fb.0,
                },
            )?),
        };
        if let Some(attached) = target_texture {
            if inputs.contains(&attached) {
                return Err(GpuError::FeedbackLoop(attached.0));
            }
        }

        let (width, height) = match target_texture {
            None => (state.surface.width, state.surface.height),
            Some(attached) => {
                let tex = state.texture_mut(attached)?;
                (tex.width, tex.height)
            }
        };
        check_size(width, height)?;

        let views = inputs
            .iter()
            .map(|id| {
                state
                    .textures
                    .get(&id.0)
                    .map(Texture::view)
                    .ok_or(GpuError::UnknownObject {
                        kind: "texture",
                        id: id.0,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let output = shaders::run(kind, &views, width, height, params)?;
        drop(views);

        match target_texture {
            Some(attached) => state.texture_mut(attached)?.texels = output,
            None => {
                for (dst, texel) in state.surface.pixels.chunks_exact_mut(4).zip(&output) {
                    for c in 0..4 {
                        dst[c] = to_unorm(texel[c]);
                    }
                }
            }
        }
        Ok(())
    }

    fn read_surface(&mut self) -> Result<RgbaImage, GpuError> {
        let state = self.state.lock();
        state.check_context()?;
        let surface = &state.surface;
        let len = surface.width as usize * surface.height as usize * 4;
        RgbaImage::from_raw(
            surface.width,
            surface.height,
            surface.pixels[..len].to_vec(),
        )
        .ok_or(GpuError::InvalidSize {
            width: surface.width,
            height: surface.height,
        })
    }

    fn is_context_lost(&self) -> bool {
        self.state.lock().context_lost
    }

    fn restore_context(&mut self) -> Result<(), GpuError> {
        let mut state = self.state.lock();
        if state.context_lost {
            tracing::info!("GPU context restored");
            state.context_lost = false;
        }
        Ok(())
    }

    fn object_counts(&self) -> ObjectCounts {
        let state = self.state.lock();
        ObjectCounts {
            textures: state.textures.len(),
            framebuffers: state.framebuffers.len(),
            programs: state.programs.len(),
        }
    }
}
