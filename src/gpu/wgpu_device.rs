use super::shaders::input_count;
use super::{
    DrawTarget, FramebufferId, GpuDevice, GpuError, ObjectCounts, PassParams, ProgramId,
    ShaderKind, TexelData, TextureId,
};
use crate::constants::MAX_BLUR_RADIUS;
use bytemuck::Zeroable;
use image::RgbaImage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const WORKGROUP_SIZE: u32 = 16;

/// Uniform block shared by all four entry points.
#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct PassUniforms {
    target_width: u32,
    target_height: u32,
    radius: u32,
    _pad0: u32,
    edge_low: f32,
    edge_high: f32,
    _pad1: [f32; 2],
}

/// Device, queue and the objects every program shares.
struct Context {
    device: wgpu::Device,
    queue: wgpu::Queue,
    lost: Arc<AtomicBool>,
    module: wgpu::ShaderModule,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    uniforms: wgpu::Buffer,
    weights: wgpu::Buffer,
}

impl Context {
    fn open(adapter: &wgpu::Adapter) -> Result<Self, GpuError> {
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("background_compositor"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| GpuError::Unavailable(format!("failed to create GPU device: {}", e)))?;

        // Each device gets its own flag, so dropping an old one cannot
        // mark its replacement as lost.
        let lost = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&lost);
        device.set_device_lost_callback(move |reason, message| {
            warn!(?reason, %message, "GPU device lost");
            flag.store(true, Ordering::SeqCst);
        });
        device.on_uncaptured_error(Box::new(|error: wgpu::Error| {
            tracing::error!("Uncaptured GPU error: {}", error);
        }));

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("background_shaders"),
            source: wgpu::ShaderSource::Wgsl(include_str!("background.wgsl").into()),
        });

        let sampled = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: false },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        };
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("background_bind_group_layout"),
            entries: &[
                sampled(0),
                sampled(1),
                sampled(2),
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: wgpu::TextureFormat::Rgba8Unorm,
                        view_dimension: wgpu::TextureViewDimension::D2,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 5,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("background_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let uniforms = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("background_uniforms"),
            size: std::mem::size_of::<PassUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let weights = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("blur_weights"),
            size: (MAX_BLUR_RADIUS as u64 + 1) * 4,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Ok(Self {
            device,
            queue,
            lost,
            module,
            bind_group_layout,
            pipeline_layout,
            uniforms,
            weights,
        })
    }

    fn allocate(&self, width: u32, height: u32, format: wgpu::TextureFormat) -> Texture {
        let usage = match format {
            wgpu::TextureFormat::Rgba8Unorm => {
                wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::STORAGE_BINDING
                    | wgpu::TextureUsages::COPY_DST
                    | wgpu::TextureUsages::COPY_SRC
            }
            _ => wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: None,
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Texture {
            texture,
            view,
            width,
            height,
            format,
        }
    }

    /// Surface errors raised by the calls since `push_error_scope`.
    fn pop_errors(&self) -> Result<(), GpuError> {
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(error) => Err(GpuError::Backend(error.to_string())),
            None => Ok(()),
        }
    }
}

struct Texture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
}

/// [`GpuDevice`] on a wgpu adapter, running every pass as a WGSL compute
/// shader.
///
/// Framebuffers are bookkeeping only: a draw into one writes the attached
/// texture through a storage binding. The default surface is an RGBA
/// texture that only grows, read back through a staging buffer.
pub struct WgpuDevice {
    adapter: wgpu::Adapter,
    context: Option<Context>,
    next_id: u32,
    textures: HashMap<u32, Texture>,
    framebuffers: HashMap<u32, TextureId>,
    programs: HashMap<u32, (ShaderKind, wgpu::ComputePipeline)>,
    surface: Option<Texture>,
    surface_size: (u32, u32),
}

impl WgpuDevice {
    /// Request an adapter able to run compute shaders and open a device on it.
    pub fn new() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| GpuError::Unavailable("no GPU adapter found".to_string()))?;

        let adapter_info = adapter.get_info();
        if !adapter
            .get_downlevel_capabilities()
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
        {
            return Err(GpuError::Unavailable(format!(
                "adapter {} has no compute shader support",
                adapter_info.name
            )));
        }
        info!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            "GPU adapter selected"
        );

        let context = Context::open(&adapter)?;
        Ok(Self {
            adapter,
            context: Some(context),
            next_id: 0,
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            programs: HashMap::new(),
            surface: None,
            surface_size: (0, 0),
        })
    }

    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    /// Fail with `ContextLost` once the device is gone, dropping every object.
    fn check_context(&mut self) -> Result<(), GpuError> {
        let lost = match &self.context {
            Some(context) => context.lost.load(Ordering::SeqCst),
            None => true,
        };
        if lost {
            if self.context.take().is_some() {
                self.textures.clear();
                self.framebuffers.clear();
                self.programs.clear();
                self.surface = None;
            }
            return Err(GpuError::ContextLost);
        }
        Ok(())
    }

    fn context(&mut self) -> Result<&Context, GpuError> {
        self.check_context()?;
        self.context.as_ref().ok_or(GpuError::ContextLost)
    }
}

fn check_size(width: u32, height: u32) -> Result<(), GpuError> {
    if width == 0 || height == 0 {
        return Err(GpuError::InvalidSize { width, height });
    }
    Ok(())
}

fn unknown_texture(texture: TextureId) -> GpuError {
    GpuError::UnknownObject {
        kind: "texture",
        id: texture.0,
    }
}

fn entry_point(kind: ShaderKind) -> &'static str {
    match kind {
        ShaderKind::Downsample => "downsample",
        ShaderKind::BlurHorizontal => "blur_horizontal",
        ShaderKind::BlurVertical => "blur_vertical",
        ShaderKind::Composite => "composite",
    }
}

impl GpuDevice for WgpuDevice {
    fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureId, GpuError> {
        check_size(width, height)?;
        let texture = self
            .context()?
            .allocate(width, height, wgpu::TextureFormat::Rgba8Unorm);
        let id = self.alloc_id();
        self.textures.insert(id, texture);
        Ok(TextureId(id))
    }

    fn resize_texture(
        &mut self,
        texture: TextureId,
        width: u32,
        height: u32,
    ) -> Result<(), GpuError> {
        check_size(width, height)?;
        self.check_context()?;
        let Some(context) = &self.context else {
            return Err(GpuError::ContextLost);
        };
        let tex = self
            .textures
            .get_mut(&texture.0)
            .ok_or_else(|| unknown_texture(texture))?;
        if (tex.width, tex.height) != (width, height) {
            *tex = context.allocate(width, height, tex.format);
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
        check_size(width, height)?;
        self.check_context()?;
        let Some(context) = &self.context else {
            return Err(GpuError::ContextLost);
        };

        let count = width as usize * height as usize;
        let (format, bytes): (_, &[u8]) = match data {
            TexelData::Rgba8(bytes) => {
                if bytes.len() != count * 4 {
                    return Err(GpuError::DataLength {
                        expected: count * 4,
                        got: bytes.len(),
                    });
                }
                (wgpu::TextureFormat::Rgba8Unorm, bytes)
            }
            TexelData::Luma32F(values) => {
                if values.len() != count {
                    return Err(GpuError::DataLength {
                        expected: count,
                        got: values.len(),
                    });
                }
                (wgpu::TextureFormat::R32Float, bytemuck::cast_slice(values))
            }
        };

        let tex = self
            .textures
            .get_mut(&texture.0)
            .ok_or_else(|| unknown_texture(texture))?;
        if (tex.width, tex.height, tex.format) != (width, height, format) {
            *tex = context.allocate(width, height, format);
        }

        context.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &tex.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytes,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(width * 4),
                rows_per_image: None,
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture.0);
    }

    fn create_framebuffer(&mut self, attachment: TextureId) -> Result<FramebufferId, GpuError> {
        self.check_context()?;
        if !self.textures.contains_key(&attachment.0) {
            return Err(unknown_texture(attachment));
        }
        let id = self.alloc_id();
        self.framebuffers.insert(id, attachment);
        Ok(FramebufferId(id))
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) {
        self.framebuffers.remove(&framebuffer.0);
    }

    fn create_program(&mut self, kind: ShaderKind) -> Result<ProgramId, GpuError> {
        let context = self.context()?;
        let entry = entry_point(kind);
        context.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = context
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: Some(&context.pipeline_layout),
                module: &context.module,
                entry_point: Some(entry),
                compilation_options: Default::default(),
                cache: None,
            });
        context.pop_errors()?;
        debug!(entry, "Compiled compute pipeline");

        let id = self.alloc_id();
        self.programs.insert(id, (kind, pipeline));
        Ok(ProgramId(id))
    }

    fn delete_program(&mut self, program: ProgramId) {
        self.programs.remove(&program.0);
    }

    fn resize_surface(&mut self, width: u32, height: u32) -> Result<(), GpuError> {
        check_size(width, height)?;
        self.check_context()?;
        let Some(context) = &self.context else {
            return Err(GpuError::ContextLost);
        };

        let (capacity_w, capacity_h) = self
            .surface
            .as_ref()
            .map_or((0, 0), |s| (s.width, s.height));
        if width > capacity_w || height > capacity_h {
            let (w, h) = (width.max(capacity_w), height.max(capacity_h));
            debug!(width = w, height = h, "Growing surface storage");
            self.surface = Some(context.allocate(w, h, wgpu::TextureFormat::Rgba8Unorm));
        }
        self.surface_size = (width, height);
        Ok(())
    }

    fn surface_size(&self) -> (u32, u32) {
        self.surface_size
    }

    fn draw(
        &mut self,
        program: ProgramId,
        inputs: &[TextureId],
        target: DrawTarget,
        params: &PassParams<'_>,
    ) -> Result<(), GpuError> {
        self.check_context()?;
        let Some(context) = &self.context else {
            return Err(GpuError::ContextLost);
        };

        let (kind, pipeline) = self.programs.get(&program.0).ok_or(GpuError::UnknownObject {
            kind: "program",
            id: program.0,
        })?;
        let kind = *kind;
        let expected = input_count(kind);
        if inputs.len() != expected {
            return Err(GpuError::InputCount {
                kind,
                expected,
                got: inputs.len(),
            });
        }

        let (output, width, height) = match target {
            DrawTarget::Surface => {
                let (width, height) = self.surface_size;
                let surface = self
                    .surface
                    .as_ref()
                    .ok_or(GpuError::InvalidSize { width, height })?;
                (&surface.view, width, height)
            }
            DrawTarget::Framebuffer(fb) => {
                let attached = *self.framebuffers.get(&fb.0).ok_or(GpuError::UnknownObject {
                    kind: "framebuffer",
                    id: fb.0,
                })?;
                if inputs.contains(&attached) {
                    return Err(GpuError::FeedbackLoop(attached.0));
                }
                let tex = self
                    .textures
                    .get(&attached.0)
                    .ok_or_else(|| unknown_texture(attached))?;
                if tex.format != wgpu::TextureFormat::Rgba8Unorm {
                    return Err(GpuError::Backend(format!(
                        "texture {} cannot be rendered to",
                        attached.0
                    )));
                }
                (&tex.view, tex.width, tex.height)
            }
        };
        check_size(width, height)?;

        let mut uniforms = PassUniforms {
            target_width: width,
            target_height: height,
            ..PassUniforms::zeroed()
        };
        match (kind, params) {
            (ShaderKind::Downsample, PassParams::Downsample) => {}
            (ShaderKind::BlurHorizontal | ShaderKind::BlurVertical, PassParams::Blur(kernel)) => {
                uniforms.radius = kernel.radius();
                context
                    .queue
                    .write_buffer(&context.weights, 0, bytemuck::cast_slice(kernel.weights()));
            }
            (
                ShaderKind::Composite,
                PassParams::Composite {
                    edge_low,
                    edge_high,
                },
            ) => {
                uniforms.edge_low = *edge_low;
                uniforms.edge_high = *edge_high;
            }
            _ => return Err(GpuError::ParamsMismatch(kind)),
        }
        context
            .queue
            .write_buffer(&context.uniforms, 0, bytemuck::bytes_of(&uniforms));

        let views = inputs
            .iter()
            .map(|id| {
                self.textures
                    .get(&id.0)
                    .map(|t| &t.view)
                    .ok_or_else(|| unknown_texture(*id))
            })
            .collect::<Result<Vec<_>, _>>()?;
        // Single-input programs still bind all three slots.
        let input = |slot: usize| views[slot.min(views.len() - 1)];

        context.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group = context.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(entry_point(kind)),
            layout: &context.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(input(0)),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(input(1)),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(input(2)),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(output),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: context.uniforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: context.weights.as_entire_binding(),
                },
            ],
        });

        let mut encoder = context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(entry_point(kind)),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(entry_point(kind)),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(
                width.div_ceil(WORKGROUP_SIZE),
                height.div_ceil(WORKGROUP_SIZE),
                1,
            );
        }
        context.queue.submit(Some(encoder.finish()));
        context.pop_errors()?;
        self.check_context()
    }

    fn read_surface(&mut self) -> Result<RgbaImage, GpuError> {
        self.check_context()?;
        let Some(context) = &self.context else {
            return Err(GpuError::ContextLost);
        };
        let (width, height) = self.surface_size;
        let surface = self
            .surface
            .as_ref()
            .ok_or(GpuError::InvalidSize { width, height })?;

        let row_bytes = width * 4;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_row = row_bytes.div_ceil(align) * align;
        let staging = context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("surface_readback"),
            size: padded_row as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("surface_readback"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &surface.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        context.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = context.device.poll(wgpu::Maintain::Wait);

        let mapped = rx
            .recv()
            .map_err(|e| GpuError::Backend(format!("readback never completed: {}", e)))
            .and_then(|r| r.map_err(|e| GpuError::Backend(format!("readback failed: {}", e))));
        if let Err(e) = mapped {
            // A lost device fails the map; report that as the cause.
            self.check_context()?;
            return Err(e);
        }

        let data = slice.get_mapped_range();
        let mut pixels = Vec::with_capacity(row_bytes as usize * height as usize);
        for row in data.chunks(padded_row as usize).take(height as usize) {
            pixels.extend_from_slice(&row[..row_bytes as usize]);
        }
        drop(data);
        staging.unmap();

        RgbaImage::from_raw(width, height, pixels).ok_or(GpuError::InvalidSize { width, height })
    }

    fn is_context_lost(&self) -> bool {
        match &self.context {
            Some(context) => context.lost.load(Ordering::SeqCst),
            None => true,
        }
    }

    fn restore_context(&mut self) -> Result<(), GpuError> {
        if !self.is_context_lost() {
            return Ok(());
        }
        self.context = None;
        self.textures.clear();
        self.framebuffers.clear();
        self.programs.clear();
        self.surface = None;
        self.surface_size = (0, 0);

        self.context = Some(Context::open(&self.adapter)?);
        info!("GPU device recreated");
        Ok(())
    }

    fn object_counts(&self) -> ObjectCounts {
        ObjectCounts {
            textures: self.textures.len(),
            framebuffers: self.framebuffers.len(),
            programs: self.programs.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{Compositor, RenderMode};
    use crate::segmentation::Matte;
    use image::Rgba;

    // These need a GPU with compute support and are skipped without one.
    fn device() -> Option<WgpuDevice> {
        match WgpuDevice::new() {
            Ok(device) => Some(device),
            Err(e) => {
                println!("Skipping test (no GPU): {}", e);
                None
            }
        }
    }

    #[test]
    fn downsample_to_surface_is_read_back() {
        let Some(mut device) = device() else { return };
        device.resize_surface(3, 2).unwrap();
        let src = device.create_texture(6, 4).unwrap();
        let texels: Vec<u8> = [200u8, 100, 50, 255].repeat(24);
        device.upload(src, 6, 4, TexelData::Rgba8(&texels)).unwrap();
        let prog = device.create_program(ShaderKind::Downsample).unwrap();
        device
            .draw(prog, &[src], DrawTarget::Surface, &PassParams::Downsample)
            .unwrap();

        let image = device.read_surface().unwrap();
        assert_eq!(image.dimensions(), (3, 2));
        for p in image.pixels() {
            assert!(p[0].abs_diff(200) <= 1 && p[1].abs_diff(100) <= 1);
        }
    }

    #[test]
    fn compositor_keeps_foreground_under_full_mask() {
        let Some(device) = device() else { return };
        let mut compositor = Compositor::new(Box::new(device), 10).unwrap();
        let frame = RgbaImage::from_pixel(40, 30, Rgba([10, 220, 30, 255]));
        compositor
            .update_mask(&Matte::new(4, 3, vec![1.0; 12]))
            .unwrap();

        let out = compositor.render_frame(&frame, RenderMode::Blur).unwrap();
        assert_eq!(out.dimensions(), (40, 30));
        for p in out.pixels() {
            assert!(p[1].abs_diff(220) <= 2, "{:?}", p);
        }
        compositor.cleanup();
    }

    #[test]
    fn feedback_loop_is_rejected() {
        let Some(mut device) = device() else { return };
        let tex = device.create_texture(2, 2).unwrap();
        let fb = device.create_framebuffer(tex).unwrap();
        let prog = device.create_program(ShaderKind::Downsample).unwrap();
        let err = device
            .draw(prog, &[tex], DrawTarget::Framebuffer(fb), &PassParams::Downsample)
            .unwrap_err();
        assert_eq!(err, GpuError::FeedbackLoop(tex.0));
    }
}
