use super::{FramebufferId, GpuDevice, GpuError, ProgramId, ShaderKind, TexelData, TextureId};
use crate::constants::DOWNSAMPLE_FACTOR;

/// An offscreen texture with the framebuffer rendering into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTarget {
    pub texture: TextureId,
    pub framebuffer: FramebufferId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Programs {
    pub downsample: ProgramId,
    pub blur_horizontal: ProgramId,
    pub blur_vertical: ProgramId,
    pub composite: ProgramId,
}

/// Every GPU object a compositor owns, created and disposed as one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuResources {
    pub source: TextureId,
    pub ping: RenderTarget,
    pub pong: RenderTarget,
    pub mask: TextureId,
    pub background: TextureId,
    pub programs: Programs,
}

/// Objects created so far, deleted again if setup fails midway.
#[derive(Default)]
struct Created {
    textures: Vec<TextureId>,
    framebuffers: Vec<FramebufferId>,
    programs: Vec<ProgramId>,
}

impl Created {
    fn texture(
        &mut self,
        device: &mut dyn GpuDevice,
        width: u32,
        height: u32,
    ) -> Result<TextureId, GpuError> {
        let id = device.create_texture(width, height)?;
        self.textures.push(id);
        Ok(id)
    }

    fn target(
        &mut self,
        device: &mut dyn GpuDevice,
        width: u32,
        height: u32,
    ) -> Result<RenderTarget, GpuError> {
        let texture = self.texture(device, width, height)?;
        let framebuffer = device.create_framebuffer(texture)?;
        self.framebuffers.push(framebuffer);
        Ok(RenderTarget {
            texture,
            framebuffer,
        })
    }

    fn program(
        &mut self,
        device: &mut dyn GpuDevice,
        kind: ShaderKind,
    ) -> Result<ProgramId, GpuError> {
        let id = device.create_program(kind)?;
        self.programs.push(id);
        Ok(id)
    }

    fn rollback(self, device: &mut dyn GpuDevice) {
        for fb in self.framebuffers {
            device.delete_framebuffer(fb);
        }
        for tex in self.textures {
            device.delete_texture(tex);
        }
        for prog in self.programs {
            device.delete_program(prog);
        }
    }
}

/// Size of the blur targets for a frame of `width` x `height`.
pub fn downsampled_size(width: u32, height: u32) -> (u32, u32) {
    (
        (width / DOWNSAMPLE_FACTOR).max(1),
        (height / DOWNSAMPLE_FACTOR).max(1),
    )
}

impl GpuResources {
    /// Create the full resource set for frames of `width` x `height`.
    ///
    /// The mask starts as full foreground so frames render sharp until the
    /// first segmentation result arrives.
    pub fn create(
        device: &mut dyn GpuDevice,
        width: u32,
        height: u32,
    ) -> Result<Self, GpuError> {
        let mut created = Created::default();
        match Self::create_into(&mut created, device, width, height) {
            Ok(resources) => Ok(resources),
            Err(e) => {
                tracing::warn!("GPU resource setup failed: {}", e);
                created.rollback(device);
                Err(e)
            }
        }
    }

    fn create_into(
        created: &mut Created,
        device: &mut dyn GpuDevice,
        width: u32,
        height: u32,
    ) -> Result<Self, GpuError> {
        let (small_w, small_h) = downsampled_size(width, height);

        let source = created.texture(device, width, height)?;
        let ping = created.target(device, small_w, small_h)?;
        let pong = created.target(device, small_w, small_h)?;
        let mask = created.texture(device, 1, 1)?;
        device.upload(mask, 1, 1, TexelData::Luma32F(&[1.0]))?;
        let background = created.texture(device, 1, 1)?;

        let programs = Programs {
            downsample: created.program(device, ShaderKind::Downsample)?,
            blur_horizontal: created.program(device, ShaderKind::BlurHorizontal)?,
            blur_vertical: created.program(device, ShaderKind::BlurVertical)?,
            composite: created.program(device, ShaderKind::Composite)?,
        };

        tracing::debug!(
            width,
            height,
            small_w,
            small_h,
            "Created GPU resource set"
        );

        Ok(Self {
            source,
            ping,
            pong,
            mask,
            background,
            programs,
        })
    }

    /// Resize the blur targets for a new frame size.
    pub fn resize(
        &self,
        device: &mut dyn GpuDevice,
        width: u32,
        height: u32,
    ) -> Result<(), GpuError> {
        let (small_w, small_h) = downsampled_size(width, height);
        device.resize_texture(self.ping.texture, small_w, small_h)?;
        device.resize_texture(self.pong.texture, small_w, small_h)?;
        Ok(())
    }

    /// Delete every object in the set.
    pub fn dispose(self, device: &mut dyn GpuDevice) {
        for target in [self.ping, self.pong] {
            device.delete_framebuffer(target.framebuffer);
            device.delete_texture(target.texture);
        }
        for tex in [self.source, self.mask, self.background] {
            device.delete_texture(tex);
        }
        let p = self.programs;
        for prog in [p.downsample, p.blur_horizontal, p.blur_vertical, p.composite] {
            device.delete_program(prog);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{ObjectCounts, SoftwareDevice};

    #[test]
    fn create_and_dispose_returns_to_baseline() {
        let mut device = SoftwareDevice::new();
        let resources = GpuResources::create(&mut device, 64, 48).unwrap();
        assert_eq!(
            device.object_counts(),
            ObjectCounts {
                textures: 5,
                framebuffers: 2,
                programs: 4
            }
        );

        resources.dispose(&mut device);
        assert_eq!(device.object_counts(), ObjectCounts::default());
    }

    #[test]
    fn failed_setup_rolls_back() {
        let mut device = SoftwareDevice::new();
        device.lose_context();
        assert!(GpuResources::create(&mut device, 64, 48).is_err());
        device.restore_context().unwrap();
        assert_eq!(device.object_counts(), ObjectCounts::default());
    }

    #[test]
    fn downsampled_size_never_hits_zero() {
        assert_eq!(downsampled_size(640, 480), (160, 120));
        assert_eq!(downsampled_size(2, 3), (1, 1));
    }
}
