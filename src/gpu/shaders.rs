//! Shader kernels for the background pipeline.
//!
//! Every kernel is a per-pixel function of normalized texture coordinates,
//! sampled with bilinear filtering and clamp-to-edge addressing.

use super::{GpuError, PassParams, ShaderKind};
use crate::constants::{MAX_BLUR_RADIUS, MIN_BLUR_RADIUS};

pub type Texel = [f32; 4];

/// Read-only view over texture storage.
#[derive(Clone, Copy)]
pub struct TexelView<'a> {
    pub width: u32,
    pub height: u32,
    pub texels: &'a [Texel],
}

impl TexelView<'_> {
    fn fetch(&self, x: i64, y: i64) -> Texel {
        let x = x.clamp(0, self.width as i64 - 1) as usize;
        let y = y.clamp(0, self.height as i64 - 1) as usize;
        self.texels[y * self.width as usize + x]
    }

    /// Bilinear sample at normalized coordinates.
    pub fn sample(&self, u: f32, v: f32) -> Texel {
        let x = u * self.width as f32 - 0.5;
        let y = v * self.height as f32 - 0.5;
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;
        let (x0, y0) = (x0 as i64, y0 as i64);

        let a = self.fetch(x0, y0);
        let b = self.fetch(x0 + 1, y0);
        let c = self.fetch(x0, y0 + 1);
        let d = self.fetch(x0 + 1, y0 + 1);

        let mut out = [0.0; 4];
        for i in 0..4 {
            let top = a[i] + (b[i] - a[i]) * fx;
            let bottom = c[i] + (d[i] - c[i]) * fx;
            out[i] = top + (bottom - top) * fy;
        }
        out
    }
}

/// Gaussian weights for the separable blur, indexed by tap distance.
#[derive(Debug, Clone, PartialEq)]
pub struct BlurKernel {
    radius: u32,
    weights: Vec<f32>,
}

impl BlurKernel {
    /// Build the kernel for `radius`, clamped to the supported range.
    pub fn new(radius: u32) -> Self {
        let radius = clamp_blur_radius(radius);
        let sigma = (radius as f32 / 3.0).max(1.0);
        let mut weights: Vec<f32> = (0..=radius)
            .map(|i| (-((i * i) as f32) / (2.0 * sigma * sigma)).exp())
            .collect();

        // Centre tap counts once, the others twice.
        let total: f32 = weights[0] + 2.0 * weights[1..].iter().sum::<f32>();
        for w in &mut weights {
            *w /= total;
        }

        Self { radius, weights }
    }

    pub fn radius(&self) -> u32 {
        self.radius
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }
}

pub fn clamp_blur_radius(radius: u32) -> u32 {
    radius.clamp(MIN_BLUR_RADIUS, MAX_BLUR_RADIUS)
}

pub fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Number of input textures each program samples.
pub fn input_count(kind: ShaderKind) -> usize {
    match kind {
        ShaderKind::Downsample | ShaderKind::BlurHorizontal | ShaderKind::BlurVertical => 1,
        ShaderKind::Composite => 3,
    }
}

/// Execute `kind` over a `width` x `height` target.
pub fn run(
    kind: ShaderKind,
    inputs: &[TexelView<'_>],
    width: u32,
    height: u32,
    params: &PassParams<'_>,
) -> Result<Vec<Texel>, GpuError> {
    let expected = input_count(kind);
    if inputs.len() != expected {
        return Err(GpuError::InputCount {
            kind,
            expected,
            got: inputs.len(),
        });
    }

    let out = match (kind, params) {
        (ShaderKind::Downsample, PassParams::Downsample) => {
            shade(width, height, |u, v| downsample(&inputs[0], width, height, u, v))
        }
        (ShaderKind::BlurHorizontal, PassParams::Blur(kernel)) => {
            let step = 1.0 / inputs[0].width as f32;
            shade(width, height, |u, v| blur(&inputs[0], kernel, u, v, step, 0.0))
        }
        (ShaderKind::BlurVertical, PassParams::Blur(kernel)) => {
            let step = 1.0 / inputs[0].height as f32;
            shade(width, height, |u, v| blur(&inputs[0], kernel, u, v, 0.0, step))
        }
        (
            ShaderKind::Composite,
            PassParams::Composite {
                edge_low,
                edge_high,
            },
        ) => shade(width, height, |u, v| {
            composite(&inputs[0], &inputs[1], &inputs[2], *edge_low, *edge_high, u, v)
        }),
        _ => return Err(GpuError::ParamsMismatch(kind)),
    };

    Ok(out)
}

fn shade(width: u32, height: u32, f: impl Fn(f32, f32) -> Texel) -> Vec<Texel> {
    let mut out = Vec::with_capacity(width as usize * height as usize);
    for y in 0..height {
        let v = (y as f32 + 0.5) / height as f32;
        for x in 0..width {
            let u = (x as f32 + 0.5) / width as f32;
            out.push(f(u, v));
        }
    }
    out
}

/// Four bilinear taps spread over the destination texel.
fn downsample(src: &TexelView<'_>, width: u32, height: u32, u: f32, v: f32) -> Texel {
    let du = 0.25 / width as f32;
    let dv = 0.25 / height as f32;
    let taps = [
        src.sample(u - du, v - dv),
        src.sample(u + du, v - dv),
        src.sample(u - du, v + dv),
        src.sample(u + du, v + dv),
    ];
    let mut out = [0.0; 4];
    for tap in taps {
        for i in 0..4 {
            out[i] += tap[i] * 0.25;
        }
    }
    out
}

fn blur(src: &TexelView<'_>, kernel: &BlurKernel, u: f32, v: f32, du: f32, dv: f32) -> Texel {
    let weights = kernel.weights();
    let mut out = src.sample(u, v).map(|c| c * weights[0]);
    for (i, w) in weights.iter().enumerate().skip(1) {
        let offset = i as f32;
        let a = src.sample(u + du * offset, v + dv * offset);
        let b = src.sample(u - du * offset, v - dv * offset);
        for c in 0..4 {
            out[c] += (a[c] + b[c]) * w;
        }
    }
    out
}

fn composite(
    sharp: &TexelView<'_>,
    background: &TexelView<'_>,
    mask: &TexelView<'_>,
    edge_low: f32,
    edge_high: f32,
    u: f32,
    v: f32,
) -> Texel {
    let alpha = smoothstep(edge_low, edge_high, mask.sample(u, v)[0]);
    let fg = sharp.sample(u, v);
    let bg = background.sample(u, v);
    [
        bg[0] + (fg[0] - bg[0]) * alpha,
        bg[1] + (fg[1] - bg[1]) * alpha,
        bg[2] + (fg[2] - bg[2]) * alpha,
        1.0,
    ]
}
