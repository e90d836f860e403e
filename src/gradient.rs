// gradient.rs — Reference kernels for the edge-detection chain.
//
// These are the authoritative CPU versions of the `edge_x`, `edge_y` and
// `edge_result` entry points in shaders/segment.wgsl. The CPU backend runs
// them directly; the GPU kernels are validated against them.
//
// Sobel kernels are separable:
//   Sobel_x: derivative [-1, 0, 1] along x, smoothing [1, 2, 1] along y
//   Sobel_y: smoothing [1, 2, 1] along x, derivative [-1, 0, 1] along y
//
// Both operate on integer luma `(77 r + 150 g + 29 b) >> 8` so every
// intermediate is an exactly representable f32. Borders clamp to the
// nearest edge pixel.

use bytemuck::{Pod, Zeroable};

use crate::image::{unpack_rgba, ALPHA_MASK};

/// Uniform block shared by the three edge kernels.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct EdgeParams {
    pub width: u32,
    pub height: u32,
    _pad: [u32; 2],
}

impl EdgeParams {
    pub fn new(width: u32, height: u32) -> Self {
        EdgeParams { width, height, _pad: [0; 2] }
    }
}

/// Integer luma of a packed RGBA word.
#[inline]
pub fn luma(word: u32) -> u32 {
    let [r, g, b, _] = unpack_rgba(word);
    (77 * r as u32 + 150 * g as u32 + 29 * b as u32) >> 8
}

#[inline]
fn luma_at(input: &[u32], p: &EdgeParams, x: i64, y: i64) -> f32 {
    let cx = x.clamp(0, p.width as i64 - 1) as usize;
    let cy = y.clamp(0, p.height as i64 - 1) as usize;
    luma(input[cy * p.width as usize + cx]) as f32
}

/// Horizontal Sobel response at `(x, y)`. Positive when intensity grows to
/// the right.
pub fn sobel_x_at(input: &[u32], p: &EdgeParams, x: usize, y: usize) -> f32 {
    let (x, y) = (x as i64, y as i64);
    let right = luma_at(input, p, x + 1, y - 1)
        + 2.0 * luma_at(input, p, x + 1, y)
        + luma_at(input, p, x + 1, y + 1);
    let left = luma_at(input, p, x - 1, y - 1)
        + 2.0 * luma_at(input, p, x - 1, y)
        + luma_at(input, p, x - 1, y + 1);
    right - left
}

/// Vertical Sobel response at `(x, y)`. Positive when intensity grows
/// downward.
pub fn sobel_y_at(input: &[u32], p: &EdgeParams, x: usize, y: usize) -> f32 {
    let (x, y) = (x as i64, y as i64);
    let below = luma_at(input, p, x - 1, y + 1)
        + 2.0 * luma_at(input, p, x, y + 1)
        + luma_at(input, p, x + 1, y + 1);
    let above = luma_at(input, p, x - 1, y - 1)
        + 2.0 * luma_at(input, p, x, y - 1)
        + luma_at(input, p, x + 1, y - 1);
    below - above
}

/// Gradient magnitude rounded to a display byte.
#[inline]
pub fn combine(gx: f32, gy: f32) -> u8 {
    ((gx * gx + gy * gy).sqrt() + 0.5).floor().min(255.0) as u8
}

/// Opaque gray pixel word.
#[inline]
pub fn gray(v: u8) -> u32 {
    let v = v as u32;
    v | (v << 8) | (v << 16) | ALPHA_MASK
}

/// `edge_x`: per-pixel horizontal gradient into `grad_x`.
pub fn edge_x(input: &[u32], grad_x: &mut [f32], p: &EdgeParams) {
    let w = p.width as usize;
    for y in 0..p.height as usize {
        for x in 0..w {
            grad_x[y * w + x] = sobel_x_at(input, p, x, y);
        }
    }
}

/// `edge_y`: per-pixel vertical gradient into `grad_y`.
pub fn edge_y(input: &[u32], grad_y: &mut [f32], p: &EdgeParams) {
    let w = p.width as usize;
    for y in 0..p.height as usize {
        for x in 0..w {
            grad_y[y * w + x] = sobel_y_at(input, p, x, y);
        }
    }
}

/// `edge_result`: combine both gradients into an opaque gray image.
pub fn edge_result(grad_x: &[f32], grad_y: &[f32], output: &mut [u32], p: &EdgeParams) {
    let n = (p.width * p.height) as usize;
    for i in 0..n {
        output[i] = gray(combine(grad_x[i], grad_y[i]));
    }
}
