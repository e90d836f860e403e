// meanshift.rs — Reference kernels for mean-shift mode seeking.
//
// Every pixel starts a chain at its own position. One step replaces the
// current position with the mean position of the window around it:
//
//   window(c) = { q : |q - round(c)|² <= r²,  q inside the image,
//                     colordist²(I(q), I(p)) <= color_radius² }
//
// where p is the chain's own pixel. A window with no members leaves the
// position where it is (cannot happen for the seed step, which always
// contains p itself).
//
//   meanshift_seed      one step from the pixel position → positions
//   meanshift_optimize  steps from the seeded position until the shift is
//                       below half a pixel or `max_steps` → peak id
//   meanshift_color     peak id → palette color via the sorted key table
//
// A peak id is the flattened index of the pixel the chain ends on:
// `round(y) * width + round(x)`, clamped to the image.
//
// Positions are stored interleaved (x0, y0, x1, y1, ...) as f32, which is
// the layout of `array<vec2<f32>>` on the device.

use bytemuck::{Pod, Zeroable};

use crate::config::MeanShiftConfig;
use crate::image::ALPHA_MASK;
use crate::kmeans::color_distance;

/// Peak id of a pixel that no chain has labelled.
pub const UNSET_PEAK: u32 = u32::MAX;

/// A chain stops once a step moves it less than this, squared (0.5 px).
pub const CONVERGED_SHIFT_SQ: f32 = 0.25;

/// Uniform block shared by the three mean-shift kernels.
///
/// Layout must match `MeanShiftParams` in segment.wgsl:
///   offset  0: width           (u32)
///   offset  4: height          (u32)
///   offset  8: spatial_radius  (u32)
///   offset 12: max_steps       (u32)
///   offset 16: color_radius    (f32)
///   offset 20: peak_count      (u32)  keys in the color table
///   offset 24: _pad            (2 × u32)
///   total:  32 bytes
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MeanShiftParams {
    pub width: u32,
    pub height: u32,
    pub spatial_radius: u32,
    pub max_steps: u32,
    pub color_radius: f32,
    pub peak_count: u32,
    _pad: [u32; 2],
}

impl MeanShiftParams {
    pub fn new(width: u32, height: u32, config: &MeanShiftConfig) -> Self {
        MeanShiftParams {
            width,
            height,
            spatial_radius: config.spatial_radius,
            max_steps: config.max_steps,
            color_radius: config.color_radius,
            peak_count: 0,
            _pad: [0; 2],
        }
    }

    /// Same parameters with the size of the color table filled in.
    pub fn with_peak_count(mut self, peak_count: u32) -> Self {
        self.peak_count = peak_count;
        self
    }
}

/// Mean position of the window centred on `(cx, cy)`, filtered by color
/// against `reference`.
pub fn window_mean(input: &[u32], p: &MeanShiftParams, cx: f32, cy: f32, reference: u32) -> (f32, f32) {
    let w = p.width as i64;
    let h = p.height as i64;
    let r = p.spatial_radius as i64;
    let ix = (cx + 0.5).floor() as i64;
    let iy = (cy + 0.5).floor() as i64;
    let color_limit = p.color_radius * p.color_radius;

    let (mut sx, mut sy, mut count) = (0.0f32, 0.0f32, 0u32);
    for dy in -r..=r {
        let y = iy + dy;
        if y < 0 || y >= h {
            continue;
        }
        for dx in -r..=r {
            let x = ix + dx;
            if x < 0 || x >= w || dx * dx + dy * dy > r * r {
                continue;
            }
            let q = input[(y * w + x) as usize];
            if color_distance(q, reference) as f32 <= color_limit {
                sx += x as f32;
                sy += y as f32;
                count += 1;
            }
        }
    }
    if count == 0 {
        return (cx, cy);
    }
    (sx / count as f32, sy / count as f32)
}

/// Flattened index of the pixel nearest to `(x, y)`.
#[inline]
pub fn peak_id(p: &MeanShiftParams, x: f32, y: f32) -> u32 {
    let rx = ((x + 0.5).floor().max(0.0) as u32).min(p.width - 1);
    let ry = ((y + 0.5).floor().max(0.0) as u32).min(p.height - 1);
    ry * p.width + rx
}

/// `meanshift_seed`.
pub fn seed(input: &[u32], positions: &mut [f32], p: &MeanShiftParams) {
    let w = p.width as usize;
    for y in 0..p.height as usize {
        for x in 0..w {
            let i = y * w + x;
            let (mx, my) = window_mean(input, p, x as f32, y as f32, input[i]);
            positions[2 * i] = mx;
            positions[2 * i + 1] = my;
        }
    }
}

/// Follow one chain from `(x, y)` and return where it ends.
pub fn converge(input: &[u32], p: &MeanShiftParams, reference: u32, mut x: f32, mut y: f32) -> (f32, f32) {
    for _ in 0..p.max_steps {
        let (nx, ny) = window_mean(input, p, x, y, reference);
        let shift = (nx - x) * (nx - x) + (ny - y) * (ny - y);
        x = nx;
        y = ny;
        if shift < CONVERGED_SHIFT_SQ {
            break;
        }
    }
    (x, y)
}

/// `meanshift_optimize`.
pub fn optimize(input: &[u32], positions: &[f32], peaks: &mut [u32], p: &MeanShiftParams) {
    let n = (p.width * p.height) as usize;
    for i in 0..n {
        let (x, y) = converge(input, p, input[i], positions[2 * i], positions[2 * i + 1]);
        peaks[i] = peak_id(p, x, y);
    }
}

/// `meanshift_color`. Unset or unknown ids are painted opaque black.
pub fn paint(peaks: &[u32], keys: &[u32], palette: &[u32], output: &mut [u32], p: &MeanShiftParams) {
    let keys = &keys[..p.peak_count as usize];
    let n = (p.width * p.height) as usize;
    for i in 0..n {
        let id = peaks[i];
        output[i] = match keys.binary_search(&id) {
            Ok(rank) if id != UNSET_PEAK => palette[rank] | ALPHA_MASK,
            _ => ALPHA_MASK,
        };
    }
}
