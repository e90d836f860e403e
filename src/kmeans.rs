// kmeans.rs — Reference kernels and host helpers for k-means clustering.
//
// Device side (mirrored by shaders/segment.wgsl):
//   kmeans_assign     one work item per pixel → index of the nearest centroid
//   kmeans_recompute  one work item per centroid → rounded mean of members
//   kmeans_color      one work item per pixel → centroid color
//
// Host side: seeded initial centroids and the convergence test. The test
// compares RGB exactly; alpha is always 255 in a centroid and is ignored.
//
// OVERFLOW BOUND
// ──────────────
// Channel sums are u32 on the device. A cluster can hold every pixel, so
// `255 * P + P / 2` must fit: images are capped at `MAX_PIXELS`.

use bytemuck::{Pod, Zeroable};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::image::{unpack_rgba, ALPHA_MASK};

/// Largest pixel count whose channel sums cannot overflow a u32.
pub const MAX_PIXELS: usize = (u32::MAX / 256) as usize;

const RGB_MASK: u32 = 0x00ff_ffff;

/// Uniform block shared by the three k-means kernels.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct KmeansParams {
    pub width: u32,
    pub height: u32,
    pub clusters: u32,
    _pad: u32,
}

impl KmeansParams {
    pub fn new(width: u32, height: u32, clusters: u32) -> Self {
        KmeansParams { width, height, clusters, _pad: 0 }
    }

    fn pixel_count(&self) -> usize {
        (self.width * self.height) as usize
    }
}

/// Squared RGB distance between two packed pixels.
#[inline]
pub fn color_distance(a: u32, b: u32) -> u32 {
    let [ar, ag, ab, _] = unpack_rgba(a);
    let [br, bg, bb, _] = unpack_rgba(b);
    let dr = ar as i32 - br as i32;
    let dg = ag as i32 - bg as i32;
    let db = ab as i32 - bb as i32;
    (dr * dr + dg * dg + db * db) as u32
}

/// Index of the closest centroid. Ties resolve to the lowest index.
#[inline]
pub fn nearest_centroid(pixel: u32, centroids: &[u32]) -> u32 {
    let mut best = 0u32;
    let mut best_d = u32::MAX;
    for (k, &c) in centroids.iter().enumerate() {
        let d = color_distance(pixel, c);
        if d < best_d {
            best_d = d;
            best = k as u32;
        }
    }
    best
}

/// `kmeans_assign`.
pub fn assign(input: &[u32], centroids: &[u32], labels: &mut [u32], p: &KmeansParams) {
    let k = p.clusters as usize;
    for i in 0..p.pixel_count() {
        labels[i] = nearest_centroid(input[i], &centroids[..k]);
    }
}

/// `kmeans_recompute`. Empty clusters keep their previous centroid.
pub fn recompute(input: &[u32], labels: &[u32], centroids: &mut [u32], p: &KmeansParams) {
    let n = p.pixel_count();
    for c in 0..p.clusters {
        let (mut r, mut g, mut b, mut count) = (0u32, 0u32, 0u32, 0u32);
        for i in 0..n {
            if labels[i] == c {
                let [pr, pg, pb, _] = unpack_rgba(input[i]);
                r += pr as u32;
                g += pg as u32;
                b += pb as u32;
                count += 1;
            }
        }
        if count == 0 {
            continue;
        }
        let half = count / 2;
        let mean = |sum: u32| (sum + half) / count;
        centroids[c as usize] = mean(r) | (mean(g) << 8) | (mean(b) << 16) | ALPHA_MASK;
    }
}

/// `kmeans_color`.
pub fn paint(centroids: &[u32], labels: &[u32], output: &mut [u32], p: &KmeansParams) {
    for i in 0..p.pixel_count() {
        output[i] = centroids[labels[i] as usize] | ALPHA_MASK;
    }
}

/// True when every centroid kept its exact RGB value.
pub fn converged(previous: &[u32], next: &[u32]) -> bool {
    previous.len() == next.len()
        && previous
            .iter()
            .zip(next)
            .all(|(a, b)| a & RGB_MASK == b & RGB_MASK)
}

/// Pick `k` starting centroids from distinct pixel positions.
///
/// Deterministic for a given seed. When `k` exceeds the pixel count the
/// chosen pixels are reused cyclically.
pub fn initial_centroids(pixels: &[u32], k: usize, seed: u64) -> Vec<u32> {
    if pixels.is_empty() || k == 0 {
        return Vec::new();
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let picks = rand::seq::index::sample(&mut rng, pixels.len(), k.min(pixels.len()));
    let chosen: Vec<u32> = picks.iter().map(|i| pixels[i] | ALPHA_MASK).collect();
    chosen.iter().cycle().take(k).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::pack_rgba;

    fn px(r: u8, g: u8, b: u8) -> u32 {
        pack_rgba([r, g, b, 255])
    }

    #[test]
    fn test_nearest_centroid_ties_go_low() {
        let centroids = [px(0, 0, 0), px(20, 0, 0)];
        assert_eq!(nearest_centroid(px(10, 0, 0), &centroids), 0);
        assert_eq!(nearest_centroid(px(11, 0, 0), &centroids), 1);
    }

    #[test]
    fn test_assign_and_recompute_two_clusters() {
        let input = vec![px(0, 0, 0), px(10, 10, 10), px(200, 200, 200), px(255, 255, 255)];
        let p = KmeansParams::new(2, 2, 2);
        let mut centroids = vec![px(5, 5, 5), px(250, 250, 250)];
        let mut labels = vec![0; 4];
        assign(&input, &centroids, &mut labels, &p);
        assert_eq!(labels, vec![0, 0, 1, 1]);

        recompute(&input, &labels, &mut centroids, &p);
        assert_eq!(unpack_rgba(centroids[0]), [5, 5, 5, 255]);
        // (200 + 255 + 1) / 2 = 228 (rounded).
        assert_eq!(unpack_rgba(centroids[1]), [228, 228, 228, 255]);
    }

    #[test]
    fn test_empty_cluster_keeps_centroid() {
        let input = vec![px(1, 1, 1); 4];
        let p = KmeansParams::new(2, 2, 2);
        let mut centroids = vec![px(1, 1, 1), px(99, 0, 0)];
        let labels = vec![0; 4];
        recompute(&input, &labels, &mut centroids, &p);
        assert_eq!(centroids[1], px(99, 0, 0));
    }

    #[test]
    fn test_converged_is_exact_rgb() {
        let a = vec![px(1, 2, 3), px(4, 5, 6)];
        assert!(converged(&a, &a.clone()));

        // Any single differing channel breaks convergence.
        for (i, delta) in [(0usize, 0x01u32), (0, 0x0100), (1, 0x01_0000)] {
            let mut b = a.clone();
            b[i] ^= delta;
            assert!(!converged(&a, &b), "channel change {delta:#x} at {i}");
        }

        // Alpha is not part of the comparison.
        let mut c = a.clone();
        c[0] &= RGB_MASK;
        assert!(converged(&a, &c));
    }

    #[test]
    fn test_initial_centroids_deterministic() {
        let pixels: Vec<u32> = (0..100u32).map(|i| px(i as u8, 0, 0)).collect();
        let a = initial_centroids(&pixels, 5, 42);
        let b = initial_centroids(&pixels, 5, 42);
        assert_eq!(a, b);
        let mut uniq = a.clone();
        uniq.sort_unstable();
        uniq.dedup();
        assert_eq!(uniq.len(), 5, "distinct pixel positions");
    }

    #[test]
    fn test_initial_centroids_cycle_when_k_exceeds_pixels() {
        let pixels = vec![px(1, 1, 1), px(2, 2, 2)];
        let c = initial_centroids(&pixels, 5, 7);
        assert_eq!(c.len(), 5);
        assert_eq!(c[0], c[2]);
        assert_eq!(c[1], c[3]);
        assert!(initial_centroids(&[], 3, 0).is_empty());
    }

    #[test]
    fn test_paint_uses_centroid_color() {
        let centroids = vec![px(9, 8, 7), px(1, 2, 3)];
        let labels = vec![1, 0];
        let mut out = vec![0; 2];
        paint(&centroids, &labels, &mut out, &KmeansParams::new(2, 1, 2));
        assert_eq!(out, vec![px(1, 2, 3), px(9, 8, 7)]);
    }
}
