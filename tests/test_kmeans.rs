// tests/test_kmeans.rs — K-means clustering on the CPU reference device.

use std::collections::HashSet;

use gpu_segment::cpu::CpuBackend;
use gpu_segment::dispatch::WorkgroupSize;
use gpu_segment::image::pack_rgba;
use gpu_segment::pipeline::Convergence;
use gpu_segment::{segment, Algorithm, Detail, KmeansConfig, RgbaImage, SegmentConfig, SegmentError};

fn config(clusters: u32, max_iterations: u32, seed: u64) -> SegmentConfig {
    SegmentConfig {
        kmeans: KmeansConfig { clusters, max_iterations, seed },
        ..SegmentConfig::default()
    }
}

fn run(image: &RgbaImage, config: &SegmentConfig) -> gpu_segment::Segmented {
    let mut cpu = CpuBackend::new(WorkgroupSize::default());
    segment(&mut cpu, Algorithm::Kmeans, config, image).unwrap()
}

fn kmeans_detail(detail: &Detail) -> (Convergence, &[Vec<u32>]) {
    match detail {
        Detail::Kmeans { convergence, history } => (*convergence, history),
        other => panic!("expected k-means detail, got {other:?}"),
    }
}

fn noise(width: usize, height: usize, mut state: u32) -> RgbaImage {
    let mut data = Vec::with_capacity(width * height * 4);
    for _ in 0..width * height {
        state = state.wrapping_mul(1664525).wrapping_add(1013904223);
        let [r, g, b, _] = state.to_le_bytes();
        data.extend_from_slice(&[r, g, b, 255]);
    }
    RgbaImage::from_vec(width, height, data).unwrap()
}

#[test]
fn uniform_image_single_cluster_converges_in_one_iteration() {
    let img = RgbaImage::filled(10, 7, [12, 34, 56, 255]);
    let result = run(&img, &config(1, 10, 3));
    let (convergence, history) = kmeans_detail(&result.report.detail);
    assert_eq!(convergence, Convergence::Converged { iterations: 1 });
    assert_eq!(history.len(), 1);
    for y in 0..7 {
        for x in 0..10 {
            assert_eq!(result.image.get(x, y), [12, 34, 56, 255]);
        }
    }
}

#[test]
fn output_uses_only_final_centroids() {
    let img = noise(24, 16, 99);
    let result = run(&img, &config(4, 64, 11));
    let (convergence, history) = kmeans_detail(&result.report.detail);
    let last = history.last().expect("at least one iteration");
    assert_eq!(last.len(), 4);

    let palette: HashSet<u32> = last.iter().map(|c| c | 0xff00_0000).collect();
    for y in 0..16 {
        for x in 0..24 {
            let c = pack_rgba(result.image.get(x, y));
            assert!(palette.contains(&c), "pixel ({x},{y}) is not a centroid color");
        }
    }
    if convergence.converged() && history.len() >= 2 {
        let (prev, next) = (&history[history.len() - 2], last);
        assert!(prev.iter().zip(next).all(|(a, b)| a & 0xff_ffff == b & 0xff_ffff));
    }
}

#[test]
fn same_seed_is_deterministic() {
    let img = noise(20, 20, 5);
    let a = run(&img, &config(5, 64, 42));
    let b = run(&img, &config(5, 64, 42));
    assert_eq!(a.image.to_words(), b.image.to_words());
    assert_eq!(a.report.detail, b.report.detail);
}

#[test]
fn iteration_cap_is_reported_not_fatal() {
    let img = noise(16, 16, 1234);
    let result = run(&img, &config(4, 1, 7));
    let (convergence, history) = kmeans_detail(&result.report.detail);
    assert_eq!(convergence, Convergence::IterationCap { iterations: 1 });
    assert_eq!(history.len(), 1);
    assert_eq!(result.image.width(), 16);
    assert_eq!(result.image.height(), 16);
}

#[test]
fn more_clusters_than_pixels() {
    let mut img = RgbaImage::new(2, 1);
    img.set(0, 0, [255, 0, 0, 255]);
    img.set(1, 0, [0, 0, 255, 255]);
    let result = run(&img, &config(5, 8, 0));
    assert_eq!(result.image.get(0, 0), [255, 0, 0, 255]);
    assert_eq!(result.image.get(1, 0), [0, 0, 255, 255]);
}

#[test]
fn zero_clusters_rejected_before_any_work() {
    let mut cpu = CpuBackend::new(WorkgroupSize::default());
    let img = RgbaImage::filled(4, 4, [1, 2, 3, 255]);
    let err = segment(&mut cpu, Algorithm::Kmeans, &config(0, 8, 0), &img).unwrap_err();
    assert!(matches!(err, SegmentError::Config(_)));
    assert_eq!(cpu.live_buffers(), 0);
    assert!(cpu.executed().is_empty());
}

#[test]
fn every_iteration_reads_back_centroids() {
    let img = noise(12, 12, 77);
    let result = run(&img, &config(3, 64, 2));
    let (convergence, _) = kmeans_detail(&result.report.detail);
    // assign + recompute per iteration, plus the final color pass.
    assert_eq!(
        result.report.dispatch_count(),
        2 * convergence.iterations() as usize + 1
    );
}
