// benches/pipelines.rs — End-to-end segmentation benchmarks.
//
//   cargo bench --bench pipelines
//
// Each group runs the same synthetic scene on the CPU reference device and,
// when an adapter is available, on the GPU. Criterion measures wall time
// including uploads, submits and readbacks, which is what a caller of
// `segment` waits for.
//
// The first GPU iterations pay pipeline compilation on some drivers, so the
// warm-up time is set explicitly.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

use gpu_segment::cpu::CpuBackend;
use gpu_segment::dispatch::WorkgroupSize;
use gpu_segment::gpu::GpuBackend;
use gpu_segment::{segment, Algorithm, KmeansConfig, MeanShiftConfig, RgbaImage, SegmentConfig};

/// Gradient background with a few flat rectangles.
fn make_scene(w: usize, h: usize) -> RgbaImage {
    let mut img = RgbaImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let r = (x * 200 / w) as u8;
            let g = (y * 180 / h) as u8;
            img.set(x, y, [r, g, 90, 255]);
        }
    }
    for rect in 0..5usize {
        let rx = (30 + rect * 50) % w;
        let ry = (20 + (rect % 3) * 60) % h;
        let color = [40 + rect as u8 * 40, 220 - rect as u8 * 30, 30, 255];
        for y in ry..(ry + 40).min(h) {
            for x in rx..(rx + 50).min(w) {
                img.set(x, y, color);
            }
        }
    }
    img
}

fn config() -> SegmentConfig {
    SegmentConfig {
        kmeans: KmeansConfig { clusters: 6, max_iterations: 16, seed: 1 },
        meanshift: MeanShiftConfig { spatial_radius: 4, color_radius: 24.0, max_steps: 10 },
        ..SegmentConfig::default()
    }
}

fn bench_algorithms(c: &mut Criterion) {
    let config = config();
    let mut gpu = match GpuBackend::new(WorkgroupSize::default()) {
        Ok(g) => Some(g),
        Err(e) => {
            eprintln!("[bench] GPU unavailable, CPU only: {e}");
            None
        }
    };

    for algorithm in Algorithm::ALL {
        // Mean-shift on the CPU is O(pixels × r² × steps); keep it small.
        let size = match algorithm {
            Algorithm::MeanShift => (160, 120),
            _ => (320, 240),
        };
        let img = make_scene(size.0, size.1);
        let id = format!("{}x{}", size.0, size.1);

        let mut group = c.benchmark_group(algorithm.name());
        group.warm_up_time(Duration::from_secs(2));
        group.sample_size(20);

        let mut cpu = CpuBackend::new(WorkgroupSize::default());
        group.bench_with_input(BenchmarkId::new("cpu", &id), &img, |b, img| {
            b.iter(|| segment(&mut cpu, algorithm, &config, img).unwrap())
        });

        if let Some(gpu) = gpu.as_mut() {
            group.bench_with_input(BenchmarkId::new("gpu", &id), &img, |b, img| {
                b.iter(|| segment(&mut *gpu, algorithm, &config, img).unwrap())
            });
        }

        group.finish();
    }
}

criterion_group!(benches, bench_algorithms);
criterion_main!(benches);
