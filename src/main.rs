// gpu-segment: segment one image and write the result as PNG.
//
//   gpu-segment kmeans photo.jpg --clusters 6
//   gpu-segment meanshift photo.jpg -o regions.png --cpu
//   RUST_LOG=gpu_segment=debug gpu-segment edge photo.jpg
//
// Flags override values loaded from --config.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;

use gpu_segment::{backend, segment, Algorithm, BackendKind, Detail, RgbaImage, SegmentConfig};

#[derive(Parser)]
#[command(name = "gpu-segment", version, about = "Image segmentation on wgpu compute")]
struct Cli {
    /// Segmentation algorithm.
    #[arg(value_enum)]
    algorithm: AlgorithmArg,

    /// Input image (PNG, JPEG, BMP).
    input: PathBuf,

    /// Output PNG. Defaults to `<input stem>-<algorithm>.png` next to the input.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run the kernels on the CPU reference device.
    #[arg(long)]
    cpu: bool,

    /// Number of k-means clusters.
    #[arg(long)]
    clusters: Option<u32>,

    /// K-means iteration cap.
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Seed for the initial k-means centroids.
    #[arg(long)]
    seed: Option<u64>,

    /// Mean-shift window radius in pixels.
    #[arg(long)]
    spatial_radius: Option<u32>,

    /// Mean-shift color radius (RGB distance).
    #[arg(long)]
    color_radius: Option<f32>,

    /// Mean-shift per-pixel step cap.
    #[arg(long)]
    max_steps: Option<u32>,

    /// Debug logging (overridden by RUST_LOG).
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum AlgorithmArg {
    Edge,
    Kmeans,
    Meanshift,
}

impl From<AlgorithmArg> for Algorithm {
    fn from(a: AlgorithmArg) -> Self {
        match a {
            AlgorithmArg::Edge => Algorithm::Edge,
            AlgorithmArg::Kmeans => Algorithm::Kmeans,
            AlgorithmArg::Meanshift => Algorithm::MeanShift,
        }
    }
}

fn config_from_cli(cli: &Cli) -> Result<SegmentConfig> {
    let mut config = match &cli.config {
        Some(path) => SegmentConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SegmentConfig::default(),
    };
    if cli.cpu {
        config.backend = BackendKind::Cpu;
    }
    if let Some(v) = cli.clusters {
        config.kmeans.clusters = v;
    }
    if let Some(v) = cli.max_iterations {
        config.kmeans.max_iterations = v;
    }
    if let Some(v) = cli.seed {
        config.kmeans.seed = v;
    }
    if let Some(v) = cli.spatial_radius {
        config.meanshift.spatial_radius = v;
    }
    if let Some(v) = cli.color_radius {
        config.meanshift.color_radius = v;
    }
    if let Some(v) = cli.max_steps {
        config.meanshift.max_steps = v;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn default_output(input: &Path, algorithm: Algorithm) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    input.with_file_name(format!("{stem}-{algorithm}.png"))
}

fn load(path: &Path) -> Result<RgbaImage> {
    let decoded = image::open(path)
        .with_context(|| format!("decoding {}", path.display()))?
        .to_rgba8();
    let (w, h) = decoded.dimensions();
    RgbaImage::from_vec(w as usize, h as usize, decoded.into_raw())
        .with_context(|| format!("converting {}", path.display()))
}

fn save(path: &Path, img: RgbaImage) -> Result<()> {
    let (w, h) = (img.width() as u32, img.height() as u32);
    let buffer = image::RgbaImage::from_raw(w, h, img.into_packed_bytes())
        .context("output buffer does not match its dimensions")?;
    buffer
        .save_with_format(path, image::ImageFormat::Png)
        .with_context(|| format!("writing {}", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let algorithm = Algorithm::from(cli.algorithm);
    let config = config_from_cli(&cli)?;
    let input = load(&cli.input)?;
    let output_path = cli
        .output
        .clone()
        .unwrap_or_else(|| default_output(&cli.input, algorithm));

    let mut device = backend::open(&config).context("opening compute device")?;
    let result = segment(&mut device, algorithm, &config, &input)
        .with_context(|| format!("{algorithm} segmentation failed"))?;

    let report = &result.report;
    match &report.detail {
        Detail::Kmeans { convergence, .. } => {
            info!(iterations = convergence.iterations(), converged = convergence.converged(), "k-means")
        }
        Detail::MeanShift { unique_peaks } => info!(unique_peaks, "mean-shift"),
        Detail::Edge => {}
    }
    info!(
        device = %report.device,
        stages = report.timings.len(),
        host_time = ?report.total_time(),
        "run complete"
    );

    save(&output_path, result.image)?;
    info!(path = %output_path.display(), "wrote segmentation");
    Ok(())
}
