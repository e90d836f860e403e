// gpu-segment: image segmentation on wgpu compute
//
// Three pipelines over packed RGBA8 images:
//   edge       Sobel gradient magnitude
//   kmeans     color clustering with a host-driven convergence loop
//   meanshift  per-pixel mode seeking with host-side peak consolidation
//
// Every kernel has a CPU reference (gradient, kmeans, meanshift modules)
// that doubles as the `cpu` backend.

pub mod buffers;
pub mod dispatch;
pub mod error;
pub mod image;

pub mod gradient;
pub mod kmeans;
pub mod meanshift;
pub mod consolidate;

pub mod graph;
pub mod backend;
pub mod cpu;
pub mod gpu;

pub mod config;
pub mod pipeline;

pub use backend::ComputeBackend;
pub use config::{BackendKind, KmeansConfig, MeanShiftConfig, SegmentConfig};
pub use error::{Result, SegmentError};
pub use image::RgbaImage;
pub use pipeline::{segment, Algorithm, Detail, RunReport, Segmented};
