// config.rs — Run configuration.
//
// Every field has a default, so an empty JSON object is a valid config and
// a file only needs the keys it changes:
//
//   {
//     "kmeans":    { "clusters": 4, "seed": 7 },
//     "meanshift": { "spatial_radius": 8 },
//     "workgroup": { "x": 8, "y": 8 },
//     "backend":   "cpu"
//   }
//
// CLI flags are applied on top of the loaded file by the binary.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dispatch::WorkgroupSize;
use crate::error::{Result, SegmentError};

/// Which compute device runs the kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Gpu,
    Cpu,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KmeansConfig {
    /// K. Must be at least 1.
    pub clusters: u32,
    /// Upper bound on assign/recompute rounds. Hitting it is reported, not
    /// treated as an error.
    pub max_iterations: u32,
    /// Seed for choosing the initial centroids.
    pub seed: u64,
}

impl Default for KmeansConfig {
    fn default() -> Self {
        KmeansConfig {
            clusters: 8,
            max_iterations: 64,
            seed: 0x5eed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeanShiftConfig {
    /// Window radius in pixels.
    pub spatial_radius: u32,
    /// Maximum RGB distance of a window member from the chain's own pixel.
    pub color_radius: f32,
    /// Per-pixel step cap for the optimize kernel.
    pub max_steps: u32,
}

impl Default for MeanShiftConfig {
    fn default() -> Self {
        MeanShiftConfig {
            spatial_radius: 6,
            color_radius: 24.0,
            max_steps: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    pub kmeans: KmeansConfig,
    pub meanshift: MeanShiftConfig,
    /// Workgroup size override. `None` uses 16×8.
    pub workgroup: Option<WorkgroupSize>,
    pub backend: BackendKind,
}

impl SegmentConfig {
    /// Load and validate a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: SegmentConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kmeans.clusters == 0 {
            return Err(SegmentError::Config("kmeans.clusters must be at least 1".into()));
        }
        if self.kmeans.max_iterations == 0 {
            return Err(SegmentError::Config(
                "kmeans.max_iterations must be at least 1".into(),
            ));
        }
        if self.meanshift.max_steps == 0 {
            return Err(SegmentError::Config("meanshift.max_steps must be at least 1".into()));
        }
        if !(self.meanshift.color_radius.is_finite() && self.meanshift.color_radius >= 0.0) {
            return Err(SegmentError::Config(format!(
                "meanshift.color_radius must be finite and non-negative, got {}",
                self.meanshift.color_radius
            )));
        }
        if let Some(ws) = self.workgroup {
            if ws.x == 0 || ws.y == 0 {
                return Err(SegmentError::Config(format!(
                    "workgroup dimensions must be non-zero, got {}x{}",
                    ws.x, ws.y
                )));
            }
            if ws.x.checked_mul(ws.y).is_none() {
                return Err(SegmentError::Config(format!(
                    "workgroup {}x{} exceeds the invocation index range",
                    ws.x, ws.y
                )));
            }
        }
        Ok(())
    }
}
