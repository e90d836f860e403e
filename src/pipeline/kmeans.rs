// pipeline/kmeans.rs — K-means: a host-driven fixed-point loop.
//
//   upload input, initial centroids
//   repeat up to max_iterations:
//       kmeans_assign    (labels    <- input, centroids)
//       kmeans_recompute (centroids <- input, labels)
//       readback centroids; stop if no RGB value changed
//   kmeans_color (output <- centroids, labels) → readback output
//
// Running out of iterations is not an error: the last centroids are used
// and the outcome is reported as `Convergence::IterationCap`.

use tracing::{debug, warn};

use crate::backend::ComputeBackend;
use crate::buffers::{BufferKind, BufferSpec};
use crate::config::KmeansConfig;
use crate::dispatch::{Arg, Extent, Kernel};
use crate::error::{Result, SegmentError};
use crate::image::RgbaImage;
use crate::kmeans::{self, KmeansParams, MAX_PIXELS};
use crate::pipeline::{dimensions, Algorithm, Detail, Segmentation, Session};

/// How the iteration loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    /// Iteration `iterations` left every centroid unchanged.
    Converged { iterations: u32 },
    /// Stopped after `iterations` rounds with centroids still moving.
    IterationCap { iterations: u32 },
}

impl Convergence {
    pub fn iterations(&self) -> u32 {
        match *self {
            Convergence::Converged { iterations } | Convergence::IterationCap { iterations } => {
                iterations
            }
        }
    }

    pub fn converged(&self) -> bool {
        matches!(self, Convergence::Converged { .. })
    }
}

#[derive(Debug, Clone)]
pub struct KmeansClustering {
    config: KmeansConfig,
}

impl KmeansClustering {
    pub fn new(config: KmeansConfig) -> Self {
        KmeansClustering { config }
    }
}

impl Segmentation for KmeansClustering {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Kmeans
    }

    fn run<B: ComputeBackend + ?Sized>(
        &self,
        s: &mut Session<'_, B>,
        image: &RgbaImage,
    ) -> Result<(RgbaImage, Detail)> {
        let (w, h) = dimensions(image)?;
        let k = self.config.clusters;
        if k == 0 {
            return Err(SegmentError::Config("kmeans.clusters must be at least 1".into()));
        }
        if image.pixel_count() > MAX_PIXELS {
            return Err(SegmentError::InvalidImage(format!(
                "{} pixels exceeds the k-means limit of {MAX_PIXELS}",
                image.pixel_count()
            )));
        }
        let pixels = image.pixel_count() as u64;

        let words = image.to_words();
        let initial = kmeans::initial_centroids(&words, k as usize, self.config.seed);

        let input = s.allocate(BufferSpec::new("input", BufferKind::Input, image.packed_byte_size()))?;
        let centroids = s.allocate(BufferSpec::new("centroids", BufferKind::Scratch, k as u64 * 4))?;
        let labels = s.allocate(BufferSpec::new("labels", BufferKind::Scratch, pixels * 4))?;
        let output = s.allocate(BufferSpec::new("output", BufferKind::Output, image.packed_byte_size()))?;

        s.upload_words(input, &words)?;
        s.upload_words(centroids, &initial)?;

        let params = Arg::params(&KmeansParams::new(w, h, k));
        let per_pixel = Extent::new(w, h);
        let per_centroid = Extent::new(k, 1);

        let max = self.config.max_iterations;
        let mut previous = initial;
        let mut history = Vec::new();
        let mut convergence = Convergence::IterationCap { iterations: max };
        for iteration in 1..=max {
            s.dispatch(
                Kernel::KmeansAssign,
                vec![
                    Arg::Buffer(input),
                    Arg::Buffer(centroids),
                    Arg::Buffer(labels),
                    params.clone(),
                ],
                per_pixel,
            )?;
            s.dispatch(
                Kernel::KmeansRecompute,
                vec![
                    Arg::Buffer(input),
                    Arg::Buffer(labels),
                    Arg::Buffer(centroids),
                    params.clone(),
                ],
                per_centroid,
            )?;
            let next = s.download_words(centroids)?;
            let done = kmeans::converged(&previous, &next);
            debug!(iteration, converged = done, "k-means iteration");
            history.push(next.clone());
            previous = next;
            if done {
                convergence = Convergence::Converged { iterations: iteration };
                break;
            }
        }
        if !convergence.converged() {
            warn!(iterations = max, "k-means stopped at the iteration cap before converging");
        }

        s.dispatch(
            Kernel::KmeansColor,
            vec![
                Arg::Buffer(centroids),
                Arg::Buffer(labels),
                Arg::Buffer(output),
                params,
            ],
            per_pixel,
        )?;
        let out = s.download_words(output)?;
        let result = RgbaImage::from_words(image.width(), image.height(), &out)?;
        Ok((result, Detail::Kmeans { convergence, history }))
    }
}
