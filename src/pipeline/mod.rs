// pipeline/mod.rs — Segmentation pipelines over a compute backend.
//
// Each algorithm is one `Segmentation` implementation driving a `Session`:
//
//   edge      upload → edge_x, edge_y → edge_result → readback
//   kmeans    upload → (assign → recompute → readback centroids)* → color
//   meanshift upload → seed → optimize → readback peaks → consolidate on
//             the host → upload color table → color → readback
//
// The session owns the run's buffers and the wait graph. Pipelines only say
// which kernel to run on which buffers; the session fills in launch
// geometry and the wait list, so every dependency is derived from the
// kernel table rather than written out by hand.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::backend::ComputeBackend;
use crate::buffers::{BufferId, BufferSpec};
use crate::config::SegmentConfig;
use crate::dispatch::{Arg, Extent, Kernel, LaunchDescriptor, Signal};
use crate::error::{Result, SegmentError};
use crate::graph::{NodeKind, WaitGraph};
use crate::image::RgbaImage;

pub mod edge;
pub mod kmeans;
pub mod meanshift;

pub use edge::EdgeDetection;
pub use kmeans::{Convergence, KmeansClustering};
pub use meanshift::MeanShift;

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Host-observed duration of one session operation.
#[derive(Debug, Clone)]
pub struct StageTiming {
    pub label: String,
    pub elapsed: Duration,
}

/// One run's working set on a borrowed backend.
///
/// Buffers allocated through the session are released in reverse creation
/// order when it is dropped, including on early return with `?`.
pub struct Session<'b, B: ComputeBackend + ?Sized> {
    backend: &'b mut B,
    graph: WaitGraph,
    buffers: Vec<(BufferId, &'static str)>,
    timings: Vec<StageTiming>,
}

impl<'b, B: ComputeBackend + ?Sized> Session<'b, B> {
    pub fn new(backend: &'b mut B) -> Self {
        Session {
            backend,
            graph: WaitGraph::new(),
            buffers: Vec::new(),
            timings: Vec::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &*self.backend
    }

    pub fn graph(&self) -> &WaitGraph {
        &self.graph
    }

    fn label(&self, id: BufferId) -> &'static str {
        self.buffers
            .iter()
            .find(|(b, _)| *b == id)
            .map_or("?", |&(_, label)| label)
    }

    fn timed<T>(&mut self, label: String, f: impl FnOnce(&mut B) -> Result<T>) -> Result<T> {
        let start = Instant::now();
        let out = f(&mut *self.backend)?;
        let elapsed = start.elapsed();
        debug!(stage = %label, ?elapsed, "stage done");
        self.timings.push(StageTiming { label, elapsed });
        Ok(out)
    }

    pub fn allocate(&mut self, spec: BufferSpec) -> Result<BufferId> {
        let id = self.backend.allocate(spec)?;
        self.buffers.push((id, spec.label));
        Ok(id)
    }

    /// Blocking upload. Waits out in-flight readers and writers of `buffer`
    /// first; the copy then becomes its most recent writer.
    pub fn upload(&mut self, buffer: BufferId, bytes: &[u8]) -> Result<Signal> {
        let waits = self.graph.plan(&[], &[buffer]);
        if !waits.is_empty() {
            self.backend.wait(&waits)?;
            self.graph.retire(&waits);
        }
        let label = format!("upload {}", self.label(buffer));
        let signal = self.timed(label.clone(), |b| b.upload(buffer, bytes))?;
        self.graph
            .record(label, signal, NodeKind::Transfer, &[], &[buffer], &waits);
        self.graph.retire(&[signal]);
        Ok(signal)
    }

    pub fn upload_words(&mut self, buffer: BufferId, words: &[u32]) -> Result<Signal> {
        self.upload(buffer, bytemuck::cast_slice(words))
    }

    /// Launch `kernel` over `work` items with `args` in slot order.
    pub fn dispatch(&mut self, kernel: Kernel, args: Vec<Arg>, work: Extent) -> Result<Signal> {
        let local = self
            .backend
            .workgroup_size()
            .local_extent(kernel.signature().dims);
        let mut desc = LaunchDescriptor {
            kernel,
            args,
            global: Extent::covering(work, local),
            local,
            wait_list: Vec::new(),
        };
        let (reads, writes) = (desc.reads(), desc.writes());
        desc.wait_list = self.graph.plan(&reads, &writes);

        let signal = self.timed(kernel.to_string(), |b| b.launch(&desc))?;
        self.graph.record(
            kernel.entry_point(),
            signal,
            NodeKind::Dispatch,
            &reads,
            &writes,
            &desc.wait_list,
        );
        Ok(signal)
    }

    /// Blocking readback after the buffer's most recent writer.
    pub fn download(&mut self, buffer: BufferId) -> Result<Vec<u8>> {
        let waits: Vec<Signal> = self.graph.last_writer(buffer).into_iter().collect();
        let label = format!("download {}", self.label(buffer));
        let bytes = self.timed(label, |b| b.download(buffer, &waits))?;
        self.graph.retire(&waits);
        Ok(bytes)
    }

    pub fn download_words(&mut self, buffer: BufferId) -> Result<Vec<u32>> {
        let bytes = self.download(buffer)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    /// Hand back the wait graph and stage timings. Buffers are released.
    pub fn finish(mut self) -> (WaitGraph, Vec<StageTiming>) {
        (
            std::mem::take(&mut self.graph),
            std::mem::take(&mut self.timings),
        )
    }
}

impl<B: ComputeBackend + ?Sized> Drop for Session<'_, B> {
    fn drop(&mut self) {
        while let Some((id, _)) = self.buffers.pop() {
            self.backend.release(id);
        }
    }
}

// ---------------------------------------------------------------------------
// Algorithms
// ---------------------------------------------------------------------------

/// Algorithm family selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Edge,
    Kmeans,
    MeanShift,
}

impl Algorithm {
    pub const ALL: [Algorithm; 3] = [Algorithm::Edge, Algorithm::Kmeans, Algorithm::MeanShift];

    pub fn name(self) -> &'static str {
        match self {
            Algorithm::Edge => "edge",
            Algorithm::Kmeans => "kmeans",
            Algorithm::MeanShift => "meanshift",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Algorithm-specific outcome of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum Detail {
    Edge,
    Kmeans {
        convergence: Convergence,
        /// Centroids after each iteration.
        history: Vec<Vec<u32>>,
    },
    MeanShift {
        unique_peaks: usize,
    },
}

/// One algorithm's control flow.
pub trait Segmentation {
    fn algorithm(&self) -> Algorithm;

    fn run<B: ComputeBackend + ?Sized>(
        &self,
        session: &mut Session<'_, B>,
        image: &RgbaImage,
    ) -> Result<(RgbaImage, Detail)>;
}

/// Everything recorded about a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub algorithm: Algorithm,
    pub device: String,
    pub timings: Vec<StageTiming>,
    pub graph: WaitGraph,
    pub detail: Detail,
}

impl RunReport {
    pub fn total_time(&self) -> Duration {
        self.timings.iter().map(|t| t.elapsed).sum()
    }

    pub fn dispatch_count(&self) -> usize {
        self.graph
            .nodes()
            .iter()
            .filter(|n| n.kind == NodeKind::Dispatch)
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct Segmented {
    pub image: RgbaImage,
    pub report: RunReport,
}

/// Image dimensions as kernel parameters.
pub(crate) fn dimensions(image: &RgbaImage) -> Result<(u32, u32)> {
    if image.width() == 0 || image.height() == 0 {
        return Err(SegmentError::InvalidImage(format!(
            "empty image ({}x{})",
            image.width(),
            image.height()
        )));
    }
    let w = u32::try_from(image.width());
    let h = u32::try_from(image.height());
    match (w, h) {
        (Ok(w), Ok(h)) if w.checked_mul(h).is_some() => Ok((w, h)),
        _ => Err(SegmentError::InvalidImage(format!(
            "{}x{} exceeds the device index range",
            image.width(),
            image.height()
        ))),
    }
}

fn run_stage<S: Segmentation, B: ComputeBackend + ?Sized>(
    stage: &S,
    session: &mut Session<'_, B>,
    image: &RgbaImage,
) -> Result<(RgbaImage, Detail)> {
    debug!(algorithm = %stage.algorithm(), "running");
    stage.run(session, image)
}

/// Run `algorithm` on `image`.
pub fn segment<B: ComputeBackend + ?Sized>(
    backend: &mut B,
    algorithm: Algorithm,
    config: &SegmentConfig,
    image: &RgbaImage,
) -> Result<Segmented> {
    config.validate()?;
    dimensions(image)?;
    let device = backend.describe();
    let start = Instant::now();

    let mut session = Session::new(backend);
    let (output, detail) = match algorithm {
        Algorithm::Edge => run_stage(&EdgeDetection, &mut session, image)?,
        Algorithm::Kmeans => {
            run_stage(&KmeansClustering::new(config.kmeans.clone()), &mut session, image)?
        }
        Algorithm::MeanShift => {
            run_stage(&MeanShift::new(config.meanshift.clone()), &mut session, image)?
        }
    };
    let (graph, timings) = session.finish();
    graph.validate()?;

    let report = RunReport {
        algorithm,
        device,
        timings,
        graph,
        detail,
    };
    info!(
        %algorithm,
        width = image.width(),
        height = image.height(),
        dispatches = report.dispatch_count(),
        elapsed = ?start.elapsed(),
        "segmentation finished"
    );

    Ok(Segmented {
        image: output,
        report,
    })
}
