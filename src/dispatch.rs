// dispatch.rs — Kernel dispatch table and launch descriptors.
//
// Every device entry point the orchestrator can launch is listed in the
// `Kernel` enum. Its `KernelSignature` fixes:
//   - the WGSL entry-point name,
//   - the work-grid dimensionality (1-D per centroid, 2-D per pixel),
//   - the ordered argument slots: binding index + how the kernel accesses
//     the bound buffer.
//
// The access column drives synchronisation: the wait graph derives each
// launch's wait list from which slots read and which slots write. It also
// drives the GPU bind group layout (read-only storage vs read-write vs
// uniform), so the table is the single place where a kernel's argument
// contract lives.
//
// LAUNCH GEOMETRY
// ───────────────
// The global size of a launch must be a whole multiple of the local
// (workgroup) size in every dimension. Per-pixel stages round the image up
// to the next multiple; kernels guard with
//
//   if gid.x >= width || gid.y >= height { return; }
//
// so the padding work items do nothing.

use std::collections::HashMap;
use std::fmt;

use crate::buffers::BufferId;
use crate::error::{Result, SegmentError};
use crate::gradient::EdgeParams;
use crate::kmeans::KmeansParams;
use crate::meanshift::MeanShiftParams;

// ---------------------------------------------------------------------------
// Completion signals
// ---------------------------------------------------------------------------

/// Handle produced exactly once by a launch or transfer. Later launches,
/// waits and downloads may reference it any number of times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signal(pub(crate) u64);

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Workgroup size
// ---------------------------------------------------------------------------

/// Workgroup (local) size used for every launch.
///
/// 2-D kernels use `x × y`; 1-D kernels use a flat row of `x * y` items so
/// both shapes occupy the same number of invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl Default for WorkgroupSize {
    /// 16×8 = 128 invocations: four 32-wide warps or two 64-wide waves.
    fn default() -> Self {
        WorkgroupSize { x: 16, y: 8 }
    }
}

impl WorkgroupSize {
    /// Invocations per workgroup, saturating at `u32::MAX`.
    pub fn total(&self) -> u32 {
        self.x.saturating_mul(self.y)
    }

    /// Local extent for a kernel of the given dimensionality.
    pub fn local_extent(&self, dims: Dims) -> Extent {
        match dims {
            Dims::One => Extent::new(self.total(), 1),
            Dims::Two => Extent::new(self.x, self.y),
        }
    }

    /// Placeholder values substituted into the WGSL template.
    pub fn template_values(&self) -> HashMap<&'static str, String> {
        HashMap::from([
            ("{{WG_X}}", self.x.to_string()),
            ("{{WG_Y}}", self.y.to_string()),
            ("{{WG_1D}}", self.total().to_string()),
        ])
    }

    /// Fit this size inside the device limits.
    ///
    /// Returns the size unchanged when it fits. Otherwise falls back to a
    /// single row as wide as the limits allow (`x = min(max_x, max_invocations)`,
    /// `y = 1`) and reports `true` so the caller can warn.
    pub fn fit_within(&self, max_invocations: u32, max_x: u32, max_y: u32) -> (WorkgroupSize, bool) {
        let fits = self.x > 0
            && self.y > 0
            && self.total() <= max_invocations
            && self.x <= max_x
            && self.y <= max_y;
        if fits {
            return (*self, false);
        }
        let x = self.x.max(1).min(max_x).min(max_invocations).max(1);
        (WorkgroupSize { x, y: 1 }, true)
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} ({} invocations)", self.x, self.y, self.total())
    }
}

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Work-grid dimensionality of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dims {
    One,
    Two,
}

/// A 2-D extent in work items. 1-D extents use `y = 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub x: u32,
    pub y: u32,
}

impl Extent {
    pub const fn new(x: u32, y: u32) -> Self {
        Extent { x, y }
    }

    /// Smallest global extent covering `work` that is a multiple of `local`.
    pub fn covering(work: Extent, local: Extent) -> Extent {
        Extent::new(round_up(work.x, local.x), round_up(work.y, local.y))
    }

    /// Number of workgroups along each axis for `self` as a global size.
    pub fn groups(&self, local: Extent) -> (u32, u32) {
        (self.x / local.x, self.y / local.y)
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{}", self.x, self.y)
    }
}

/// Round `value` up to the next multiple of `multiple`.
///
///   round_up(100, 16) = 112
///   round_up(112, 16) = 112
///   round_up(0, 16)   = 0
#[inline]
pub fn round_up(value: u32, multiple: u32) -> u32 {
    value.div_ceil(multiple) * multiple
}

// ---------------------------------------------------------------------------
// Kernel table
// ---------------------------------------------------------------------------

/// How a kernel touches the buffer bound to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Declared `var<storage, read>`; never written by any kernel.
    Input,
    /// Declared read-write in the program but only read by this kernel.
    Read,
    /// Written without being read.
    Write,
    /// Read and written.
    ReadWrite,
    /// Scalar parameter block bound as a uniform buffer.
    Params,
}

impl Access {
    pub fn reads(self) -> bool {
        matches!(self, Access::Input | Access::Read | Access::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// One argument position of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub binding: u32,
    pub name: &'static str,
    pub access: Access,
}

impl Slot {
    const fn new(binding: u32, name: &'static str, access: Access) -> Self {
        Slot { binding, name, access }
    }
}

#[derive(Debug)]
pub struct KernelSignature {
    pub entry_point: &'static str,
    pub dims: Dims,
    pub slots: &'static [Slot],
    pub params_size: usize,
}

/// Device entry points known to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    EdgeX,
    EdgeY,
    EdgeResult,
    KmeansAssign,
    KmeansRecompute,
    KmeansColor,
    MeanShiftSeed,
    MeanShiftOptimize,
    MeanShiftColor,
}

const EDGE_PARAMS: usize = std::mem::size_of::<EdgeParams>();
const KMEANS_PARAMS: usize = std::mem::size_of::<KmeansParams>();
const MEANSHIFT_PARAMS: usize = std::mem::size_of::<MeanShiftParams>();

static EDGE_X: KernelSignature = KernelSignature {
    entry_point: "edge_x",
    dims: Dims::Two,
    slots: &[
        Slot::new(0, "input", Access::Input),
        Slot::new(1, "grad_x", Access::Write),
        Slot::new(4, "params", Access::Params),
    ],
    params_size: EDGE_PARAMS,
};

static EDGE_Y: KernelSignature = KernelSignature {
    entry_point: "edge_y",
    dims: Dims::Two,
    slots: &[
        Slot::new(0, "input", Access::Input),
        Slot::new(2, "grad_y", Access::Write),
        Slot::new(4, "params", Access::Params),
    ],
    params_size: EDGE_PARAMS,
};

static EDGE_RESULT: KernelSignature = KernelSignature {
    entry_point: "edge_result",
    dims: Dims::Two,
    slots: &[
        Slot::new(1, "grad_x", Access::Read),
        Slot::new(2, "grad_y", Access::Read),
        Slot::new(3, "output", Access::Write),
        Slot::new(4, "params", Access::Params),
    ],
    params_size: EDGE_PARAMS,
};

static KMEANS_ASSIGN: KernelSignature = KernelSignature {
    entry_point: "kmeans_assign",
    dims: Dims::Two,
    slots: &[
        Slot::new(10, "input", Access::Input),
        Slot::new(11, "centroids", Access::Read),
        Slot::new(12, "labels", Access::Write),
        Slot::new(14, "params", Access::Params),
    ],
    params_size: KMEANS_PARAMS,
};

static KMEANS_RECOMPUTE: KernelSignature = KernelSignature {
    entry_point: "kmeans_recompute",
    dims: Dims::One,
    slots: &[
        Slot::new(10, "input", Access::Input),
        Slot::new(12, "labels", Access::Read),
        Slot::new(11, "centroids", Access::ReadWrite),
        Slot::new(14, "params", Access::Params),
    ],
    params_size: KMEANS_PARAMS,
};

static KMEANS_COLOR: KernelSignature = KernelSignature {
    entry_point: "kmeans_color",
    dims: Dims::Two,
    slots: &[
        Slot::new(11, "centroids", Access::Read),
        Slot::new(12, "labels", Access::Read),
        Slot::new(13, "output", Access::Write),
        Slot::new(14, "params", Access::Params),
    ],
    params_size: KMEANS_PARAMS,
};

static MEANSHIFT_SEED: KernelSignature = KernelSignature {
    entry_point: "meanshift_seed",
    dims: Dims::Two,
    slots: &[
        Slot::new(20, "input", Access::Input),
        Slot::new(21, "positions", Access::Write),
        Slot::new(26, "params", Access::Params),
    ],
    params_size: MEANSHIFT_PARAMS,
};

static MEANSHIFT_OPTIMIZE: KernelSignature = KernelSignature {
    entry_point: "meanshift_optimize",
    dims: Dims::Two,
    slots: &[
        Slot::new(20, "input", Access::Input),
        Slot::new(21, "positions", Access::Read),
        Slot::new(22, "peaks", Access::Write),
        Slot::new(26, "params", Access::Params),
    ],
    params_size: MEANSHIFT_PARAMS,
};

static MEANSHIFT_COLOR: KernelSignature = KernelSignature {
    entry_point: "meanshift_color",
    dims: Dims::Two,
    slots: &[
        Slot::new(22, "peaks", Access::Read),
        Slot::new(23, "keys", Access::Input),
        Slot::new(24, "palette", Access::Input),
        Slot::new(25, "output", Access::Write),
        Slot::new(26, "params", Access::Params),
    ],
    params_size: MEANSHIFT_PARAMS,
};

impl Kernel {
    pub const ALL: [Kernel; 9] = [
        Kernel::EdgeX,
        Kernel::EdgeY,
        Kernel::EdgeResult,
        Kernel::KmeansAssign,
        Kernel::KmeansRecompute,
        Kernel::KmeansColor,
        Kernel::MeanShiftSeed,
        Kernel::MeanShiftOptimize,
        Kernel::MeanShiftColor,
    ];

    pub fn signature(self) -> &'static KernelSignature {
        match self {
            Kernel::EdgeX => &EDGE_X,
            Kernel::EdgeY => &EDGE_Y,
            Kernel::EdgeResult => &EDGE_RESULT,
            Kernel::KmeansAssign => &KMEANS_ASSIGN,
            Kernel::KmeansRecompute => &KMEANS_RECOMPUTE,
            Kernel::KmeansColor => &KMEANS_COLOR,
            Kernel::MeanShiftSeed => &MEANSHIFT_SEED,
            Kernel::MeanShiftOptimize => &MEANSHIFT_OPTIMIZE,
            Kernel::MeanShiftColor => &MEANSHIFT_COLOR,
        }
    }

    pub fn entry_point(self) -> &'static str {
        self.signature().entry_point
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entry_point())
    }
}

// ---------------------------------------------------------------------------
// Launch descriptor
// ---------------------------------------------------------------------------

/// Value bound to one argument slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Buffer(BufferId),
    /// Raw bytes of a `#[repr(C)]` parameter struct.
    Params(Vec<u8>),
}

impl Arg {
    pub fn params<T: bytemuck::Pod>(value: &T) -> Self {
        Arg::Params(bytemuck::bytes_of(value).to_vec())
    }
}

/// Everything a backend needs for one launch. Built fresh per dispatch.
#[derive(Debug, Clone)]
pub struct LaunchDescriptor {
    pub kernel: Kernel,
    /// One entry per signature slot, in slot order.
    pub args: Vec<Arg>,
    pub global: Extent,
    pub local: Extent,
    pub wait_list: Vec<Signal>,
}

impl LaunchDescriptor {
    /// Check bindings and geometry against the kernel signature.
    ///
    /// `expected_local` is the backend's compiled workgroup extent for the
    /// kernel's dimensionality.
    pub fn validate(&self, expected_local: Extent) -> Result<()> {
        let sig = self.kernel.signature();
        let name = sig.entry_point;

        if self.args.len() != sig.slots.len() {
            return Err(SegmentError::dispatch(
                name,
                format!("expected {} arguments, got {}", sig.slots.len(), self.args.len()),
            ));
        }

        let mut seen: Vec<BufferId> = Vec::with_capacity(self.args.len());
        for (slot, arg) in sig.slots.iter().zip(&self.args) {
            match (slot.access, arg) {
                (Access::Params, Arg::Params(bytes)) => {
                    if bytes.len() != sig.params_size {
                        return Err(SegmentError::dispatch(
                            name,
                            format!(
                                "parameter block is {} bytes, expected {}",
                                bytes.len(),
                                sig.params_size
                            ),
                        ));
                    }
                }
                (Access::Params, Arg::Buffer(_)) => {
                    return Err(SegmentError::dispatch(
                        name,
                        format!("slot `{}` expects parameters, got a buffer", slot.name),
                    ));
                }
                (_, Arg::Params(_)) => {
                    return Err(SegmentError::dispatch(
                        name,
                        format!("slot `{}` expects a buffer, got parameters", slot.name),
                    ));
                }
                (_, Arg::Buffer(id)) => {
                    if seen.contains(id) {
                        return Err(SegmentError::dispatch(
                            name,
                            format!("buffer {id:?} bound to more than one slot"),
                        ));
                    }
                    seen.push(*id);
                }
            }
        }

        if self.local != expected_local {
            return Err(SegmentError::dispatch(
                name,
                format!("local size {} does not match compiled {}", self.local, expected_local),
            ));
        }
        if self.global.x == 0 || self.global.y == 0 {
            return Err(SegmentError::dispatch(name, "empty global size"));
        }
        if self.global.x % self.local.x != 0 || self.global.y % self.local.y != 0 {
            return Err(SegmentError::dispatch(
                name,
                format!("global size {} is not a multiple of local size {}", self.global, self.local),
            ));
        }
        Ok(())
    }

    /// Buffers bound to slots the kernel reads, in slot order.
    pub fn reads(&self) -> Vec<BufferId> {
        self.bound(Access::reads)
    }

    /// Buffers bound to slots the kernel writes, in slot order.
    pub fn writes(&self) -> Vec<BufferId> {
        self.bound(Access::writes)
    }

    fn bound(&self, pred: fn(Access) -> bool) -> Vec<BufferId> {
        self.kernel
            .signature()
            .slots
            .iter()
            .zip(&self.args)
            .filter_map(|(slot, arg)| match arg {
                Arg::Buffer(id) if pred(slot.access) => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// The buffer bound to the slot at `binding`.
    pub fn buffer_at(&self, binding: u32) -> Option<BufferId> {
        self.kernel
            .signature()
            .slots
            .iter()
            .zip(&self.args)
            .find_map(|(slot, arg)| match arg {
                Arg::Buffer(id) if slot.binding == binding => Some(*id),
                _ => None,
            })
    }

    /// The parameter block bytes, if bound.
    pub fn params_bytes(&self) -> Option<&[u8]> {
        self.args.iter().find_map(|arg| match arg {
            Arg::Params(bytes) => Some(bytes.as_slice()),
            Arg::Buffer(_) => None,
        })
    }
}
