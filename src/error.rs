// error.rs — Error type shared by every stage of the segmentation pipeline.
//
// None of these failures are transient, so nothing here is retried. The
// orchestrator propagates the first error with `?`; buffers and the device
// context are released by `Drop` on the way out.

use crate::buffers::BufferId;
use crate::dispatch::Signal;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, SegmentError>;

/// Coarse classification of a [`SegmentError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// No usable device, or the device program failed to build.
    Environment,
    /// Allocation or host/device transfer failure.
    Resource,
    /// Invalid argument binding, launch geometry or synchronisation use.
    /// Always a programming error.
    Dispatch,
    /// Bad image or configuration supplied by the caller.
    Input,
    /// Mean-shift produced no labelled pixels.
    Degenerate,
}

#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("no compatible compute device found")]
    NoDevice,

    #[error("device request failed: {0}")]
    DeviceRequest(String),

    #[error("device program failed to build\n{log}")]
    ProgramBuild { log: String },

    #[error("failed to allocate buffer `{label}` ({size} bytes): {reason}")]
    Allocation {
        label: String,
        size: u64,
        reason: String,
    },

    #[error("transfer on buffer `{label}` failed: {reason}")]
    Transfer { label: String, reason: String },

    #[error("unknown buffer handle {0:?}")]
    UnknownBuffer(BufferId),

    #[error("invalid launch of `{kernel}`: {reason}")]
    Dispatch { kernel: &'static str, reason: String },

    #[error("unknown completion signal {0:?}")]
    UnknownSignal(Signal),

    #[error("buffer `{label}` is still referenced by an in-flight dispatch")]
    Hazard { label: String },

    #[error("workgroup size {total} exceeds device limit of {max} invocations")]
    WorkgroupTooLarge { total: u32, max: u32 },

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("peak consolidation found no labelled pixels")]
    DegenerateConsolidation,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SegmentError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SegmentError::NoDevice
            | SegmentError::DeviceRequest(_)
            | SegmentError::ProgramBuild { .. } => ErrorCategory::Environment,
            SegmentError::Allocation { .. }
            | SegmentError::Transfer { .. }
            | SegmentError::UnknownBuffer(_)
            | SegmentError::Io(_) => ErrorCategory::Resource,
            SegmentError::Dispatch { .. }
            | SegmentError::UnknownSignal(_)
            | SegmentError::Hazard { .. }
            | SegmentError::WorkgroupTooLarge { .. } => ErrorCategory::Dispatch,
            SegmentError::InvalidImage(_) | SegmentError::Config(_) | SegmentError::Json(_) => {
                ErrorCategory::Input
            }
            SegmentError::DegenerateConsolidation => ErrorCategory::Degenerate,
        }
    }

    pub(crate) fn dispatch(kernel: &'static str, reason: impl Into<String>) -> Self {
        SegmentError::Dispatch {
            kernel,
            reason: reason.into(),
        }
    }
}
