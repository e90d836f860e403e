// backend.rs — The seam between the orchestrator and a compute device.
//
// The pipelines never touch wgpu directly. They allocate buffers, move
// bytes, and launch kernels through `ComputeBackend`, which has two
// implementations:
//
//   gpu::GpuBackend  wgpu compute on a real adapter
//   cpu::CpuBackend  the reference device; runs the CPU kernels and enforces
//                    that launches only observe what their wait lists order
//
// Completion signals are minted by the backend. A signal returned by
// `upload` is already complete; one returned by `launch` completes when
// the device finishes the kernel.

use crate::buffers::{BufferId, BufferSpec};
use crate::config::{BackendKind, SegmentConfig};
use crate::cpu::CpuBackend;
use crate::dispatch::{LaunchDescriptor, Signal, WorkgroupSize};
use crate::error::Result;
use crate::gpu::GpuBackend;

pub trait ComputeBackend {
    /// Human-readable device description for logs.
    fn describe(&self) -> String;

    /// Workgroup size every kernel was built with.
    fn workgroup_size(&self) -> WorkgroupSize;

    /// Allocate a device buffer of exactly `spec.size` bytes.
    fn allocate(&mut self, spec: BufferSpec) -> Result<BufferId>;

    /// Copy `bytes` into `buffer`, blocking until the copy is done.
    fn upload(&mut self, buffer: BufferId, bytes: &[u8]) -> Result<Signal>;

    /// Enqueue a kernel launch. It starts only after every signal in
    /// `desc.wait_list` has completed.
    fn launch(&mut self, desc: &LaunchDescriptor) -> Result<Signal>;

    /// Block until every signal has completed.
    fn wait(&mut self, signals: &[Signal]) -> Result<()>;

    /// Block on `wait_list`, then read `buffer` back.
    fn download(&mut self, buffer: BufferId, wait_list: &[Signal]) -> Result<Vec<u8>>;

    /// Free `buffer`. Unknown ids are ignored.
    fn release(&mut self, buffer: BufferId);
}

impl<B: ComputeBackend + ?Sized> ComputeBackend for Box<B> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn workgroup_size(&self) -> WorkgroupSize {
        (**self).workgroup_size()
    }

    fn allocate(&mut self, spec: BufferSpec) -> Result<BufferId> {
        (**self).allocate(spec)
    }

    fn upload(&mut self, buffer: BufferId, bytes: &[u8]) -> Result<Signal> {
        (**self).upload(buffer, bytes)
    }

    fn launch(&mut self, desc: &LaunchDescriptor) -> Result<Signal> {
        (**self).launch(desc)
    }

    fn wait(&mut self, signals: &[Signal]) -> Result<()> {
        (**self).wait(signals)
    }

    fn download(&mut self, buffer: BufferId, wait_list: &[Signal]) -> Result<Vec<u8>> {
        (**self).download(buffer, wait_list)
    }

    fn release(&mut self, buffer: BufferId) {
        (**self).release(buffer)
    }
}

/// Open the backend selected by `config`.
pub fn open(config: &SegmentConfig) -> Result<Box<dyn ComputeBackend>> {
    let workgroup = config.workgroup.unwrap_or_default();
    Ok(match config.backend {
        BackendKind::Gpu => Box::new(GpuBackend::new(workgroup)?),
        BackendKind::Cpu => Box::new(CpuBackend::new(workgroup)),
    })
}
