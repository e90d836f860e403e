// gpu/mod.rs — wgpu compute backend.
//
// The CPU kernels in gradient.rs, kmeans.rs and meanshift.rs remain the
// reference; every GPU kernel is validated against them.
//
// SUBMISSION MODEL
// ────────────────
// Each launch is recorded into its own command buffer and submitted
// immediately. The returned signal maps to the submission index, and
// waiting on a signal polls the device until that submission is done.
//
// wgpu has no cross-submission events, so a launch's wait list is honoured
// by blocking on the host before the submit. Queue order alone would
// already serialise the work; the host wait keeps the signal contract
// identical to the CPU reference device.
//
// READBACK
// ────────
//   storage buffer ─copy─> staging (MAP_READ | COPY_DST) ─map_async─> Vec<u8>
//
// The map callback sends its result over a channel; `poll(Wait)` drives it.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};
use wgpu::util::DeviceExt;

use crate::backend::ComputeBackend;
use crate::buffers::{BufferId, BufferSet, BufferSpec};
use crate::dispatch::{Arg, LaunchDescriptor, Signal, WorkgroupSize};
use crate::error::{Result, SegmentError};

pub mod device;
pub mod kernels;

use device::DeviceContext;
use kernels::KernelTable;

pub struct GpuBackend {
    buffers: BufferSet<wgpu::Buffer>,
    in_flight: HashMap<Signal, wgpu::SubmissionIndex>,
    completed: HashSet<Signal>,
    next_signal: u64,
    kernels: KernelTable,
    ctx: DeviceContext,
}

impl GpuBackend {
    /// Open the preferred adapter and build every kernel pipeline.
    pub fn new(workgroup: WorkgroupSize) -> Result<Self> {
        let ctx = DeviceContext::new(workgroup)?;
        let kernels = KernelTable::new(&ctx)?;
        Ok(GpuBackend {
            buffers: BufferSet::new(),
            in_flight: HashMap::new(),
            completed: HashSet::new(),
            next_signal: 0,
            kernels,
            ctx,
        })
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    fn mint(&mut self) -> Signal {
        let s = Signal(self.next_signal);
        self.next_signal += 1;
        s
    }

    fn wait_one(&mut self, signal: Signal) -> Result<()> {
        if self.completed.contains(&signal) {
            return Ok(());
        }
        let index = self
            .in_flight
            .remove(&signal)
            .ok_or(SegmentError::UnknownSignal(signal))?;
        self.ctx.device.poll(wgpu::Maintain::WaitForSubmissionIndex(index));
        self.completed.insert(signal);
        trace!(%signal, "gpu signal complete");
        Ok(())
    }

    fn check_signal(&self, signal: Signal) -> Result<()> {
        if self.completed.contains(&signal) || self.in_flight.contains_key(&signal) {
            Ok(())
        } else {
            Err(SegmentError::UnknownSignal(signal))
        }
    }

    fn check_geometry(&self, desc: &LaunchDescriptor) -> Result<(u32, u32)> {
        let limits = &self.ctx.limits;
        let total = desc.local.x.saturating_mul(desc.local.y);
        if total > limits.max_compute_invocations_per_workgroup {
            return Err(SegmentError::WorkgroupTooLarge {
                total,
                max: limits.max_compute_invocations_per_workgroup,
            });
        }
        let (gx, gy) = desc.global.groups(desc.local);
        let max = limits.max_compute_workgroups_per_dimension;
        if gx > max || gy > max {
            return Err(SegmentError::dispatch(
                desc.kernel.entry_point(),
                format!("{gx}×{gy} workgroups exceeds the per-dimension limit {max}"),
            ));
        }
        Ok((gx, gy))
    }
}

impl ComputeBackend for GpuBackend {
    fn describe(&self) -> String {
        self.ctx.to_string()
    }

    fn workgroup_size(&self) -> WorkgroupSize {
        self.ctx.workgroup
    }

    fn allocate(&mut self, spec: BufferSpec) -> Result<BufferId> {
        let fail = |reason: String| SegmentError::Allocation {
            label: spec.label.to_string(),
            size: spec.size,
            reason,
        };
        if spec.size == 0 || spec.size % 4 != 0 {
            return Err(fail("size must be a non-zero multiple of 4".into()));
        }
        let max = self.ctx.max_binding_size();
        if spec.size > max {
            return Err(fail(format!("exceeds the device binding limit of {max} bytes")));
        }

        let device = &self.ctx.device;
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(spec.label),
            size: spec.size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        if let Some(e) = pollster::block_on(device.pop_error_scope()) {
            return Err(fail(e.to_string()));
        }
        debug!(label = spec.label, size = spec.size, "gpu buffer allocated");
        Ok(self.buffers.insert(spec, buffer))
    }

    fn upload(&mut self, buffer: BufferId, bytes: &[u8]) -> Result<Signal> {
        self.buffers.check_upload(buffer, bytes.len())?;
        if bytes.len() % 4 != 0 {
            let label = self.buffers.spec(buffer)?.label.to_string();
            return Err(SegmentError::Transfer {
                label,
                reason: format!("{} bytes is not a multiple of 4", bytes.len()),
            });
        }
        let target = self.buffers.get(buffer)?;
        self.ctx.queue.write_buffer(target, 0, bytes);
        // write_buffer is staged until the next submit; flush and block so
        // the caller may reuse `bytes` and the copy counts as complete.
        let index = self.ctx.queue.submit(std::iter::empty());
        self.ctx.device.poll(wgpu::Maintain::WaitForSubmissionIndex(index));
        let signal = self.mint();
        self.completed.insert(signal);
        Ok(signal)
    }

    fn launch(&mut self, desc: &LaunchDescriptor) -> Result<Signal> {
        desc.validate(self.ctx.workgroup.local_extent(desc.kernel.signature().dims))?;
        let (gx, gy) = self.check_geometry(desc)?;
        for &s in &desc.wait_list {
            self.check_signal(s)?;
        }
        self.wait(&desc.wait_list)?;

        let entry = desc.kernel.entry_point();
        let kernel = self.kernels.get(desc.kernel)?;
        let device = &self.ctx.device;
        let sig = desc.kernel.signature();

        let mut uniforms: Vec<(u32, wgpu::Buffer)> = Vec::new();
        for (slot, arg) in sig.slots.iter().zip(&desc.args) {
            if let Arg::Params(bytes) = arg {
                let buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(entry),
                    contents: bytes,
                    usage: wgpu::BufferUsages::UNIFORM,
                });
                uniforms.push((slot.binding, buf));
            }
        }

        let mut entries = Vec::with_capacity(desc.args.len());
        for (slot, arg) in sig.slots.iter().zip(&desc.args) {
            let resource = match arg {
                Arg::Buffer(id) => self.buffers.get(*id)?.as_entire_binding(),
                Arg::Params(_) => uniforms
                    .iter()
                    .find(|(b, _)| *b == slot.binding)
                    .map(|(_, buf)| buf.as_entire_binding())
                    .ok_or_else(|| SegmentError::dispatch(entry, "parameter block not bound"))?,
            };
            entries.push(wgpu::BindGroupEntry {
                binding: slot.binding,
                resource,
            });
        }

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(entry),
            layout: &kernel.bgl,
            entries: &entries,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(entry) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(entry),
                timestamp_writes: None,
            });
            pass.set_pipeline(&kernel.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(gx, gy, 1);
        }
        let index = self.ctx.queue.submit(std::iter::once(encoder.finish()));
        if let Some(e) = pollster::block_on(device.pop_error_scope()) {
            return Err(SegmentError::dispatch(entry, e.to_string()));
        }

        let signal = self.mint();
        trace!(%signal, kernel = entry, groups_x = gx, groups_y = gy, "gpu launch");
        self.in_flight.insert(signal, index);
        Ok(signal)
    }

    fn wait(&mut self, signals: &[Signal]) -> Result<()> {
        for &s in signals {
            self.wait_one(s)?;
        }
        Ok(())
    }

    fn download(&mut self, buffer: BufferId, wait_list: &[Signal]) -> Result<Vec<u8>> {
        let spec = *self.buffers.check_download(buffer)?;
        self.wait(wait_list)?;

        let fail = |reason: String| SegmentError::Transfer {
            label: spec.label.to_string(),
            reason,
        };
        let device = &self.ctx.device;
        let source = self.buffers.get(buffer)?;
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: spec.size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
        encoder.copy_buffer_to_buffer(source, 0, &staging, 0, spec.size);
        self.ctx.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| fail("map callback never fired".into()))?
            .map_err(|e| fail(e.to_string()))?;

        let bytes = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(bytes)
    }

    fn release(&mut self, buffer: BufferId) {
        if let Some(b) = self.buffers.remove(buffer) {
            b.destroy();
        }
    }
}
