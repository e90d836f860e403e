// gpu/kernels.rs — One compute pipeline per kernel entry point.
//
// The bind group layout of each pipeline is derived from the kernel's
// signature in the dispatch table rather than written out by hand:
//
//   Input                 storage, read_only: true
//   Read, Write, ReadWrite storage, read_only: false
//   Params                uniform
//
// The program declares Read-only slots as `read_write` storage because other
// kernels write the same binding; wgpu requires the layout to match the
// declaration, not the use.

use std::collections::HashMap;

use tracing::debug;

use crate::dispatch::{Access, Kernel};
use crate::error::{Result, SegmentError};
use crate::gpu::device::DeviceContext;

/// Layout entry shape of one slot, independent of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotBinding {
    Storage { read_only: bool },
    Uniform,
}

impl SlotBinding {
    pub fn for_access(access: Access) -> Self {
        match access {
            Access::Input => SlotBinding::Storage { read_only: true },
            Access::Read | Access::Write | Access::ReadWrite => SlotBinding::Storage { read_only: false },
            Access::Params => SlotBinding::Uniform,
        }
    }

    fn buffer_binding_type(self) -> wgpu::BufferBindingType {
        match self {
            SlotBinding::Storage { read_only } => wgpu::BufferBindingType::Storage { read_only },
            SlotBinding::Uniform => wgpu::BufferBindingType::Uniform,
        }
    }
}

/// `(binding, shape)` for every slot of `kernel`, in slot order.
pub fn slot_bindings(kernel: Kernel) -> Vec<(u32, SlotBinding)> {
    kernel
        .signature()
        .slots
        .iter()
        .map(|slot| (slot.binding, SlotBinding::for_access(slot.access)))
        .collect()
}

fn layout_entries(kernel: Kernel) -> Vec<wgpu::BindGroupLayoutEntry> {
    slot_bindings(kernel)
        .into_iter()
        .map(|(binding, shape)| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: shape.buffer_binding_type(),
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        })
        .collect()
}

pub struct KernelPipeline {
    pub pipeline: wgpu::ComputePipeline,
    pub bgl: wgpu::BindGroupLayout,
}

/// Pipelines for every kernel, built once per device.
pub struct KernelTable {
    pipelines: HashMap<Kernel, KernelPipeline>,
}

impl KernelTable {
    pub fn new(ctx: &DeviceContext) -> Result<Self> {
        let device = &ctx.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let mut pipelines = HashMap::with_capacity(Kernel::ALL.len());
        for kernel in Kernel::ALL {
            let entry = kernel.entry_point();
            let bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(entry),
                entries: &layout_entries(kernel),
            });
            let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(entry),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });
            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: Some(&layout),
                module: &ctx.program,
                entry_point: entry,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });
            debug!(kernel = entry, "pipeline created");
            pipelines.insert(kernel, KernelPipeline { pipeline, bgl });
        }

        if let Some(e) = pollster::block_on(device.pop_error_scope()) {
            return Err(SegmentError::ProgramBuild { log: e.to_string() });
        }
        Ok(KernelTable { pipelines })
    }

    pub fn get(&self, kernel: Kernel) -> Result<&KernelPipeline> {
        self.pipelines
            .get(&kernel)
            .ok_or_else(|| SegmentError::dispatch(kernel.entry_point(), "pipeline not built"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_slots_are_read_only_storage() {
        let b = slot_bindings(Kernel::EdgeX);
        assert_eq!(
            b,
            vec![
                (0, SlotBinding::Storage { read_only: true }),
                (1, SlotBinding::Storage { read_only: false }),
                (4, SlotBinding::Uniform),
            ]
        );
    }

    #[test]
    fn test_tables_are_read_only_and_peaks_are_not() {
        let b = slot_bindings(Kernel::MeanShiftColor);
        assert_eq!(b[0], (22, SlotBinding::Storage { read_only: false }));
        assert_eq!(b[1], (23, SlotBinding::Storage { read_only: true }));
        assert_eq!(b[2], (24, SlotBinding::Storage { read_only: true }));
        assert_eq!(b[4], (26, SlotBinding::Uniform));
    }

    #[test]
    fn test_binding_shape_is_consistent_across_kernels() {
        // A binding shared by several kernels must have one shape, since the
        // program declares it once.
        let mut shapes: HashMap<u32, SlotBinding> = HashMap::new();
        for kernel in Kernel::ALL {
            for (binding, shape) in slot_bindings(kernel) {
                let prev = *shapes.entry(binding).or_insert(shape);
                assert_eq!(prev, shape, "binding {binding} differs in {kernel}");
            }
        }
    }
}
