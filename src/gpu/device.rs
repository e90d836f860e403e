// gpu/device.rs — wgpu device context.
//
// Responsibilities:
//   - Enumerate adapters and pick the best one by device type.
//   - Request a device and queue with the adapter's own limits.
//   - Fit the configured workgroup size to those limits.
//   - Compile the segmentation program once, with the full compiler log on
//     failure.
//
// ADAPTER SELECTION
// ─────────────────
// `request_adapter` uses power-preference heuristics that happily return a
// software rasterizer (llvmpipe) on machines that also have a real GPU. We
// enumerate explicitly and rank:
//
//   DiscreteGpu                       0   best
//   IntegratedGpu, VirtualGpu, Other  1
//   Cpu                               2   last resort
//
// Ties keep enumeration order. Backends default to the primary set and can
// be narrowed with `WGPU_BACKEND=vulkan` (or metal, dx12, gl).
//
// WORKGROUP SIZES
// ───────────────
// naga does not accept `override` expressions inside @workgroup_size(), so
// the dimensions are baked into the WGSL source by string replacement of
// {{WG_X}}, {{WG_Y}} and {{WG_1D}} before compilation.
//
// FIELD DROP ORDER
// ────────────────
// Rust drops struct fields top to bottom, so shutdown runs queue, program,
// device. `_instance` is declared last so the instance outlives all three;
// some Vulkan layers crash when the instance is destroyed while device
// objects still exist.

use std::fmt;

use tracing::{debug, info, warn};

use crate::dispatch::WorkgroupSize;
use crate::error::{Result, SegmentError};

/// Source of the single compute program, before workgroup substitution.
const PROGRAM_TEMPLATE: &str = include_str!("../shaders/segment.wgsl");

/// Cached adapter information for logging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl From<wgpu::AdapterInfo> for AdapterInfo {
    fn from(info: wgpu::AdapterInfo) -> Self {
        AdapterInfo {
            name: info.name,
            vendor: info.vendor,
            device: info.device,
            device_type: info.device_type,
            backend: info.backend,
        }
    }
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// Preference rank of a device type; lower is better.
pub fn device_rank(device_type: wgpu::DeviceType) -> u8 {
    match device_type {
        wgpu::DeviceType::DiscreteGpu => 0,
        wgpu::DeviceType::IntegratedGpu | wgpu::DeviceType::VirtualGpu | wgpu::DeviceType::Other => 1,
        wgpu::DeviceType::Cpu => 2,
    }
}

/// Index of the preferred adapter. Ties go to the first enumerated.
pub fn select_adapter(types: &[wgpu::DeviceType]) -> Option<usize> {
    types
        .iter()
        .enumerate()
        .min_by_key(|&(i, &t)| (device_rank(t), i))
        .map(|(i, _)| i)
}

/// Substitute the workgroup size into the program template.
pub fn program_source(workgroup: WorkgroupSize) -> String {
    workgroup
        .template_values()
        .iter()
        .fold(PROGRAM_TEMPLATE.to_string(), |src, (key, value)| src.replace(key, value))
}

/// Device, queue and compiled program for one process.
pub struct DeviceContext {
    pub queue: wgpu::Queue,
    pub program: wgpu::ShaderModule,
    pub device: wgpu::Device,
    pub adapter_info: AdapterInfo,
    pub limits: wgpu::Limits,
    pub workgroup: WorkgroupSize,
    _instance: wgpu::Instance,
}

impl DeviceContext {
    /// Open the preferred adapter and compile the program for `workgroup`
    /// (fitted to the device limits).
    pub fn new(workgroup: WorkgroupSize) -> Result<Self> {
        pollster::block_on(Self::init_async(workgroup))
    }

    async fn init_async(requested: WorkgroupSize) -> Result<Self> {
        let backends = wgpu::util::backend_bits_from_env().unwrap_or(wgpu::Backends::PRIMARY);
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let adapters = instance.enumerate_adapters(backends);
        for a in &adapters {
            let info = a.get_info();
            debug!(name = %info.name, backend = ?info.backend, device_type = ?info.device_type, "adapter");
        }
        let types: Vec<wgpu::DeviceType> = adapters.iter().map(|a| a.get_info().device_type).collect();
        let chosen = select_adapter(&types).ok_or(SegmentError::NoDevice)?;
        let adapter = adapters
            .into_iter()
            .nth(chosen)
            .ok_or(SegmentError::NoDevice)?;
        let adapter_info = AdapterInfo::from(adapter.get_info());
        if adapter_info.device_type == wgpu::DeviceType::Cpu {
            warn!(adapter = %adapter_info, "only a software adapter is available");
        }

        let limits = adapter.limits();
        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("gpu-segment"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(|e| SegmentError::DeviceRequest(e.to_string()))?;

        let (workgroup, fell_back) = requested.fit_within(
            limits.max_compute_invocations_per_workgroup,
            limits.max_compute_workgroup_size_x,
            limits.max_compute_workgroup_size_y,
        );
        if fell_back {
            warn!(%requested, using = %workgroup, "workgroup size exceeds device limits");
        }

        let program = compile_program(&device, &program_source(workgroup)).await?;
        info!(adapter = %adapter_info, %workgroup, "compute device ready");

        Ok(DeviceContext {
            program,
            queue,
            device,
            adapter_info,
            limits,
            workgroup,
            _instance: instance,
        })
    }

    /// Largest buffer the device accepts as a storage binding.
    pub fn max_binding_size(&self) -> u64 {
        (self.limits.max_storage_buffer_binding_size as u64).min(self.limits.max_buffer_size)
    }
}

impl fmt::Display for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, workgroup {}", self.adapter_info, self.workgroup)
    }
}

/// Compile `source`, turning compiler diagnostics into `ProgramBuild`.
async fn compile_program(device: &wgpu::Device, source: &str) -> Result<wgpu::ShaderModule> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("segment.wgsl"),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    let info = module.get_compilation_info().await;
    let scope_error = device.pop_error_scope().await;

    let errors: Vec<String> = info
        .messages
        .iter()
        .filter(|m| m.message_type == wgpu::CompilationMessageType::Error)
        .map(|m| match &m.location {
            Some(loc) => format!("{}:{}: {}", loc.line_number, loc.line_position, m.message),
            None => m.message.clone(),
        })
        .collect();
    if !errors.is_empty() || scope_error.is_some() {
        let mut log = errors.join("\n");
        if let Some(e) = scope_error {
            if !log.is_empty() {
                log.push('\n');
            }
            log.push_str(&e.to_string());
        }
        return Err(SegmentError::ProgramBuild { log });
    }
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgpu::DeviceType;

    #[test]
    fn test_adapter_ranking_prefers_discrete() {
        let types = [DeviceType::Cpu, DeviceType::IntegratedGpu, DeviceType::DiscreteGpu];
        assert_eq!(select_adapter(&types), Some(2));
    }

    #[test]
    fn test_adapter_ranking_ties_keep_enumeration_order() {
        let types = [DeviceType::Cpu, DeviceType::Other, DeviceType::IntegratedGpu];
        assert_eq!(select_adapter(&types), Some(1));
    }

    #[test]
    fn test_software_adapter_is_last_resort() {
        assert_eq!(select_adapter(&[DeviceType::Cpu]), Some(0));
        assert_eq!(select_adapter(&[]), None);
    }

    #[test]
    fn test_program_source_has_no_placeholders() {
        let src = program_source(WorkgroupSize { x: 8, y: 4 });
        assert!(!src.contains("{{"), "unsubstituted placeholder left in program");
        assert!(src.contains("@workgroup_size(8, 4, 1)"));
        assert!(src.contains("@workgroup_size(32, 1, 1)"));
    }

    #[test]
    fn test_program_declares_every_entry_point() {
        let src = program_source(WorkgroupSize::default());
        for kernel in crate::dispatch::Kernel::ALL {
            let decl = format!("fn {}(", kernel.entry_point());
            assert!(src.contains(&decl), "missing entry point {kernel}");
        }
    }

    #[test]
    fn test_program_bindings_match_kernel_table() {
        // Input slots are `read` storage, the others `read_write` or uniform.
        let src = program_source(WorkgroupSize::default());
        for kernel in crate::dispatch::Kernel::ALL {
            for slot in kernel.signature().slots {
                let prefix = format!("@group(0) @binding({}) var<", slot.binding);
                let line = src
                    .lines()
                    .find(|l| l.starts_with(&prefix))
                    .unwrap_or_else(|| panic!("binding {} not declared", slot.binding));
                let expected = match slot.access {
                    crate::dispatch::Access::Input => "var<storage, read>",
                    crate::dispatch::Access::Params => "var<uniform>",
                    _ => "var<storage, read_write>",
                };
                assert!(line.contains(expected), "{kernel} slot {}: {line}", slot.name);
            }
        }
    }
}
