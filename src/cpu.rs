// cpu.rs — Reference compute device running the CPU kernels.
//
// DEFERRED EXECUTION
// ──────────────────
// `launch` validates the descriptor and queues it; nothing runs yet. A
// queued launch executes only when something needs its signal: a `wait`, a
// `download`, or another launch being executed that lists it in its wait
// list. Execution therefore follows the wait lists and never submission
// order. If the orchestrator forgets a dependency, the dependent kernel
// reads whatever the buffer held before, and the tests see a wrong image.
//
// HAZARDS
// ───────
// The host may not upload into or read back a buffer that a queued launch
// still references; both are rejected with `SegmentError::Hazard`.
//
// Buffers are stored as `Vec<u32>` so f32 and u32 views are aligned.

use std::collections::{BTreeMap, HashSet};

use bytemuck::Pod;
use tracing::trace;

use crate::backend::ComputeBackend;
use crate::buffers::{BufferId, BufferSet, BufferSpec};
use crate::dispatch::{Kernel, LaunchDescriptor, Signal, WorkgroupSize};
use crate::error::{Result, SegmentError};
use crate::gradient::{self, EdgeParams};
use crate::kmeans::{self, KmeansParams};
use crate::meanshift::{self, MeanShiftParams};

pub struct CpuBackend {
    buffers: BufferSet<Vec<u32>>,
    workgroup: WorkgroupSize,
    next_signal: u64,
    pending: BTreeMap<Signal, LaunchDescriptor>,
    completed: HashSet<Signal>,
    /// Executed launches, in execution order.
    executed: Vec<(Signal, Kernel)>,
}

impl CpuBackend {
    pub fn new(workgroup: WorkgroupSize) -> Self {
        CpuBackend {
            buffers: BufferSet::new(),
            workgroup,
            next_signal: 0,
            pending: BTreeMap::new(),
            completed: HashSet::new(),
            executed: Vec::new(),
        }
    }

    /// Launches that have run so far, in the order they ran.
    pub fn executed(&self) -> &[(Signal, Kernel)] {
        &self.executed
    }

    /// Launches still queued.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Live buffer count.
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    fn mint(&mut self) -> Signal {
        let s = Signal(self.next_signal);
        self.next_signal += 1;
        s
    }

    fn check_signal(&self, signal: Signal) -> Result<()> {
        if self.completed.contains(&signal) || self.pending.contains_key(&signal) {
            Ok(())
        } else {
            Err(SegmentError::UnknownSignal(signal))
        }
    }

    fn check_no_pending_use(&self, buffer: BufferId) -> Result<()> {
        let in_use = self
            .pending
            .values()
            .any(|desc| desc.reads().contains(&buffer) || desc.writes().contains(&buffer));
        if in_use {
            let label = self.buffers.spec(buffer)?.label.to_string();
            return Err(SegmentError::Hazard { label });
        }
        Ok(())
    }

    /// Run `signal`'s launch after its wait list, if it has not run yet.
    fn resolve(&mut self, signal: Signal) -> Result<()> {
        if self.completed.contains(&signal) {
            return Ok(());
        }
        let desc = self
            .pending
            .remove(&signal)
            .ok_or(SegmentError::UnknownSignal(signal))?;
        for &dep in &desc.wait_list {
            self.resolve(dep)?;
        }
        trace!(%signal, kernel = %desc.kernel, "cpu execute");
        self.run(&desc)?;
        self.completed.insert(signal);
        self.executed.push((signal, desc.kernel));
        Ok(())
    }

    /// Execute one kernel. Written buffers are moved out of the set for the
    /// duration so the read buffers can be borrowed alongside them.
    fn run(&mut self, desc: &LaunchDescriptor) -> Result<()> {
        let mut outputs: Vec<(BufferId, Vec<u32>)> = Vec::new();
        let mut result = Ok(());
        for id in desc.writes() {
            match self.buffers.take(id) {
                Ok(words) => outputs.push((id, words)),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        if result.is_ok() {
            result = self.execute(desc, &mut outputs);
        }
        for (id, words) in outputs {
            self.buffers.restore(id, words)?;
        }
        result
    }

    fn input(&self, desc: &LaunchDescriptor, binding: u32) -> Result<&[u32]> {
        let id = desc.buffer_at(binding).ok_or_else(|| {
            SegmentError::dispatch(desc.kernel.entry_point(), format!("binding {binding} not bound"))
        })?;
        self.buffers.get(id).map(Vec::as_slice)
    }

    fn execute(&self, desc: &LaunchDescriptor, out: &mut [(BufferId, Vec<u32>)]) -> Result<()> {
        let out = out[0].1.as_mut_slice();
        match desc.kernel {
            Kernel::EdgeX => {
                let p: EdgeParams = params(desc)?;
                gradient::edge_x(self.input(desc, 0)?, bytemuck::cast_slice_mut(out), &p);
            }
            Kernel::EdgeY => {
                let p: EdgeParams = params(desc)?;
                gradient::edge_y(self.input(desc, 0)?, bytemuck::cast_slice_mut(out), &p);
            }
            Kernel::EdgeResult => {
                let p: EdgeParams = params(desc)?;
                let gx: &[f32] = bytemuck::cast_slice(self.input(desc, 1)?);
                let gy: &[f32] = bytemuck::cast_slice(self.input(desc, 2)?);
                gradient::edge_result(gx, gy, out, &p);
            }
            Kernel::KmeansAssign => {
                let p: KmeansParams = params(desc)?;
                kmeans::assign(self.input(desc, 10)?, self.input(desc, 11)?, out, &p);
            }
            Kernel::KmeansRecompute => {
                let p: KmeansParams = params(desc)?;
                kmeans::recompute(self.input(desc, 10)?, self.input(desc, 12)?, out, &p);
            }
            Kernel::KmeansColor => {
                let p: KmeansParams = params(desc)?;
                kmeans::paint(self.input(desc, 11)?, self.input(desc, 12)?, out, &p);
            }
            Kernel::MeanShiftSeed => {
                let p: MeanShiftParams = params(desc)?;
                meanshift::seed(self.input(desc, 20)?, bytemuck::cast_slice_mut(out), &p);
            }
            Kernel::MeanShiftOptimize => {
                let p: MeanShiftParams = params(desc)?;
                let positions: &[f32] = bytemuck::cast_slice(self.input(desc, 21)?);
                meanshift::optimize(self.input(desc, 20)?, positions, out, &p);
            }
            Kernel::MeanShiftColor => {
                let p: MeanShiftParams = params(desc)?;
                meanshift::paint(
                    self.input(desc, 22)?,
                    self.input(desc, 23)?,
                    self.input(desc, 24)?,
                    out,
                    &p,
                );
            }
        }
        Ok(())
    }
}

fn params<T: Pod>(desc: &LaunchDescriptor) -> Result<T> {
    desc.params_bytes()
        .map(bytemuck::pod_read_unaligned)
        .ok_or_else(|| SegmentError::dispatch(desc.kernel.entry_point(), "parameter block not bound"))
}

impl ComputeBackend for CpuBackend {
    fn describe(&self) -> String {
        format!("CPU reference device (workgroup {})", self.workgroup)
    }

    fn workgroup_size(&self) -> WorkgroupSize {
        self.workgroup
    }

    fn allocate(&mut self, spec: BufferSpec) -> Result<BufferId> {
        if spec.size == 0 || spec.size % 4 != 0 {
            return Err(SegmentError::Allocation {
                label: spec.label.to_string(),
                size: spec.size,
                reason: "size must be a non-zero multiple of 4".into(),
            });
        }
        let words = vec![0u32; (spec.size / 4) as usize];
        Ok(self.buffers.insert(spec, words))
    }

    fn upload(&mut self, buffer: BufferId, bytes: &[u8]) -> Result<Signal> {
        self.buffers.check_upload(buffer, bytes.len())?;
        self.check_no_pending_use(buffer)?;
        let words = self.buffers.get_mut(buffer)?;
        bytemuck::cast_slice_mut::<u32, u8>(words)[..bytes.len()].copy_from_slice(bytes);
        let signal = self.mint();
        self.completed.insert(signal);
        Ok(signal)
    }

    fn launch(&mut self, desc: &LaunchDescriptor) -> Result<Signal> {
        desc.validate(self.workgroup.local_extent(desc.kernel.signature().dims))?;
        for id in desc.reads().into_iter().chain(desc.writes()) {
            self.buffers.spec(id)?;
        }
        for &s in &desc.wait_list {
            self.check_signal(s)?;
        }
        let signal = self.mint();
        self.pending.insert(signal, desc.clone());
        Ok(signal)
    }

    fn wait(&mut self, signals: &[Signal]) -> Result<()> {
        for &s in signals {
            self.resolve(s)?;
        }
        Ok(())
    }

    fn download(&mut self, buffer: BufferId, wait_list: &[Signal]) -> Result<Vec<u8>> {
        let size = self.buffers.check_download(buffer)?.size as usize;
        self.wait(wait_list)?;
        self.check_no_pending_use(buffer)?;
        let words = self.buffers.get(buffer)?;
        Ok(bytemuck::cast_slice::<u32, u8>(words)[..size].to_vec())
    }

    fn release(&mut self, buffer: BufferId) {
        self.buffers.remove(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BufferKind;
    use crate::dispatch::{Arg, Extent};
    use crate::image::pack_rgba;

    fn edge_launch(
        cpu: &CpuBackend,
        kernel: Kernel,
        buffers: &[BufferId],
        wait_list: Vec<Signal>,
    ) -> LaunchDescriptor {
        let mut args: Vec<Arg> = buffers.iter().map(|&b| Arg::Buffer(b)).collect();
        args.push(Arg::params(&EdgeParams::new(4, 4)));
        let local = cpu.workgroup_size().local_extent(kernel.signature().dims);
        LaunchDescriptor {
            kernel,
            args,
            global: Extent::covering(Extent::new(4, 4), local),
            local,
            wait_list,
        }
    }

    fn setup() -> (CpuBackend, [BufferId; 4]) {
        let mut cpu = CpuBackend::new(WorkgroupSize::default());
        let input = cpu.allocate(BufferSpec::new("input", BufferKind::Input, 64)).unwrap();
        let gx = cpu.allocate(BufferSpec::new("grad_x", BufferKind::Scratch, 64)).unwrap();
        let gy = cpu.allocate(BufferSpec::new("grad_y", BufferKind::Scratch, 64)).unwrap();
        let out = cpu.allocate(BufferSpec::new("output", BufferKind::Output, 64)).unwrap();
        let mut pixels = Vec::new();
        for _ in 0..4 {
            for x in 0..4u8 {
                pixels.extend_from_slice(&[x * 60, x * 60, x * 60, 255]);
            }
        }
        cpu.upload(input, &pixels).unwrap();
        (cpu, [input, gx, gy, out])
    }

    #[test]
    fn test_launches_are_deferred_until_needed() {
        let (mut cpu, [input, gx, gy, out]) = setup();
        let sx = cpu.launch(&edge_launch(&cpu, Kernel::EdgeX, &[input, gx], vec![])).unwrap();
        let sy = cpu.launch(&edge_launch(&cpu, Kernel::EdgeY, &[input, gy], vec![])).unwrap();
        let sr = cpu
            .launch(&edge_launch(&cpu, Kernel::EdgeResult, &[gx, gy, out], vec![sy, sx]))
            .unwrap();
        assert!(cpu.executed().is_empty());
        assert_eq!(cpu.pending(), 3);

        let bytes = cpu.download(out, &[sr]).unwrap();
        let order: Vec<Kernel> = cpu.executed().iter().map(|&(_, k)| k).collect();
        assert_eq!(order, vec![Kernel::EdgeY, Kernel::EdgeX, Kernel::EdgeResult]);
        // Horizontal ramp of 60 per pixel: interior gx = 2 * 60 * 4 = 480 → 255.
        assert_eq!(bytes[4..8], [255, 255, 255, 255]);
    }

    #[test]
    fn test_missing_dependency_leaves_stale_data() {
        let (mut cpu, [input, gx, gy, out]) = setup();
        cpu.launch(&edge_launch(&cpu, Kernel::EdgeX, &[input, gx], vec![])).unwrap();
        let sy = cpu.launch(&edge_launch(&cpu, Kernel::EdgeY, &[input, gy], vec![])).unwrap();
        let sr = cpu
            .launch(&edge_launch(&cpu, Kernel::EdgeResult, &[gx, gy, out], vec![sy]))
            .unwrap();
        cpu.wait(&[sr]).unwrap();
        assert_eq!(cpu.pending(), 1, "edge_x was never required");

        // grad_x still holds zeros, so the ramp edge vanished.
        let bytes = cpu.download(out, &[]).unwrap();
        assert_eq!(bytes[4..8], [0, 0, 0, 255]);
    }

    #[test]
    fn test_upload_into_buffer_of_queued_launch_is_hazard() {
        let (mut cpu, [input, gx, ..]) = setup();
        cpu.launch(&edge_launch(&cpu, Kernel::EdgeX, &[input, gx], vec![])).unwrap();
        let err = cpu.upload(input, &[0; 64]).unwrap_err();
        assert!(matches!(err, SegmentError::Hazard { ref label } if label == "input"));
    }

    #[test]
    fn test_unknown_wait_signal_rejected() {
        let (mut cpu, [input, gx, ..]) = setup();
        let desc = edge_launch(&cpu, Kernel::EdgeX, &[input, gx], vec![Signal(99)]);
        assert!(matches!(cpu.launch(&desc), Err(SegmentError::UnknownSignal(_))));
    }

    #[test]
    fn test_allocation_rules() {
        let mut cpu = CpuBackend::new(WorkgroupSize::default());
        let err = cpu.allocate(BufferSpec::new("empty", BufferKind::Scratch, 0)).unwrap_err();
        assert!(matches!(err, SegmentError::Allocation { .. }));
        let id = cpu.allocate(BufferSpec::new("ok", BufferKind::Scratch, 8)).unwrap();
        cpu.upload(id, bytemuck::cast_slice(&[pack_rgba([1, 2, 3, 4]), 5])).unwrap();
        assert_eq!(cpu.download(id, &[]).unwrap(), vec![1, 2, 3, 4, 5, 0, 0, 0]);
        cpu.release(id);
        assert_eq!(cpu.live_buffers(), 0);
    }
}
