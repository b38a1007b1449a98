//! The backend vtable: `{bake, free_baked, dispatch,
//! shutdown, on_map}`. A backend owns whatever execution resources it
//! needs (a thread pool, per-worker scratch, a device context); the core
//! only ever calls through this trait, so a GPU backend is a drop-in
//! replacement for [`CpuBackend`] without touching `program`/`state`.

use std::any::Any;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::{ErrorCode, Result, SfError};
use crate::exec::builtins::{self, BuiltinId};
use crate::exec::dispatch::{self, RegisterBinding, DEFAULT_CHUNK};
use crate::kernel::{self, Kernel};
use crate::memory::Arena;
use crate::opcodes::{self, DispatchStrategy};
use crate::pool::{ThreadPool, ThreadPoolConfig};
use crate::program::{Instruction, Program, Task};
use crate::state::RegisterFile;
use crate::tensor::Tensor;
use crate::types::DType;
use std::collections::HashMap;

/// Synchronisation point a host gives a backend around a tensor access —
/// a GPU backend uses this to flush/invalidate device copies; the CPU
/// backend has nothing to do here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

/// Prepared, backend-opaque execution plan produced by [`Backend::bake`]
/// and stashed on [`RegisterFile`] via `set_baked`.
pub trait Backend: Send + Sync {
    /// Validates `program` against this backend's kernel set and returns
    /// an opaque baked plan. Called once per program load.
    fn bake(&self, program: &Program) -> Result<Box<dyn Any + Send + Sync>>;

    /// Releases a baked plan. The CPU backend has nothing to tear down
    /// beyond the `Box`'s own `Drop`; a GPU backend would free device
    /// buffers here.
    fn free_baked(&self, baked: Box<dyn Any + Send + Sync>) {
        drop(baked);
    }

    /// Runs one task's instructions over `domain`'s element count,
    /// dispatched under the task's declared strategy.
    fn dispatch(&self, program: &Program, state: &mut RegisterFile, domain: &Tensor, task: &Task) -> Result<()>;

    /// Releases resources the backend holds outside of any one program
    /// (its thread pool, persistent scratch).
    fn shutdown(&self);

    /// Hook fired when a tensor crosses a host/device boundary. A no-op
    /// for the CPU backend.
    fn on_map(&self, _tensor: &Tensor, _mode: AccessMode) {}
}

/// Plan baked by [`CpuBackend::bake`]: one scratch arena per worker,
/// reused (and reset between tiles) across every dispatch of the program.
struct CpuBaked {
    arenas: Arc<Vec<Arena>>,
}

/// Reference backend: the persistent [`ThreadPool`] plus the built-in
/// [`kernel::registry`], dispatched through the three strategies in
/// [`crate::exec::dispatch`].
pub struct CpuBackend {
    pool: ThreadPool,
    kernels: HashMap<u16, Box<dyn Kernel>>,
    scratch_bytes_per_worker: usize,
}

impl CpuBackend {
    pub fn new(config: ThreadPoolConfig) -> Self {
        CpuBackend::with_scratch(config, 64 * 1024)
    }

    pub fn with_scratch(config: ThreadPoolConfig, scratch_bytes_per_worker: usize) -> Self {
        let pool = ThreadPool::new(config, |_| ());
        CpuBackend { pool, kernels: kernel::registry(), scratch_bytes_per_worker }
    }

    fn kernel_for(&self, opcode: u16) -> Result<&dyn Kernel> {
        self.kernels.get(&opcode).map(|k| k.as_ref()).ok_or(SfError::InvalidOp(opcode))
    }

    /// Checks a task's bindings against the addressing convention its
    /// strategy's kernels assume, at bake time rather than discovering a
    /// mismatch as an out-of-bounds write mid-dispatch. A REDUCTION task's
    /// accumulator register is addressed by job index, not by the
    /// flattened domain position, so its binding must not be tile-rebased:
    /// `byte_stride` has to be 0 and `BindingFlags::REDUCTION` set.
    fn validate_bindings(&self, program: &Program, task: &Task) -> Result<()> {
        if task.strategy != DispatchStrategy::Reduction {
            return Ok(());
        }
        let Some(dest_reg) = self.scan_dest_register(program, task) else { return Ok(()) };
        let binding = program.bindings[task.binding_range()]
            .iter()
            .find(|b| b.reg_idx as u32 == dest_reg)
            .ok_or_else(|| SfError::Runtime(format!("reduction task has no binding for accumulator register {}", dest_reg)))?;
        if binding.byte_stride != 0 || !binding.is_reduction() {
            return Err(SfError::Runtime(format!(
                "reduction accumulator register {} must bind with BindingFlags::REDUCTION and byte_stride 0 (job-indexed, not tile-rebased), got stride {}",
                dest_reg, binding.byte_stride
            )));
        }
        Ok(())
    }

    fn resolve_bindings(&self, program: &Program, state: &RegisterFile, task: &Task) -> Result<Vec<RegisterBinding>> {
        let mut out = Vec::with_capacity(task.binding_count as usize);
        for binding in &program.bindings[task.binding_range()] {
            let tensor = state
                .get(binding.reg_idx as u32)
                .ok_or_else(|| SfError::Runtime(format!("task references unbound register {}", binding.reg_idx)))?;
            let ptr = tensor
                .data_ptr()
                .ok_or_else(|| SfError::Runtime(format!("register {} has no backing storage", binding.reg_idx)))?;
            let symbol = program.symbols.iter().find(|s| s.register_idx == binding.reg_idx as u32);
            let builtin_id = symbol.map(|s| builtins::builtin_from_tag(s.builtin_id)).unwrap_or(BuiltinId::None);
            let builtin_axis = symbol.map(|s| s.builtin_axis).unwrap_or(0);
            out.push(RegisterBinding {
                reg_idx: binding.reg_idx,
                ptr,
                byte_stride: binding.byte_stride,
                info: *tensor.info(),
                builtin_id,
                builtin_axis,
            });
        }
        Ok(out)
    }

}

impl Backend for CpuBackend {
    fn bake(&self, program: &Program) -> Result<Box<dyn Any + Send + Sync>> {
        for inst in &program.instructions {
            opcodes::metadata(inst.opcode).ok_or(SfError::InvalidOp(inst.opcode))?;
            self.kernel_for(inst.opcode)?;
        }
        for task in &program.tasks {
            self.validate_bindings(program, task)?;
        }
        let arenas = Arc::new(
            (0..self.pool.thread_count().max(1))
                .map(|_| Arena::new(self.scratch_bytes_per_worker))
                .collect(),
        );
        Ok(Box::new(CpuBaked { arenas }))
    }

    fn dispatch(&self, program: &Program, state: &mut RegisterFile, domain: &Tensor, task: &Task) -> Result<()> {
        let arenas = state
            .baked::<CpuBaked>()
            .map(|b| b.arenas.clone())
            .ok_or_else(|| SfError::Runtime("dispatch called before bake".into()))?;

        let domain_count = domain.element_count() as u32;
        let bindings = Arc::new(self.resolve_bindings(program, state, task)?);
        let global_error = state.error_atomic();
        let insts: Arc<Vec<Instruction>> = Arc::new(program.instructions[task.instruction_range()].to_vec());

        // Every kernel registered is `'static` (the registry is rebuilt
        // fresh per backend, not borrowed), so this closure owns its own
        // copy of the opcode table rather than borrowing `self`.
        let table = Arc::new(kernel::registry());

        match task.strategy {
            DispatchStrategy::Default => {
                let run_insts = insts.clone();
                let run_table = table.clone();
                dispatch::run_default(
                    &self.pool,
                    arenas,
                    domain_count,
                    bindings,
                    global_error.clone(),
                    Arc::new(move |ctx, start, len| {
                        for inst in run_insts.iter() {
                            if let Some(k) = run_table.get(&inst.opcode) {
                                k.run(ctx, inst, start, len);
                            }
                        }
                    }),
                );
            }
            DispatchStrategy::Reduction => {
                let run_insts = insts.clone();
                let run_table = table.clone();
                dispatch::run_reduction(
                    &self.pool,
                    arenas,
                    domain_count,
                    bindings,
                    global_error.clone(),
                    Arc::new(move |ctx, start, len| {
                        for inst in run_insts.iter() {
                            if let Some(k) = run_table.get(&inst.opcode) {
                                k.run(ctx, inst, start, len);
                            }
                        }
                    }),
                );
                self.merge_reduction(program, state, task, domain_count)?;
            }
            DispatchStrategy::TwoPassSync => {
                let local_insts = insts.clone();
                let local_table = table.clone();
                let local_pass = Arc::new(move |ctx: &mut crate::exec::ExecContext, start, len| {
                    for inst in local_insts.iter() {
                        if let Some(k) = local_table.get(&inst.opcode) {
                            k.run(ctx, inst, start, len);
                        }
                    }
                });

                let apply_insts = insts.clone();
                let apply_table = table.clone();
                let apply_pass = Arc::new(move |ctx: &mut crate::exec::ExecContext, start, len| {
                    for inst in apply_insts.iter() {
                        if let Some(k) = apply_table.get(&inst.opcode) {
                            k.run(ctx, inst, start, len);
                        }
                    }
                });

                let between_program_dest = self.scan_dest_register(program, task);
                let state_ptr: *mut RegisterFile = state;
                let between = move || -> Arc<Vec<f32>> {
                    // SAFETY: the local pass has fully joined (run_chunked
                    // blocks until every job completes) before `between`
                    // runs, and the apply pass hasn't started yet, so no
                    // worker is touching `state` concurrently with this
                    // read.
                    let state = unsafe { &*state_ptr };
                    prefix_offsets(state, between_program_dest, domain_count)
                };

                dispatch::run_two_pass_sync(&self.pool, arenas, domain_count, bindings, global_error.clone(), local_pass, between, apply_pass);
            }
        }

        let err = ErrorCode::from_u8(global_error.load(Ordering::SeqCst) as u8);
        if err != ErrorCode::None {
            return Err(SfError::Runtime(format!("task failed with {:?}", err)));
        }
        Ok(())
    }

    fn shutdown(&self) {}
}

impl CpuBackend {
    /// Merges a REDUCTION task's per-job partials (written one `f32` per
    /// job into the task's reduction-flagged register) into a single
    /// scalar at element 0 of the same register. Runs single-threaded,
    /// strictly after `run_reduction`'s barrier.
    fn merge_reduction(&self, program: &Program, state: &mut RegisterFile, task: &Task, domain_count: u32) -> Result<()> {
        let job_count = job_count_for(domain_count);
        let reg_idx = self.scan_dest_register(program, task);
        let Some(reg_idx) = reg_idx else { return Ok(()) };
        let tensor = state
            .get_mut(reg_idx)
            .ok_or_else(|| SfError::Runtime(format!("reduction register {} missing", reg_idx)))?;
        let Some(ptr) = tensor.data_ptr() else { return Ok(()) };
        let stride = DType::F32.size_bytes() as isize;
        let mut total = 0f32;
        for job in 0..job_count {
            total += unsafe { std::ptr::read_unaligned(ptr.as_ptr().offset(job as isize * stride) as *const f32) };
        }
        unsafe { std::ptr::write_unaligned(ptr.as_ptr() as *mut f32, total) };
        Ok(())
    }

    /// The instruction `dest_idx` a task's own instructions write to,
    /// taken from the task's last instruction — the reduction/scan
    /// accumulator register for single-instruction reduction/scan tasks,
    /// which is the only shape this backend's demonstration kernels emit.
    fn scan_dest_register(&self, program: &Program, task: &Task) -> Option<u32> {
        program.instructions[task.instruction_range()].last().map(|inst| inst.dest_idx as u32)
    }
}

fn job_count_for(domain_count: u32) -> u32 {
    if domain_count == 0 {
        0
    } else {
        (domain_count + DEFAULT_CHUNK - 1) / DEFAULT_CHUNK
    }
}

/// Builds the exclusive prefix-sum offsets a two-pass scan's apply pass
/// adds back into every tile: `offsets[j]` is the sum of every tile's
/// local total strictly before tile `j`, where a tile's local total is
/// the last element the local pass wrote into it (the scan kernel's own
/// running sum already holds this at `tile_start + tile_len - 1`).
fn prefix_offsets(state: &RegisterFile, dest_reg: Option<u32>, domain_count: u32) -> Arc<Vec<f32>> {
    let job_count = job_count_for(domain_count) as usize;
    let mut offsets = vec![0f32; job_count.max(1)];
    let Some(reg_idx) = dest_reg else { return Arc::new(offsets) };
    let Some(tensor) = state.get(reg_idx) else { return Arc::new(offsets) };
    let Some(ptr) = tensor.data_ptr() else { return Arc::new(offsets) };
    let stride = DType::F32.size_bytes() as isize;
    let mut running = 0f32;
    for job in 0..job_count {
        offsets[job] = running;
        let tile_start = job as u32 * DEFAULT_CHUNK;
        let tile_len = DEFAULT_CHUNK.min(domain_count - tile_start);
        if tile_len == 0 {
            continue;
        }
        let last_idx = tile_start + tile_len - 1;
        let local_total = unsafe { std::ptr::read_unaligned(ptr.as_ptr().offset(last_idx as isize * stride) as *const f32) };
        running += local_total;
    }
    Arc::new(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Allocator, Heap};
    use crate::opcodes::Opcode;
    use crate::program::{Binding, BindingFlags, Program, Symbol, SymbolFlags, TensorDesc, TensorFlags};
    use crate::shape::TypeInfo;
    use crate::types::SF_MAX_DIMS;

    fn shape_of(n: i32) -> [i32; SF_MAX_DIMS] {
        let mut s = [0i32; SF_MAX_DIMS];
        s[0] = n;
        s
    }

    fn desc(n: i32) -> TensorDesc {
        TensorDesc { dtype: DType::F32, ndim: 1, is_constant: false, flags: TensorFlags::empty(), shape: shape_of(n), data_size: 0 }
    }

    fn program_for_add(n: i32) -> Program {
        Program {
            instruction_count: 1,
            tensor_count: 3,
            reduction_scratch_size: 0,
            sync_scratch_size: 0,
            instructions: vec![Instruction { opcode: Opcode::Add as u16, dest_idx: 2, src1_idx: 0, src2_idx: 1, src3_idx: 0, src4_idx: 0, line: 1, column: 0 }],
            tensor_descs: vec![desc(n), desc(n), desc(n)],
            tensor_data: vec![Vec::new(), Vec::new(), Vec::new()],
            symbols: vec![
                Symbol { name: "a".into(), provider: String::new(), name_hash: crate::program::symbol::fnv1a_hash("a"), register_idx: 0, related_name_hash: 0, flags: SymbolFlags::INPUT, builtin_id: 0, builtin_axis: 0 },
                Symbol { name: "b".into(), provider: String::new(), name_hash: crate::program::symbol::fnv1a_hash("b"), register_idx: 1, related_name_hash: 0, flags: SymbolFlags::INPUT, builtin_id: 0, builtin_axis: 0 },
                Symbol { name: "out".into(), provider: String::new(), name_hash: crate::program::symbol::fnv1a_hash("out"), register_idx: 2, related_name_hash: 0, flags: SymbolFlags::OUTPUT, builtin_id: 0, builtin_axis: 0 },
            ],
            tasks: vec![Task { start_inst: 0, inst_count: 1, domain_reg: 0, strategy: DispatchStrategy::Default, binding_offset: 0, binding_count: 3 }],
            bindings: vec![
                Binding { reg_idx: 0, flags: BindingFlags::empty(), byte_stride: DType::F32.size_bytes() as i32 },
                Binding { reg_idx: 1, flags: BindingFlags::empty(), byte_stride: DType::F32.size_bytes() as i32 },
                Binding { reg_idx: 2, flags: BindingFlags::empty(), byte_stride: DType::F32.size_bytes() as i32 },
            ],
        }
    }

    #[test]
    fn bakes_and_dispatches_default_add_task() {
        let allocator: Arc<dyn Allocator> = Arc::new(Heap::new(1 << 20));
        let program = program_for_add(8);
        let mut state = RegisterFile::from_program(&program, allocator.clone()).unwrap();

        if let Some(t) = state.get_mut(0) {
            if let Some(p) = t.data_ptr() {
                for i in 0..8i32 {
                    unsafe { std::ptr::write_unaligned((p.as_ptr() as *mut f32).add(i as usize), i as f32) };
                }
            }
        }
        if let Some(t) = state.get_mut(1) {
            if let Some(p) = t.data_ptr() {
                for i in 0..8i32 {
                    unsafe { std::ptr::write_unaligned((p.as_ptr() as *mut f32).add(i as usize), 100.0) };
                }
            }
        }

        let backend = CpuBackend::new(ThreadPoolConfig { num_threads: Some(2), ..Default::default() });
        let baked = backend.bake(&program).unwrap();
        state.set_baked(baked);

        let domain = Tensor::alloc(allocator, TypeInfo::contiguous(DType::F32, &[8])).unwrap();
        backend.dispatch(&program, &mut state, &domain, &program.tasks[0]).unwrap();

        let out = state.get(2).unwrap();
        let p = out.data_ptr().unwrap();
        for i in 0..8i32 {
            let v = unsafe { std::ptr::read_unaligned((p.as_ptr() as *const f32).add(i as usize)) };
            assert_eq!(v, i as f32 + 100.0);
        }
    }

    #[test]
    fn bake_rejects_unknown_opcode() {
        let mut program = program_for_add(4);
        program.instructions[0].opcode = 999;
        let backend = CpuBackend::new(ThreadPoolConfig { num_threads: Some(1), ..Default::default() });
        assert!(backend.bake(&program).is_err());
    }
}
