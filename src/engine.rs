//! The runtime's top-level, concept-level API: create a [`RegisterFile`]
//! from a [`Program`], bind external
//! views onto aliased registers, run every task through a [`Backend`] in
//! program order, and read results back out without copying.

use std::sync::Arc;

use crate::backend::Backend;
use crate::error::ErrorCode;
use crate::memory::Allocator;
use crate::program::Program;
use crate::state::RegisterFile;
use crate::tensor::Tensor;

/// Allocates every register's backing storage and installs constant
/// payloads (`state_create`).
pub fn state_create(program: &Program, allocator: Arc<dyn Allocator>) -> crate::error::Result<RegisterFile> {
    RegisterFile::from_program(program, allocator)
}

/// Binds an externally-owned tensor to the register whose symbol hashes
/// to `name_hash` (`state_bind`). Returns `false` if no symbol resolves
/// to a register, leaving `state` untouched.
pub fn state_bind(state: &mut RegisterFile, name_hash: u32, tensor: Tensor) -> bool {
    match state.lookup(name_hash) {
        Some(reg_idx) => {
            state.bind(reg_idx, tensor);
            true
        }
        None => false,
    }
}

/// Executes every task in `program.tasks`, in order, through `backend`.
/// Stops as soon as the kill switch is observed set (either raised by a
/// worker mid-task or by this task's own dispatch failing) and returns
/// that error code, or `ErrorCode::None` once every task has completed.
///
/// Each task resolves its own iteration domain from `state` via
/// `task.domain_reg`; `domain` is the fallback used when a task's domain
/// register isn't resolvable (e.g. it aliases a host view not yet bound),
/// matching the common case of one shared domain across an entire
/// program while still honoring the per-task `domain_reg` the wire format
/// carries (an Open Question resolved in favor of the more general
/// per-task form — see DESIGN.md).
pub fn engine_run(state: &mut RegisterFile, program: &Program, backend: &dyn Backend, domain: &Tensor) -> ErrorCode {
    for task in &program.tasks {
        if state.error() != ErrorCode::None {
            break;
        }
        let task_domain = state.get(task.domain_reg).unwrap_or(domain);
        if let Err(err) = backend.dispatch(program, state, task_domain, task) {
            state.raise_error(err.code());
            break;
        }
    }
    state.error()
}

/// Reads back an output register as a zero-copy tensor view
/// (`engine_read`).
pub fn engine_read(state: &RegisterFile, name_hash: u32) -> Option<Tensor> {
    let reg_idx = state.lookup(name_hash)?;
    Some(state.get(reg_idx)?.view())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use crate::memory::Heap;
    use crate::opcodes::Opcode;
    use crate::pool::ThreadPoolConfig;
    use crate::program::symbol::fnv1a_hash;
    use crate::program::{Binding, BindingFlags, Instruction, SymbolFlags, Task};
    use crate::program::{Symbol, TensorDesc, TensorFlags};
    use crate::shape::TypeInfo;
    use crate::types::{DType, SF_MAX_DIMS};

    fn shape_of(n: i32) -> [i32; SF_MAX_DIMS] {
        let mut s = [0i32; SF_MAX_DIMS];
        s[0] = n;
        s
    }

    fn simple_copy_program(n: i32) -> Program {
        let desc = |n| TensorDesc { dtype: DType::F32, ndim: 1, is_constant: false, flags: TensorFlags::empty(), shape: shape_of(n), data_size: 0 };
        Program {
            instruction_count: 1,
            tensor_count: 2,
            reduction_scratch_size: 0,
            sync_scratch_size: 0,
            instructions: vec![Instruction { opcode: Opcode::Copy as u16, dest_idx: 1, src1_idx: 0, src2_idx: 0, src3_idx: 0, src4_idx: 0, line: 1, column: 0 }],
            tensor_descs: vec![desc(n), desc(n)],
            tensor_data: vec![Vec::new(), Vec::new()],
            symbols: vec![
                Symbol { name: "src".into(), provider: String::new(), name_hash: fnv1a_hash("src"), register_idx: 0, related_name_hash: 0, flags: SymbolFlags::INPUT, builtin_id: 0, builtin_axis: 0 },
                Symbol { name: "dst".into(), provider: String::new(), name_hash: fnv1a_hash("dst"), register_idx: 1, related_name_hash: 0, flags: SymbolFlags::OUTPUT, builtin_id: 0, builtin_axis: 0 },
            ],
            tasks: vec![Task { start_inst: 0, inst_count: 1, domain_reg: 0, strategy: crate::opcodes::DispatchStrategy::Default, binding_offset: 0, binding_count: 2 }],
            bindings: vec![
                Binding { reg_idx: 0, flags: BindingFlags::empty(), byte_stride: DType::F32.size_bytes() as i32 },
                Binding { reg_idx: 1, flags: BindingFlags::empty(), byte_stride: DType::F32.size_bytes() as i32 },
            ],
        }
    }

    #[test]
    fn full_round_trip_creates_binds_runs_and_reads() {
        let allocator: Arc<dyn Allocator> = Arc::new(Heap::new(1 << 20));
        let program = simple_copy_program(4);
        let mut state = state_create(&program, allocator.clone()).unwrap();

        if let Some(t) = state.get_mut(0) {
            if let Some(p) = t.data_ptr() {
                for i in 0..4i32 {
                    unsafe { std::ptr::write_unaligned((p.as_ptr() as *mut f32).add(i as usize), i as f32 * 2.0) };
                }
            }
        }

        let backend = CpuBackend::new(ThreadPoolConfig { num_threads: Some(2), ..Default::default() });
        let baked = backend.bake(&program).unwrap();
        state.set_baked(baked);

        let domain = Tensor::alloc(allocator, TypeInfo::contiguous(DType::F32, &[4])).unwrap();
        let code = engine_run(&mut state, &program, &backend, &domain);
        assert_eq!(code, ErrorCode::None);

        let out = engine_read(&state, fnv1a_hash("dst")).unwrap();
        let p = out.data_ptr().unwrap();
        for i in 0..4i32 {
            let v = unsafe { std::ptr::read_unaligned((p.as_ptr() as *const f32).add(i as usize)) };
            assert_eq!(v, i as f32 * 2.0);
        }
    }

    #[test]
    fn state_bind_rejects_unknown_name() {
        let allocator: Arc<dyn Allocator> = Arc::new(Heap::new(1 << 16));
        let program = simple_copy_program(2);
        let mut state = state_create(&program, allocator.clone()).unwrap();
        let view = Tensor::alloc(allocator, TypeInfo::contiguous(DType::F32, &[2])).unwrap();
        assert!(!state_bind(&mut state, fnv1a_hash("not_a_symbol"), view));
    }
}
