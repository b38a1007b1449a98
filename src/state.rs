//! Persistent register file: the engine-owned container for every
//! tensor a program touches, plus the global kill-switch error flag
//! every worker checks between tiles.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;

use crate::error::ErrorCode;
use crate::memory::Allocator;
use crate::program::tensor_desc::TensorFlags;
use crate::program::{Program, Symbol};
use crate::tensor::Tensor;

/// Persistent container for every register's tensor, its ownership flag,
/// and the plan a backend baked for fast repeated dispatch.
///
/// `error_code` is the monotone kill switch: the first worker to observe
/// an error CASes it from `None` and every other worker's CAS attempt
/// fails silently: first writer wins.
pub struct RegisterFile {
    registers: Vec<Option<Tensor>>,
    /// `true` if the register's tensor was allocated (and should be
    /// dropped) by this state, as opposed to aliasing a host-provided
    /// resource.
    ownership_flags: Vec<bool>,
    allocator: Arc<dyn Allocator>,
    /// Per-register linear byte strides, pre-resolved for the task
    /// currently bound (`sf_state::task_strides`). Re-populated by
    /// [`RegisterFile::bind_task`] before each task dispatch.
    task_strides: Vec<i32>,
    /// Backend-opaque prepared plan, set by `Backend::bake`.
    baked_data: Option<Box<dyn std::any::Any + Send + Sync>>,
    error_code: Arc<AtomicI32>,
    name_to_register: FxHashMap<u32, u32>,
}

impl RegisterFile {
    /// Allocates (or, for constants, allocates-and-fills) a tensor for
    /// every descriptor in `program`, building the symbol name-hash
    /// lookup table as it goes.
    pub fn from_program(program: &Program, allocator: Arc<dyn Allocator>) -> crate::error::Result<RegisterFile> {
        let mut registers = Vec::with_capacity(program.tensor_descs.len());
        let mut ownership_flags = Vec::with_capacity(program.tensor_descs.len());

        for (idx, desc) in program.tensor_descs.iter().enumerate() {
            // An ALIAS register is bound to an external resource later via
            // `bind`/`state_bind`; allocating it here would just be thrown
            // away the moment the real view lands.
            if desc.flags.contains(TensorFlags::ALIAS) {
                registers.push(None);
                ownership_flags.push(false);
                continue;
            }

            let info = desc.type_info();
            let mut tensor = Tensor::alloc(allocator.clone(), info)
                .ok_or(crate::error::SfError::Oom { requested: info.size_bytes() })?;
            if desc.is_constant {
                let payload = &program.tensor_data[idx];
                if payload.len() != info.size_bytes() {
                    return Err(crate::error::SfError::Load(format!(
                        "register {} constant payload is {} bytes, expected {}",
                        idx,
                        payload.len(),
                        info.size_bytes()
                    )));
                }
                if let Some(dst) = tensor.data_ptr() {
                    unsafe {
                        std::ptr::copy_nonoverlapping(payload.as_ptr(), dst.as_ptr(), payload.len());
                    }
                }
            }
            registers.push(Some(tensor));
            ownership_flags.push(true);
        }

        let mut name_to_register = FxHashMap::default();
        for sym in &program.symbols {
            name_to_register.insert(sym.name_hash, sym.register_idx);
        }

        Ok(RegisterFile {
            registers,
            ownership_flags,
            allocator,
            task_strides: Vec::new(),
            baked_data: None,
            error_code: Arc::new(AtomicI32::new(ErrorCode::None as i32)),
            name_to_register,
        })
    }

    pub fn register_count(&self) -> usize {
        self.registers.len()
    }

    pub fn get(&self, reg_idx: u32) -> Option<&Tensor> {
        self.registers.get(reg_idx as usize).and_then(|t| t.as_ref())
    }

    pub fn get_mut(&mut self, reg_idx: u32) -> Option<&mut Tensor> {
        self.registers.get_mut(reg_idx as usize).and_then(|t| t.as_mut())
    }

    pub fn owns(&self, reg_idx: u32) -> bool {
        self.ownership_flags.get(reg_idx as usize).copied().unwrap_or(false)
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    /// Binds an externally-owned tensor to `reg_idx` as a non-owning view
    /// — the register-level analogue of [`crate::buffer::Buffer::init_view`].
    pub fn bind(&mut self, reg_idx: u32, tensor: Tensor) {
        if reg_idx as usize >= self.registers.len() {
            self.registers.resize(reg_idx as usize + 1, None);
            self.ownership_flags.resize(reg_idx as usize + 1, false);
        }
        self.registers[reg_idx as usize] = Some(tensor);
        self.ownership_flags[reg_idx as usize] = false;
    }

    /// Looks up a register by a symbol's FNV-1a name hash.
    pub fn lookup(&self, name_hash: u32) -> Option<u32> {
        self.name_to_register.get(&name_hash).copied()
    }

    pub fn resolve_symbol<'a>(&self, symbols: &'a [Symbol], name: &str) -> Option<&'a Symbol> {
        let hash = crate::program::symbol::fnv1a_hash(name);
        symbols.iter().find(|s| s.name_hash == hash)
    }

    pub fn set_baked(&mut self, data: Box<dyn std::any::Any + Send + Sync>) {
        self.baked_data = Some(data);
    }

    pub fn baked<T: 'static>(&self) -> Option<&T> {
        self.baked_data.as_ref()?.downcast_ref::<T>()
    }

    pub fn clear_baked(&mut self) {
        self.baked_data = None;
    }

    /// Resolved per-register byte strides for the currently bound task.
    pub fn task_strides(&self) -> &[i32] {
        &self.task_strides
    }

    pub fn set_task_strides(&mut self, strides: Vec<i32>) {
        self.task_strides = strides;
    }

    /// Sets the kill switch to `code` iff it is currently `None`
    /// (first-writer-wins CAS loop). Returns `true` if this call won the
    /// race and actually recorded the error.
    pub fn raise_error(&self, code: ErrorCode) -> bool {
        self.error_code
            .compare_exchange(
                ErrorCode::None as i32,
                code as i32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub fn error(&self) -> ErrorCode {
        ErrorCode::from_u8(self.error_code.load(Ordering::SeqCst) as u8)
    }

    pub fn clear_error(&self) {
        self.error_code.store(ErrorCode::None as i32, Ordering::SeqCst);
    }

    /// A raw pointer to the error flag, handed to [`crate::exec::context::ExecContext`]
    /// instances so every worker checks the same global switch without
    /// holding a reference back into the owning `RegisterFile`.
    pub fn error_ptr(&self) -> *const AtomicI32 {
        &*self.error_code
    }

    /// Clones the shared handle to the kill switch so a backend can move
    /// it into dispatch-layer closures that outlive this call (`'static`
    /// via `Arc<dyn Fn>`) while `raise_error`/`error` keep observing the
    /// same atomic.
    pub fn error_atomic(&self) -> Arc<AtomicI32> {
        self.error_code.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Heap;
    use crate::program::tensor_desc::TensorFlags;
    use crate::types::{DType, SF_MAX_DIMS};

    fn desc(shape0: i32) -> crate::program::TensorDesc {
        let mut shape = [0i32; SF_MAX_DIMS];
        shape[0] = shape0;
        crate::program::TensorDesc {
            dtype: DType::F32,
            ndim: 1,
            is_constant: false,
            flags: TensorFlags::empty(),
            shape,
            data_size: 0,
        }
    }

    fn minimal_program() -> Program {
        Program {
            instruction_count: 0,
            tensor_count: 2,
            reduction_scratch_size: 0,
            sync_scratch_size: 0,
            instructions: Vec::new(),
            tensor_descs: vec![desc(4), desc(4)],
            tensor_data: vec![Vec::new(), Vec::new()],
            symbols: vec![Symbol {
                name: "x".into(),
                provider: String::new(),
                name_hash: crate::program::symbol::fnv1a_hash("x"),
                register_idx: 1,
                related_name_hash: 0,
                flags: crate::program::SymbolFlags::INPUT,
                builtin_id: 0,
                builtin_axis: 0,
            }],
            tasks: Vec::new(),
            bindings: Vec::new(),
        }
    }

    #[test]
    fn from_program_allocates_every_register() {
        let allocator: Arc<dyn Allocator> = Arc::new(Heap::new(1 << 16));
        let state = RegisterFile::from_program(&minimal_program(), allocator).unwrap();
        assert_eq!(state.register_count(), 2);
        assert!(state.owns(0));
        assert!(state.get(0).unwrap().is_valid());
    }

    #[test]
    fn alias_register_is_left_unallocated() {
        let allocator: Arc<dyn Allocator> = Arc::new(Heap::new(1 << 16));
        let mut program = minimal_program();
        program.tensor_descs[1].flags = TensorFlags::ALIAS;
        let state = RegisterFile::from_program(&program, allocator).unwrap();
        assert!(state.get(1).is_none());
        assert!(!state.owns(1));
        assert!(state.get(0).unwrap().is_valid());
    }

    #[test]
    fn lookup_resolves_symbol_hash_to_register() {
        let allocator: Arc<dyn Allocator> = Arc::new(Heap::new(1 << 16));
        let state = RegisterFile::from_program(&minimal_program(), allocator).unwrap();
        let hash = crate::program::symbol::fnv1a_hash("x");
        assert_eq!(state.lookup(hash), Some(1));
    }

    #[test]
    fn error_flag_is_first_writer_wins() {
        let allocator: Arc<dyn Allocator> = Arc::new(Heap::new(1 << 16));
        let state = RegisterFile::from_program(&minimal_program(), allocator).unwrap();
        assert!(state.raise_error(ErrorCode::Oom));
        assert!(!state.raise_error(ErrorCode::Runtime));
        assert_eq!(state.error(), ErrorCode::Oom);
    }
}
