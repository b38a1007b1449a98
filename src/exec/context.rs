//! Per-tile execution context: the flat, register-indexed view a kernel
//! actually reads/writes through. Rebuilt (cheaply, as plain arrays) for
//! every tile rather than shared, so kernels never touch [`crate::state::RegisterFile`]
//! or the thread pool directly.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::ErrorCode;
use crate::memory::Arena;
use crate::shape::TypeInfo;
use crate::types::{SF_MAX_DIMS, SF_MAX_REGISTERS};

/// Base pointer, byte stride, and metadata for one register, as seen by a
/// single task's kernels. `None` for registers the task doesn't bind.
#[derive(Clone, Copy)]
struct RegisterView {
    ptr: Option<NonNull<u8>>,
    byte_stride: i32,
    info: TypeInfo,
}

/// A kernel's entire view of the world for one tile of one task. Created
/// fresh per tile by [`super::dispatch`], never shared across threads.
pub struct ExecContext<'a> {
    registers: Box<[Option<RegisterView>; SF_MAX_REGISTERS]>,
    /// Per-tile scratch allocator; reset by the caller between tiles.
    pub scratch: &'a Arena,

    pub ndim: u8,
    pub linear_offset: u32,
    pub error_idx: u32,
    pub tile_offset: [u32; SF_MAX_DIMS],
    pub tile_size: [u32; SF_MAX_DIMS],
    pub domain_shape: [u32; SF_MAX_DIMS],

    error: ErrorCode,
    global_error: &'a AtomicI32,

    /// `sync_pass`/`job_idx`: set by [`super::dispatch::run_two_pass_sync`]
    /// so a kernel can tell which half of a barrier-synchronized op it's
    /// in. `sync_data` points at the serial sweep's per-job offsets
    /// (one `f32` per job), null during the local pass.
    pub sync_pass: i32,
    pub sync_data: *const u8,
    pub job_idx: u32,
}

impl<'a> ExecContext<'a> {
    pub fn new(scratch: &'a Arena, global_error: &'a AtomicI32) -> Self {
        ExecContext {
            registers: Box::new([None; SF_MAX_REGISTERS]),
            scratch,
            ndim: 1,
            linear_offset: 0,
            error_idx: 0,
            tile_offset: [0; SF_MAX_DIMS],
            tile_size: {
                let mut t = [0u32; SF_MAX_DIMS];
                t[0] = 1;
                t
            },
            domain_shape: {
                let mut t = [0u32; SF_MAX_DIMS];
                t[0] = 1;
                t
            },
            error: ErrorCode::None,
            global_error,
            sync_pass: 0,
            sync_data: std::ptr::null(),
            job_idx: 0,
        }
    }

    /// Binds register `idx` for this tile: a raw base pointer (already
    /// offset to the start of the tile, not the whole tensor) plus its
    /// resolved byte stride and metadata.
    pub fn bind_register(&mut self, idx: u16, ptr: NonNull<u8>, byte_stride: i32, info: TypeInfo) {
        self.registers[idx as usize] = Some(RegisterView { ptr: Some(ptr), byte_stride, info });
    }

    pub fn register_ptr(&self, idx: u16) -> Option<NonNull<u8>> {
        self.registers[idx as usize].and_then(|r| r.ptr)
    }

    pub fn register_stride(&self, idx: u16) -> i32 {
        self.registers[idx as usize].map(|r| r.byte_stride).unwrap_or(0)
    }

    pub fn register_info(&self, idx: u16) -> Option<TypeInfo> {
        self.registers[idx as usize].map(|r| r.info)
    }

    /// Local (this tile only) error state, checked after every instruction.
    pub fn error(&self) -> ErrorCode {
        self.error
    }

    /// Records a local error and tries to raise the global kill switch.
    /// `element_idx` is relative to the tile's own start, matching
    /// `sf_exec_ctx::error_idx`.
    pub fn set_error(&mut self, code: ErrorCode, element_idx: u32) {
        if self.error == ErrorCode::None {
            self.error = code;
            self.error_idx = element_idx;
        }
        let _ = self.global_error.compare_exchange(
            ErrorCode::None as i32,
            code as i32,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// True once any worker (this one or another) has raised the kill
    /// switch; the dispatcher polls this between tiles to stop early.
    pub fn global_error_raised(&self) -> bool {
        self.global_error.load(Ordering::SeqCst) != ErrorCode::None as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins_locally_and_globally() {
        let arena = Arena::new(1024);
        let global = AtomicI32::new(ErrorCode::None as i32);
        let mut ctx = ExecContext::new(&arena, &global);
        ctx.set_error(ErrorCode::OutOfBounds, 5);
        ctx.set_error(ErrorCode::Oom, 9);
        assert_eq!(ctx.error(), ErrorCode::OutOfBounds);
        assert_eq!(ctx.error_idx, 5);
        assert!(ctx.global_error_raised());
    }

    #[test]
    fn unbound_register_reads_as_none() {
        let arena = Arena::new(1024);
        let global = AtomicI32::new(ErrorCode::None as i32);
        let ctx = ExecContext::new(&arena, &global);
        assert!(ctx.register_ptr(3).is_none());
        assert_eq!(ctx.register_stride(3), 0);
        assert!(ctx.register_info(3).is_none());
    }
}
