//! Kernel contract and the built-in demonstration kernel set. A kernel
//! reads its sources and writes its destination through the
//! [`crate::exec::ExecContext`] it's handed; it never touches the thread
//! pool, the register file, or any allocator but the tile-scoped scratch
//! arena.

use std::collections::HashMap;

use crate::exec::ExecContext;
use crate::opcodes::Opcode;
use crate::program::Instruction;
use crate::types::DType;

/// One opcode's element-wise (or tile-wise, for reductions/scans) body.
/// `tile_start`/`tile_len` describe the flattened-domain range this call
/// owns; `inst` carries the resolved register indices.
pub trait Kernel: Send + Sync {
    fn run(&self, ctx: &mut ExecContext, inst: &Instruction, tile_start: u32, tile_len: u32);
}

/// Resolves opcodes to kernel implementations. Built at bake time; an
/// opcode with metadata but no registered kernel is a configuration bug,
/// not a wire-format error, and is reported as `SfError::InvalidOp`.
pub fn registry() -> HashMap<u16, Box<dyn Kernel>> {
    let mut map: HashMap<u16, Box<dyn Kernel>> = HashMap::new();
    map.insert(Opcode::Add as u16, Box::new(Add));
    map.insert(Opcode::Mul as u16, Box::new(Mul));
    map.insert(Opcode::Copy as u16, Box::new(Copy_));
    map.insert(Opcode::Sum as u16, Box::new(Sum));
    map.insert(Opcode::CumSum as u16, Box::new(CumSum));
    map.insert(Opcode::Transpose as u16, Box::new(TransposeKernel));
    map.insert(Opcode::FillIndex as u16, Box::new(FillIndex));
    map
}

unsafe fn read_f32(ptr: *const u8, byte_stride: i32, i: u32) -> f32 {
    let p = ptr.offset(i as isize * byte_stride as isize) as *const f32;
    std::ptr::read_unaligned(p)
}

unsafe fn write_f32(ptr: *mut u8, byte_stride: i32, i: u32, value: f32) {
    let p = ptr.offset(i as isize * byte_stride as isize) as *mut f32;
    std::ptr::write_unaligned(p, value);
}

struct Add;
impl Kernel for Add {
    fn run(&self, ctx: &mut ExecContext, inst: &Instruction, tile_start: u32, tile_len: u32) {
        let (Some(a), Some(b), Some(dst)) = (
            ctx.register_ptr(inst.src1_idx),
            ctx.register_ptr(inst.src2_idx),
            ctx.register_ptr(inst.dest_idx),
        ) else {
            ctx.set_error(crate::error::ErrorCode::Runtime, 0);
            return;
        };
        let (sa, sb, sd) = (
            ctx.register_stride(inst.src1_idx),
            ctx.register_stride(inst.src2_idx),
            ctx.register_stride(inst.dest_idx),
        );
        for i in 0..tile_len {
            unsafe {
                let lhs = read_f32(a.as_ptr(), sa, i);
                let rhs = read_f32(b.as_ptr(), sb, i);
                write_f32(dst.as_ptr(), sd, i, lhs + rhs);
            }
        }
        let _ = tile_start;
    }
}

struct Mul;
impl Kernel for Mul {
    fn run(&self, ctx: &mut ExecContext, inst: &Instruction, _tile_start: u32, tile_len: u32) {
        let (Some(a), Some(b), Some(dst)) = (
            ctx.register_ptr(inst.src1_idx),
            ctx.register_ptr(inst.src2_idx),
            ctx.register_ptr(inst.dest_idx),
        ) else {
            ctx.set_error(crate::error::ErrorCode::Runtime, 0);
            return;
        };
        let (sa, sb, sd) = (
            ctx.register_stride(inst.src1_idx),
            ctx.register_stride(inst.src2_idx),
            ctx.register_stride(inst.dest_idx),
        );
        for i in 0..tile_len {
            unsafe {
                let lhs = read_f32(a.as_ptr(), sa, i);
                let rhs = read_f32(b.as_ptr(), sb, i);
                write_f32(dst.as_ptr(), sd, i, lhs * rhs);
            }
        }
    }
}

struct Copy_;
impl Kernel for Copy_ {
    fn run(&self, ctx: &mut ExecContext, inst: &Instruction, _tile_start: u32, tile_len: u32) {
        let (Some(src), Some(dst)) = (ctx.register_ptr(inst.src1_idx), ctx.register_ptr(inst.dest_idx)) else {
            ctx.set_error(crate::error::ErrorCode::Runtime, 0);
            return;
        };
        let (ss, sd) = (ctx.register_stride(inst.src1_idx), ctx.register_stride(inst.dest_idx));
        for i in 0..tile_len {
            unsafe { write_f32(dst.as_ptr(), sd, i, read_f32(src.as_ptr(), ss, i)) };
        }
    }
}

/// Reduction kernel: accumulates this tile's partial sum. The compiler is
/// expected to bind `dest` to a per-job scratch register sized for one
/// `f32` per job (`reduction_scratch_size` in the program header); the
/// backend merges these serially after the dispatch completes.
struct Sum;
impl Kernel for Sum {
    fn run(&self, ctx: &mut ExecContext, inst: &Instruction, _tile_start: u32, tile_len: u32) {
        let Some(src) = ctx.register_ptr(inst.src1_idx) else {
            ctx.set_error(crate::error::ErrorCode::Runtime, 0);
            return;
        };
        let Some(dst) = ctx.register_ptr(inst.dest_idx) else {
            ctx.set_error(crate::error::ErrorCode::Runtime, 0);
            return;
        };
        let ss = ctx.register_stride(inst.src1_idx);
        let mut acc = 0f32;
        for i in 0..tile_len {
            acc += unsafe { read_f32(src.as_ptr(), ss, i) };
        }
        // dest is this job's single scratch slot, one f32 wide.
        unsafe { write_f32(dst.as_ptr(), DType::F32.size_bytes() as i32, ctx.job_idx, acc) };
    }
}

/// Two-pass prefix sum. `sync_pass == 0` computes this tile's local sum
/// (written through `dest`, one scratch slot per job, same convention as
/// [`Sum`]); `sync_pass == 1` adds the caller-resolved prefix offset
/// (stashed by the backend at `ctx.sync_data`, one `f32` per job) back
/// into every element of the tile.
struct CumSum;
impl Kernel for CumSum {
    fn run(&self, ctx: &mut ExecContext, inst: &Instruction, _tile_start: u32, tile_len: u32) {
        let Some(src) = ctx.register_ptr(inst.src1_idx) else {
            ctx.set_error(crate::error::ErrorCode::Runtime, 0);
            return;
        };
        let ss = ctx.register_stride(inst.src1_idx);

        if ctx.sync_pass == 0 {
            let Some(dst) = ctx.register_ptr(inst.dest_idx) else {
                ctx.set_error(crate::error::ErrorCode::Runtime, 0);
                return;
            };
            let sd = ctx.register_stride(inst.dest_idx);
            let mut running = 0f32;
            for i in 0..tile_len {
                running += unsafe { read_f32(src.as_ptr(), ss, i) };
                unsafe { write_f32(dst.as_ptr(), sd, i, running) };
            }
        } else {
            let offset = if ctx.sync_data.is_null() {
                0f32
            } else {
                unsafe { *(ctx.sync_data as *const f32).add(ctx.job_idx as usize) }
            };
            let Some(dst) = ctx.register_ptr(inst.dest_idx) else {
                ctx.set_error(crate::error::ErrorCode::Runtime, 0);
                return;
            };
            let sd = ctx.register_stride(inst.dest_idx);
            for i in 0..tile_len {
                let v = unsafe { read_f32(dst.as_ptr(), sd, i) };
                unsafe { write_f32(dst.as_ptr(), sd, i, v + offset) };
            }
        }
    }
}

/// Rank-2 transpose, element by element (no tiling shortcuts).
struct TransposeKernel;
impl Kernel for TransposeKernel {
    fn run(&self, ctx: &mut ExecContext, inst: &Instruction, tile_start: u32, tile_len: u32) {
        let (Some(src_info), Some(dst_info)) =
            (ctx.register_info(inst.src1_idx), ctx.register_info(inst.dest_idx))
        else {
            ctx.set_error(crate::error::ErrorCode::Runtime, 0);
            return;
        };
        let (Some(src), Some(dst)) = (ctx.register_ptr(inst.src1_idx), ctx.register_ptr(inst.dest_idx)) else {
            ctx.set_error(crate::error::ErrorCode::Runtime, 0);
            return;
        };
        let rows = dst_info.shape().first().copied().unwrap_or(1).max(1) as u32;
        let cols = dst_info.shape().get(1).copied().unwrap_or(1).max(1) as u32;
        let elem = DType::F32.size_bytes() as i32;
        for flat in tile_start..tile_start + tile_len {
            let r = flat / cols;
            let c = flat % cols;
            if r >= rows {
                break;
            }
            let src_off = (c * rows + r) as i32 * elem;
            let dst_off = flat as i32 * elem;
            unsafe {
                let v = std::ptr::read_unaligned(src.as_ptr().offset(src_off as isize) as *const f32);
                std::ptr::write_unaligned(dst.as_ptr().offset(dst_off as isize) as *mut f32, v);
            }
        }
        let _ = src_info;
    }
}

/// Generator kernel: writes each element's own flattened domain index.
struct FillIndex;
impl Kernel for FillIndex {
    fn run(&self, ctx: &mut ExecContext, inst: &Instruction, tile_start: u32, tile_len: u32) {
        let Some(dst) = ctx.register_ptr(inst.dest_idx) else {
            ctx.set_error(crate::error::ErrorCode::Runtime, 0);
            return;
        };
        let sd = ctx.register_stride(inst.dest_idx);
        for i in 0..tile_len {
            unsafe { write_f32(dst.as_ptr(), sd, i, (tile_start + i) as f32) };
        }
    }
}
