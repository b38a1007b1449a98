//! The three dispatch strategies a task can be scheduled under. All three
//! split a flattened, row-major iteration domain into contiguous chunks
//! and hand one chunk to each thread-pool job; they differ in what
//! happens between chunks.
//!
//! Registers are bound as a single base pointer plus one linear byte
//! stride (broadcast registers carry stride 0), matching the wire
//! format's per-binding `byte_stride` field: the compiler is assumed to
//! only emit tasks whose registers are either fully contiguous with the
//! domain or fully broadcast, so a flattened 1-D walk is sufficient.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::error::ErrorCode;
use crate::memory::Arena;
use crate::pool::ThreadPool;
use crate::shape::TypeInfo;

use super::builtins::{self, BuiltinId};
use super::context::ExecContext;

/// Default chunk size for flattened element-wise dispatch. Large enough
/// to amortize the per-job thread-pool overhead, small enough to give
/// many workers something to do on a modest domain.
pub const DEFAULT_CHUNK: u32 = 4096;

/// A register's participation in one task: base pointer into the full
/// (un-tiled) tensor storage, a linear byte stride for stepping across
/// the flattened domain, and the register's own metadata.
#[derive(Clone, Copy)]
pub struct RegisterBinding {
    pub reg_idx: u16,
    pub ptr: NonNull<u8>,
    pub byte_stride: i32,
    pub info: TypeInfo,
    /// Built-in provider this register's symbol resolves to, or `None` for
    /// a plain host-bound/compiler-allocated register.
    pub builtin_id: BuiltinId,
    pub builtin_axis: u8,
}

// SAFETY: `ptr` is only ever read, offset, and written through within the
// lifetime of a single dispatch call, under a no-aliasing discipline:
// distinct jobs touch distinct tile ranges of the same register.
unsafe impl Send for RegisterBinding {}
unsafe impl Sync for RegisterBinding {}

fn bind_tile(ctx: &mut ExecContext, bindings: &[RegisterBinding], tile_start: u32, tile_len: u32, job_idx: u32) {
    for b in bindings {
        let byte_offset = tile_start as i64 * b.byte_stride as i64;
        // SAFETY: `byte_offset` stays within the register's allocated
        // region because `byte_stride` is 0 for any register whose shape
        // doesn't cover the full domain (broadcast), and otherwise the
        // register is sized for exactly `domain_count` elements.
        let tile_ptr = unsafe { NonNull::new_unchecked(b.ptr.as_ptr().offset(byte_offset as isize)) };
        ctx.bind_register(b.reg_idx, tile_ptr, b.byte_stride, b.info);
        if b.builtin_id != BuiltinId::None {
            fill_builtin_tile(tile_ptr, b, tile_start, tile_len, job_idx);
        }
    }
}

/// Fills a built-in-provider register's tile with its synthesized values,
/// once per tile, before any kernel of the task runs (`host.index.k`,
/// `host.job_index`, …). Written through `f32` to match the demonstration
/// kernel set's element type.
fn fill_builtin_tile(tile_ptr: NonNull<u8>, b: &RegisterBinding, tile_start: u32, tile_len: u32, job_idx: u32) {
    let shape = b.info.shape();
    for i in 0..tile_len {
        let coords = builtins::decompose_row_major(tile_start + i, shape);
        let value = builtins::builtin_value(b.builtin_id, b.builtin_axis, &coords, job_idx) as f32;
        // SAFETY: `i * byte_stride` stays within the tile the caller
        // sized `tile_ptr` for, same convention as every kernel's
        // per-element write.
        unsafe {
            let p = tile_ptr.as_ptr().offset(i as isize * b.byte_stride as isize) as *mut f32;
            std::ptr::write_unaligned(p, value);
        }
    }
}

/// Runs `exec(ctx, tile_start, tile_len)` once per chunk of `domain_count`
/// flattened elements, in parallel over `pool`. Blocks until every chunk
/// has run (or the kill switch has been raised). `arenas` must have at
/// least `pool.thread_count()` entries, one per worker, reused (and
/// reset) across tiles.
pub fn run_default(
    pool: &ThreadPool,
    arenas: Arc<Vec<Arena>>,
    domain_count: u32,
    bindings: Arc<Vec<RegisterBinding>>,
    global_error: Arc<AtomicI32>,
    exec: Arc<dyn Fn(&mut ExecContext, u32, u32) + Send + Sync>,
) {
    run_chunked(pool, arenas, domain_count, DEFAULT_CHUNK, bindings, global_error, 0, None, exec);
}

#[allow(clippy::too_many_arguments)]
fn run_chunked(
    pool: &ThreadPool,
    arenas: Arc<Vec<Arena>>,
    domain_count: u32,
    chunk_size: u32,
    bindings: Arc<Vec<RegisterBinding>>,
    global_error: Arc<AtomicI32>,
    sync_pass: i32,
    sync_data: Option<Arc<Vec<f32>>>,
    exec: Arc<dyn Fn(&mut ExecContext, u32, u32) + Send + Sync>,
) {
    if domain_count == 0 {
        return;
    }
    let job_count = (domain_count + chunk_size - 1) / chunk_size;

    let arenas = arenas.clone();
    let bindings = bindings.clone();
    let global_error = global_error.clone();
    pool.run(
        job_count,
        Arc::new(move |job_id: u32, worker_idx: usize| {
            if global_error.load(Ordering::SeqCst) != ErrorCode::None as i32 {
                return;
            }
            let tile_start = job_id * chunk_size;
            let tile_len = chunk_size.min(domain_count - tile_start);

            let arena = &arenas[worker_idx];
            arena.reset();
            let mut ctx = ExecContext::new(arena, &global_error);
            bind_tile(&mut ctx, &bindings, tile_start, tile_len, job_id);
            ctx.tile_offset[0] = tile_start;
            ctx.tile_size[0] = tile_len;
            ctx.domain_shape[0] = domain_count;
            ctx.job_idx = job_id;
            ctx.sync_pass = sync_pass;
            if let Some(data) = &sync_data {
                ctx.sync_data = data.as_ptr() as *const u8;
            }

            exec(&mut ctx, tile_start, tile_len);
        }),
    );
}

/// Reduction strategy: identical chunking to [`run_default`], but `exec`
/// is expected to accumulate into a caller-owned `partials` slot (indexed
/// by `job_idx`) instead of writing the domain-shaped output directly.
/// The caller (typically a kernel's own driver) merges `partials` after
/// this call returns — this function only handles the parallel partial
/// pass, not the serial merge.
pub fn run_reduction(
    pool: &ThreadPool,
    arenas: Arc<Vec<Arena>>,
    domain_count: u32,
    bindings: Arc<Vec<RegisterBinding>>,
    global_error: Arc<AtomicI32>,
    exec: Arc<dyn Fn(&mut ExecContext, u32, u32) + Send + Sync>,
) {
    run_chunked(pool, arenas, domain_count, DEFAULT_CHUNK, bindings, global_error, 0, None, exec);
}

/// Two-pass synchronized strategy (e.g. `cumsum`): a local pass computes
/// each chunk's own partial result (`ctx.sync_pass == 0`), `between` runs
/// serially on the calling thread to turn those partials into per-chunk
/// offsets (the barrier is simply that `pool.run` blocks until the local
/// pass is fully done), then an apply pass (`ctx.sync_pass == 1`, with
/// `ctx.sync_data` pointing at `offsets`) folds each chunk's offset back
/// in.
#[allow(clippy::too_many_arguments)]
pub fn run_two_pass_sync(
    pool: &ThreadPool,
    arenas: Arc<Vec<Arena>>,
    domain_count: u32,
    bindings: Arc<Vec<RegisterBinding>>,
    global_error: Arc<AtomicI32>,
    local_pass: Arc<dyn Fn(&mut ExecContext, u32, u32) + Send + Sync>,
    between: impl FnOnce() -> Arc<Vec<f32>>,
    apply_pass: Arc<dyn Fn(&mut ExecContext, u32, u32) + Send + Sync>,
) {
    if domain_count == 0 {
        return;
    }
    run_chunked(
        pool,
        arenas.clone(),
        domain_count,
        DEFAULT_CHUNK,
        bindings.clone(),
        global_error.clone(),
        0,
        None,
        local_pass,
    );
    if global_error.load(Ordering::SeqCst) != ErrorCode::None as i32 {
        return;
    }
    let offsets = between();
    run_chunked(
        pool,
        arenas,
        domain_count,
        DEFAULT_CHUNK,
        bindings,
        global_error,
        1,
        Some(offsets),
        apply_pass,
    );
}
