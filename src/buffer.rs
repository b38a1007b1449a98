//! Raw byte storage. A [`Buffer`] either owns its bytes (freed through its
//! allocator on drop) or merely views bytes owned elsewhere; [`Tensor`]
//! (see [`crate::tensor`]) is the typed, shaped view on top of it.

use std::ptr::NonNull;
use std::sync::Arc;

use bitflags::bitflags;

use crate::memory::Allocator;

bitflags! {
    /// Buffer provenance/placement flags. `GPU`/`PINNED` are carried for
    /// forward compatibility with non-CPU backends — the backend
    /// interface allows GPU execution even though only CPU is implemented
    /// here — and are not interpreted by this crate.
    pub struct BufferFlags: u32 {
        /// Buffer is responsible for freeing `data`.
        const OWNS_DATA = 1 << 0;
        const GPU       = 1 << 1;
        const PINNED    = 1 << 2;
    }
}

/// Owns or views a raw byte region. Tensors never allocate directly —
/// they always go through a `Buffer`, which is the unit the ownership
/// flag in [`crate::state::RegisterFile`] tracks.
pub struct Buffer {
    data: Option<NonNull<u8>>,
    size_bytes: usize,
    allocator: Arc<dyn Allocator>,
    flags: BufferFlags,
}

// A `Buffer` either owns memory it allocated itself (safe to move/share
// under the allocator's own Send+Sync contract) or views memory owned by
// the host, which by the same resource-binding contract outlives the
// buffer. Either way there's no thread-local state here.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Allocates and zero-initialises `size_bytes` through `allocator`,
    /// marking the buffer as owning.
    pub fn alloc(allocator: Arc<dyn Allocator>, size_bytes: usize) -> Option<Buffer> {
        let data = allocator.alloc(size_bytes)?;
        Some(Buffer {
            data: Some(data),
            size_bytes,
            allocator,
            flags: BufferFlags::OWNS_DATA,
        })
    }

    /// Wraps existing, externally-owned memory as a non-owning view.
    /// `allocator` is kept only so the buffer has somewhere to route a
    /// (no-op) free; it is never invoked on the viewed pointer.
    pub fn init_view(allocator: Arc<dyn Allocator>, data: NonNull<u8>, size_bytes: usize) -> Buffer {
        Buffer {
            data: Some(data),
            size_bytes,
            allocator,
            flags: BufferFlags::empty(),
        }
    }

    pub fn data(&self) -> Option<NonNull<u8>> {
        self.data
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    pub fn owns_data(&self) -> bool {
        self.flags.contains(BufferFlags::OWNS_DATA)
    }
}

impl Drop for Buffer {
    /// Releases bytes iff the `OWNS_DATA` flag is set; a non-owning view
    /// never frees the memory it points at.
    fn drop(&mut self) {
        if self.owns_data() {
            if let Some(ptr) = self.data.take() {
                unsafe { self.allocator.free(ptr) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Heap;

    #[test]
    fn alloc_owns_and_frees() {
        let heap: Arc<dyn Allocator> = Arc::new(Heap::new(4096));
        let before = {
            let h = heap.clone();
            let _buf = Buffer::alloc(h, 128).unwrap();
            // buf dropped at end of this scope, should free
        };
        let _ = before;
        let buf2 = Buffer::alloc(heap.clone(), 64).unwrap();
        assert!(buf2.owns_data());
        assert_eq!(buf2.size_bytes(), 64);
    }

    #[test]
    fn view_never_frees() {
        let heap: Arc<dyn Allocator> = Arc::new(Heap::new(4096));
        let owner = Buffer::alloc(heap.clone(), 64).unwrap();
        let ptr = owner.data().unwrap();
        let view = Buffer::init_view(heap, ptr, 64);
        assert!(!view.owns_data());
        drop(view);
        // `owner` must still be valid; reading through it must not crash.
        assert_eq!(owner.size_bytes(), 64);
    }
}
