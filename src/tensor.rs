//! Typed views into a [`Buffer`]. A `Tensor` is metadata ([`TypeInfo`]
//! plus a byte offset) layered over shared, reference-counted storage —
//! `view`/`slice`/`reshape`/`transpose` are all O(1) metadata-only
//! operations that clone the `Arc<Buffer>` rather than copy bytes.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::memory::Allocator;
use crate::shape::{self, TypeInfo};
use crate::types::SF_MAX_DIMS;

/// A typed view into a buffer: shape/strides/dtype plus a byte offset
/// into shared storage. Lives as long as whatever register slot holds
/// it.
#[derive(Clone)]
pub struct Tensor {
    info: TypeInfo,
    buffer: Arc<Buffer>,
    byte_offset: usize,
}

use crate::buffer::Buffer;

impl Tensor {
    /// Allocates a new owning buffer sized for `info` and wraps it at
    /// offset 0.
    pub fn alloc(allocator: Arc<dyn Allocator>, info: TypeInfo) -> Option<Tensor> {
        let buffer = Buffer::alloc(allocator, info.size_bytes())?;
        Some(Tensor {
            info,
            buffer: Arc::new(buffer),
            byte_offset: 0,
        })
    }

    /// Wraps an existing buffer as a tensor view at a given byte offset,
    /// without taking ownership of the buffer's bytes.
    pub fn from_buffer(buffer: Arc<Buffer>, info: TypeInfo, byte_offset: usize) -> Tensor {
        Tensor {
            info,
            buffer,
            byte_offset,
        }
    }

    pub fn info(&self) -> &TypeInfo {
        &self.info
    }

    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn is_valid(&self) -> bool {
        self.buffer.data().is_some()
    }

    pub fn is_scalar(&self) -> bool {
        self.info.ndim() == 0
    }

    pub fn element_count(&self) -> usize {
        self.info.element_count()
    }

    pub fn size_bytes(&self) -> usize {
        self.info.size_bytes()
    }

    pub fn is_contiguous(&self) -> bool {
        self.info.is_contiguous()
    }

    pub fn same_shape(&self, other: &Tensor) -> bool {
        self.info.same_shape(&other.info)
    }

    /// Raw pointer to the tensor's first element, honoring `byte_offset`.
    /// `None` if the underlying buffer has no data (shouldn't happen for
    /// a tensor reachable through the public API, but kept fallible to
    /// mirror `sf_tensor_data`'s null-check).
    pub fn data_ptr(&self) -> Option<NonNull<u8>> {
        let base = self.buffer.data()?;
        // SAFETY: the invariant `byte_offset + size_bytes <= buffer.size_bytes`
        // is maintained by every constructor below.
        Some(unsafe { NonNull::new_unchecked(base.as_ptr().add(self.byte_offset)) })
    }

    /// Linear element offset for `indices`, via the tensor's own strides
    /// (`sf_tensor_get_offset`).
    pub fn element_offset(&self, indices: &[i32]) -> i64 {
        indices
            .iter()
            .zip(self.info.strides())
            .map(|(&idx, &stride)| idx as i64 * stride as i64)
            .sum()
    }

    /// O(1) struct copy sharing the same buffer.
    pub fn view(&self) -> Tensor {
        self.clone()
    }

    /// A 1-D slice of `count` elements starting at element `start`.
    /// Advances `byte_offset` by `start * elem_size`.
    pub fn slice(&self, start: usize, count: usize) -> Tensor {
        let elem_size = self.info.dtype.size_bytes();
        let info = TypeInfo::contiguous(self.info.dtype, &[count as i32]);
        Tensor {
            info,
            buffer: self.buffer.clone(),
            byte_offset: self.byte_offset + start * elem_size,
        }
    }

    /// A view with a different shape, requiring an equal element count.
    /// Rebuilds contiguous strides; `None` if the element counts differ.
    pub fn reshape(&self, new_shape: &[i32]) -> Option<Tensor> {
        if shape::calc_count(new_shape) != self.element_count() {
            return None;
        }
        let info = TypeInfo::contiguous(self.info.dtype, new_shape);
        Some(Tensor {
            info,
            buffer: self.buffer.clone(),
            byte_offset: self.byte_offset,
        })
    }

    /// A view with `shape[0]`/`shape[1]` and `strides[0]`/`strides[1]`
    /// swapped. Restricted to rank 2.
    pub fn transpose(&self) -> Option<Tensor> {
        if self.info.ndim() != 2 {
            return None;
        }
        let mut full_shape = [0i32; SF_MAX_DIMS];
        full_shape[..2].copy_from_slice(self.info.shape());
        full_shape.swap(0, 1);
        let mut full_strides = [0i32; SF_MAX_DIMS];
        full_strides[..2].copy_from_slice(self.info.strides());
        full_strides.swap(0, 1);

        let info = TypeInfo::from_raw(self.info.dtype, full_shape, full_strides, 2);
        Some(Tensor {
            info,
            buffer: self.buffer.clone(),
            byte_offset: self.byte_offset,
        })
    }

    /// Either grows in place (new buffer, copy, free old — explicit, no
    /// guaranteed in-place realloc) or, if the existing buffer is already
    /// large enough, just updates the metadata.
    pub fn resize(&mut self, allocator: Arc<dyn Allocator>, new_info: TypeInfo) -> bool {
        let needed = new_info.size_bytes();
        if self.byte_offset == 0 && self.buffer.size_bytes() >= needed {
            self.info = new_info;
            return true;
        }
        let Some(new_buffer) = Buffer::alloc(allocator, needed) else {
            return false;
        };
        if let (Some(src), Some(dst)) = (self.data_ptr(), new_buffer.data()) {
            let copy_len = needed.min(self.size_bytes());
            unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), copy_len) };
        }
        self.buffer = Arc::new(new_buffer);
        self.byte_offset = 0;
        self.info = new_info;
        true
    }

    /// Deep copy `src` into `dst`. Both must be contiguous and hold the
    /// same element count; non-contiguous operands are refused (callers
    /// needing that should use [`Tensor::copy_strided`]).
    pub fn copy_data(dst: &mut Tensor, src: &Tensor) -> bool {
        if !dst.is_contiguous() || !src.is_contiguous() {
            return false;
        }
        if dst.element_count() != src.element_count() {
            return false;
        }
        let (Some(s), Some(d)) = (src.data_ptr(), dst.data_ptr()) else {
            return false;
        };
        let len = src.size_bytes();
        unsafe { std::ptr::copy_nonoverlapping(s.as_ptr(), d.as_ptr(), len) };
        true
    }

    /// Generic element-by-element strided copy, for operands `copy_data`
    /// refuses: contiguity isn't a requirement this runtime needs to
    /// impose on every copy, only a fast path worth special-casing.
    pub fn copy_strided(dst: &mut Tensor, src: &Tensor) -> bool {
        if dst.element_count() != src.element_count() || dst.info.dtype != src.info.dtype {
            return false;
        }
        let elem_size = dst.info.dtype.size_bytes();
        let (Some(s_base), Some(d_base)) = (src.data_ptr(), dst.data_ptr()) else {
            return false;
        };
        let count = dst.element_count();
        let mut idx = vec![0i32; dst.info.ndim() as usize];
        for linear in 0..count {
            let mut rem = linear;
            for k in (0..idx.len()).rev() {
                let dim = dst.info.shape()[k].max(1) as usize;
                idx[k] = (rem % dim) as i32;
                rem /= dim;
            }
            let src_off = src.element_offset(&idx) as isize * elem_size as isize;
            let dst_off = dst.element_offset(&idx) as isize * elem_size as isize;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    s_base.as_ptr().offset(src_off),
                    d_base.as_ptr().offset(dst_off),
                    elem_size,
                );
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Heap;
    use crate::types::DType;

    fn heap() -> Arc<dyn Allocator> {
        Arc::new(Heap::new(1 << 16))
    }

    #[test]
    fn alloc_sizes_buffer_for_info() {
        let info = TypeInfo::contiguous(DType::F32, &[2, 3]);
        let t = Tensor::alloc(heap(), info).unwrap();
        assert_eq!(t.size_bytes(), 2 * 3 * 4);
        assert_eq!(t.byte_offset(), 0);
    }

    #[test]
    fn slice_advances_offset() {
        let info = TypeInfo::contiguous(DType::I32, &[10]);
        let t = Tensor::alloc(heap(), info).unwrap();
        let s = t.slice(3, 4);
        assert_eq!(s.byte_offset(), 3 * 4);
        assert_eq!(s.element_count(), 4);
    }

    #[test]
    fn reshape_preserves_count_and_data() {
        let info = TypeInfo::contiguous(DType::I32, &[2, 3]);
        let mut t = Tensor::alloc(heap(), info).unwrap();
        unsafe {
            let p = t.data_ptr().unwrap().as_ptr() as *mut i32;
            for i in 0..6i32 {
                *p.add(i as usize) = i;
            }
        }
        let r = t.reshape(&[3, 2]).unwrap();
        assert_eq!(r.element_count(), 6);
        unsafe {
            let p = r.data_ptr().unwrap().as_ptr() as *const i32;
            let seq: Vec<i32> = (0..6).map(|i| *p.add(i)).collect();
            assert_eq!(seq, vec![0, 1, 2, 3, 4, 5]);
        }
        assert!(t.reshape(&[4, 4]).is_none());
    }

    #[test]
    fn transpose_round_trips() {
        let info = TypeInfo::contiguous(DType::F32, &[4, 3]);
        let t = Tensor::alloc(heap(), info).unwrap();
        let tt = t.transpose().unwrap().transpose().unwrap();
        assert_eq!(tt.info().shape(), t.info().shape());
        assert_eq!(tt.info().strides(), t.info().strides());
        assert!(t.info().ndim() != 0 && Tensor::alloc(heap(), TypeInfo::scalar(DType::F32)).unwrap().transpose().is_none());
    }

    #[test]
    fn copy_data_requires_contiguous_and_equal_count() {
        let a = Tensor::alloc(heap(), TypeInfo::contiguous(DType::F32, &[4])).unwrap();
        let mut b = Tensor::alloc(heap(), TypeInfo::contiguous(DType::F32, &[4])).unwrap();
        assert!(Tensor::copy_data(&mut b, &a));
        let mut c = Tensor::alloc(heap(), TypeInfo::contiguous(DType::F32, &[5])).unwrap();
        assert!(!Tensor::copy_data(&mut c, &a));
    }

    #[test]
    fn copy_strided_handles_transposed_source() {
        let src_info = TypeInfo::contiguous(DType::I32, &[2, 3]);
        let src = Tensor::alloc(heap(), src_info).unwrap();
        unsafe {
            let p = src.data_ptr().unwrap().as_ptr() as *mut i32;
            for i in 0..6i32 {
                *p.add(i as usize) = i;
            }
        }
        let src_t = src.transpose().unwrap(); // logically [3, 2], strided
        let mut dst = Tensor::alloc(heap(), TypeInfo::contiguous(DType::I32, &[3, 2])).unwrap();
        assert!(Tensor::copy_strided(&mut dst, &src_t));
        unsafe {
            let p = dst.data_ptr().unwrap().as_ptr() as *const i32;
            let seq: Vec<i32> = (0..6).map(|i| *p.add(i)).collect();
            // src row-major [[0,1,2],[3,4,5]] transposed -> [[0,3],[1,4],[2,5]]
            assert_eq!(seq, vec![0, 3, 1, 4, 2, 5]);
        }
    }
}
