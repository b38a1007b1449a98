//! Shape algebra: element counting, stride derivation, and NumPy-style
//! broadcasting. `get_broadcast_strides` is the single arithmetic routine
//! that lets the dispatcher treat broadcast operands as plain strided
//! iteration.

use std::fmt;

use crate::types::{DType, SF_MAX_DIMS};

/// Shape + strides + dtype, value-copied everywhere a tensor's metadata
/// needs to travel (register arrays, `ExecContext`, cartridge descriptors).
/// Strides are in *elements*, not bytes; byte conversion happens only in
/// the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeInfo {
    pub dtype: DType,
    ndim: u8,
    shape: [i32; SF_MAX_DIMS],
    strides: [i32; SF_MAX_DIMS],
}

impl TypeInfo {
    /// Builds contiguous, row-major metadata for `shape`.
    ///
    /// # Panics
    /// Panics if `shape.len() > SF_MAX_DIMS`; this is a programmer error
    /// (rank is bounded by construction everywhere else in the crate).
    pub fn contiguous(dtype: DType, shape: &[i32]) -> Self {
        assert!(
            shape.len() <= SF_MAX_DIMS,
            "rank {} exceeds SF_MAX_DIMS ({})",
            shape.len(),
            SF_MAX_DIMS
        );
        let mut info = TypeInfo {
            dtype,
            ndim: shape.len() as u8,
            shape: [0; SF_MAX_DIMS],
            strides: [0; SF_MAX_DIMS],
        };
        info.shape[..shape.len()].copy_from_slice(shape);
        info.recompute_strides();
        info
    }

    /// A rank-0 scalar of `dtype`.
    pub fn scalar(dtype: DType) -> Self {
        TypeInfo {
            dtype,
            ndim: 0,
            shape: [0; SF_MAX_DIMS],
            strides: [0; SF_MAX_DIMS],
        }
    }

    pub fn ndim(&self) -> u8 {
        self.ndim
    }

    pub fn shape(&self) -> &[i32] {
        &self.shape[..self.ndim as usize]
    }

    pub fn strides(&self) -> &[i32] {
        &self.strides[..self.ndim as usize]
    }

    /// Rebuilds contiguous row-major strides from the current shape,
    /// walking from the last dimension to the first (`calc_strides`).
    /// Dimensions `<= 0` count as 1 for stride/count purposes but are not
    /// themselves rewritten — callers must fix them to a concrete
    /// positive size before dispatch, per the rank invariant.
    pub fn recompute_strides(&mut self) {
        let mut stride: i32 = 1;
        for k in (0..self.ndim as usize).rev() {
            self.strides[k] = stride;
            let dim = self.shape[k];
            stride *= if dim > 0 { dim } else { 1 };
        }
    }

    /// Total element count (`calc_count`): product of shape, with
    /// non-positive dims treated as 1; rank 0 is 1.
    pub fn element_count(&self) -> usize {
        calc_count(self.shape())
    }

    pub fn size_bytes(&self) -> usize {
        self.element_count() * self.dtype.size_bytes()
    }

    /// True iff rank is 0 or every dimension is 1.
    pub fn is_scalar(&self) -> bool {
        is_scalar(self.shape())
    }

    /// Drops every dimension equal to 1 and recomputes strides. Rank-0 is
    /// legal (an all-ones shape normalizes to a scalar).
    pub fn normalize(&mut self) {
        let kept: Vec<i32> = self.shape().iter().copied().filter(|&d| d != 1).collect();
        self.ndim = kept.len() as u8;
        self.shape = [0; SF_MAX_DIMS];
        self.shape[..kept.len()].copy_from_slice(&kept);
        self.recompute_strides();
    }

    /// True iff the strides exactly telescope the shape in row-major
    /// order (no gaps, no permutation) — i.e. this is a plain contiguous
    /// view, not a transposed or sliced one.
    pub fn is_contiguous(&self) -> bool {
        if self.ndim == 0 {
            return true;
        }
        if self.ndim == 1 {
            return self.strides[0] == 1 || self.shape[0] <= 1;
        }
        let mut stride: i32 = 1;
        for i in (0..self.ndim as usize).rev() {
            if self.strides[i] != stride {
                return false;
            }
            let dim = self.shape[i];
            stride *= if dim > 0 { dim } else { 1 };
        }
        true
    }

    pub fn same_shape(&self, other: &TypeInfo) -> bool {
        self.shape() == other.shape()
    }

    /// Builds metadata from already-computed shape/strides, bypassing
    /// `recompute_strides`. Used by `Tensor::transpose`, whose whole point
    /// is to produce non-contiguous strides.
    pub(crate) fn from_raw(
        dtype: DType,
        shape: [i32; SF_MAX_DIMS],
        strides: [i32; SF_MAX_DIMS],
        ndim: u8,
    ) -> Self {
        TypeInfo {
            dtype,
            ndim,
            shape,
            strides,
        }
    }
}

impl fmt::Display for TypeInfo {
    /// Renders as `"[100, 200]"`.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.shape().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

/// Product of `shape`, treating non-positive dims as 1. Empty shape
/// (rank 0) returns 1.
pub fn calc_count(shape: &[i32]) -> usize {
    shape
        .iter()
        .map(|&d| if d > 0 { d as usize } else { 1 })
        .product()
}

/// True iff rank is 0 or every dim is 1.
pub fn is_scalar(shape: &[i32]) -> bool {
    shape.iter().all(|&d| d == 1)
}

/// Attempts to broadcast `a` against `b` following NumPy rules: align on
/// the right, for each aligned pair `{x, y}` require `x == y` or one of
/// `{x, y}` is 1 (negative dims "inherit" the other side's positive
/// value); output dim is `max(x, y)`. Returns `None` on incompatibility.
/// The result always carries contiguous strides over its shape.
pub fn broadcast(a: &TypeInfo, b: &TypeInfo) -> Option<TypeInfo> {
    let (a_shape, b_shape) = (a.shape(), b.shape());
    let out_rank = a_shape.len().max(b_shape.len());
    let mut out_shape = vec![0i32; out_rank];

    for i in 0..out_rank {
        let a_dim = dim_from_right(a_shape, i);
        let b_dim = dim_from_right(b_shape, i);
        let out_idx = out_rank - 1 - i;
        out_shape[out_idx] = match (a_dim, b_dim) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            (x, y) if x <= 0 => y.max(x),
            (x, y) if y <= 0 => x.max(y),
            _ => return None,
        };
    }

    // Dtype compatibility is left to the caller; broadcasting itself only
    // reasons about shape, so the result keeps `a`'s dtype.
    Some(TypeInfo::contiguous(a.dtype, &out_shape))
}

/// Reads dimension `i` counting from the rightmost axis (`0` = last dim).
/// Missing (shorter-rank) dimensions read as `1`, matching right-aligned
/// NumPy broadcasting.
fn dim_from_right(shape: &[i32], i: usize) -> i32 {
    if i < shape.len() {
        shape[shape.len() - 1 - i]
    } else {
        1
    }
}

/// Projects `tensor`'s native element strides onto `domain`'s rank by
/// right-alignment: a tensor dim of 1 against a larger domain dim becomes
/// stride 0 (broadcast), and missing (smaller-rank) dims become stride 0.
/// This is the single routine that lets the dispatcher walk broadcast
/// inputs as plain strided iteration.
///
/// This is the single authoritative stride-projection behavior this
/// runtime implements — every register's stride binding goes through
/// this routine, so there is exactly one broadcast convention, not two.
pub fn get_broadcast_strides(tensor: &TypeInfo, domain: &TypeInfo) -> [i32; SF_MAX_DIMS] {
    let mut out = [0i32; SF_MAX_DIMS];
    let domain_rank = domain.ndim() as usize;
    let tensor_shape = tensor.shape();
    let tensor_strides = tensor.strides();

    for i in 0..domain_rank {
        // i counts from the right; out is filled left-to-right in domain
        // order, so the index into `out` is the mirrored position.
        let out_idx = domain_rank - 1 - i;
        if i >= tensor_shape.len() {
            out[out_idx] = 0;
            continue;
        }
        let t_pos = tensor_shape.len() - 1 - i;
        let t_dim = tensor_shape[t_pos];
        let d_dim = domain.shape()[domain_rank - 1 - i];
        out[out_idx] = if t_dim == 1 && d_dim != 1 {
            0
        } else {
            tensor_strides[t_pos]
        };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_strides_telescope() {
        let info = TypeInfo::contiguous(DType::F32, &[2, 3, 4]);
        assert_eq!(info.strides(), &[12, 4, 1]);
        assert_eq!(info.element_count(), 24);
        assert!(info.is_contiguous());
    }

    #[test]
    fn scalar_is_scalar() {
        let s = TypeInfo::scalar(DType::F32);
        assert!(s.is_scalar());
        assert_eq!(s.element_count(), 1);
        let ones = TypeInfo::contiguous(DType::I32, &[1, 1, 1]);
        assert!(ones.is_scalar());
    }

    #[test]
    fn normalize_drops_unit_dims() {
        let mut info = TypeInfo::contiguous(DType::F32, &[1, 4, 1, 3]);
        info.normalize();
        assert_eq!(info.shape(), &[4, 3]);
        assert_eq!(info.strides(), &[3, 1]);
    }

    #[test]
    fn broadcast_is_symmetric() {
        let a = TypeInfo::contiguous(DType::F32, &[3, 1, 5]);
        let b = TypeInfo::contiguous(DType::F32, &[4, 5]);
        let ab = broadcast(&a, &b).unwrap();
        let ba = broadcast(&b, &a).unwrap();
        assert_eq!(ab.shape(), &[3, 4, 5]);
        assert_eq!(ab.shape(), ba.shape());
    }

    #[test]
    fn broadcast_rejects_incompatible_shapes() {
        let a = TypeInfo::contiguous(DType::F32, &[2, 3]);
        let b = TypeInfo::contiguous(DType::F32, &[4, 3]);
        assert!(broadcast(&a, &b).is_none());
    }

    #[test]
    fn scalar_broadcast_strides_are_all_zero() {
        let scalar = TypeInfo::scalar(DType::F32);
        let domain = TypeInfo::contiguous(DType::F32, &[4, 5, 6]);
        let strides = get_broadcast_strides(&scalar, &domain);
        assert_eq!(&strides[..3], &[0, 0, 0]);
    }

    #[test]
    fn broadcast_strides_right_align_and_zero_unit_dims() {
        // tensor is [5] (a row vector), domain is [3, 5]: dim 0 (size 3)
        // has no counterpart in tensor -> stride 0; dim 1 matches -> stride 1.
        let tensor = TypeInfo::contiguous(DType::F32, &[5]);
        let domain = TypeInfo::contiguous(DType::F32, &[3, 5]);
        let strides = get_broadcast_strides(&tensor, &domain);
        assert_eq!(&strides[..2], &[0, 1]);

        // tensor is [3, 1], domain is [3, 5]: dim 1 broadcasts (1 -> 5) -> stride 0.
        let tensor = TypeInfo::contiguous(DType::F32, &[3, 1]);
        let strides = get_broadcast_strides(&tensor, &domain);
        assert_eq!(&strides[..2], &[5, 0]);
    }
}
