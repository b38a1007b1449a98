//! On-disk metadata for a single register (`sf_bin_tensor_desc`): enough
//! to allocate the register's tensor and, for constants, locate the
//! initial data that follows the descriptor in the PROGRAM section.

use bitflags::bitflags;

use crate::shape::TypeInfo;
use crate::types::{DType, SF_MAX_DIMS};

bitflags! {
    pub struct TensorFlags: u8 {
        const CONSTANT  = 1 << 0;
        const REDUCTION = 1 << 1;
        const GENERATOR = 1 << 2;
        /// Bound to an external (host) resource rather than allocated here.
        const ALIAS     = 1 << 3;
        /// Needs a domain-sized buffer rather than its literal shape.
        const SPATIAL   = 1 << 4;
    }
}

#[derive(Debug, Clone)]
pub struct TensorDesc {
    pub dtype: DType,
    pub ndim: u8,
    pub is_constant: bool,
    pub flags: TensorFlags,
    pub shape: [i32; SF_MAX_DIMS],
    /// Size in bytes of the constant payload following this descriptor;
    /// 0 for an uninitialized register.
    pub data_size: u64,
}

impl TensorDesc {
    pub fn type_info(&self) -> TypeInfo {
        TypeInfo::contiguous(self.dtype, &self.shape[..self.ndim as usize])
    }
}
