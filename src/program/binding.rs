//! A task's bound registers, with byte strides pre-resolved at bake time
//! so the dispatcher never recomputes `stride * dtype_size` per element.

use bitflags::bitflags;

bitflags! {
    pub struct BindingFlags: u16 {
        /// This register is a reduction accumulator for the owning task.
        const REDUCTION = 1 << 0;
    }
}

/// One register's participation in a [`super::task::Task`]
/// (`sf_bin_task_binding`).
#[derive(Debug, Clone, Copy)]
pub struct Binding {
    pub reg_idx: u16,
    pub flags: BindingFlags,
    /// Pre-calculated `stride * size_of(dtype)`, already broadcast-projected
    /// onto the task's domain rank by the compiler.
    pub byte_stride: i32,
}

impl Binding {
    pub fn is_reduction(&self) -> bool {
        self.flags.contains(BindingFlags::REDUCTION)
    }
}
