//! A task is one execution unit within a program: a contiguous run of
//! instructions sharing a single iteration domain and dispatch strategy.

use crate::opcodes::DispatchStrategy;

/// `sf_task`: `start_inst..start_inst+inst_count` run once per element of
/// the domain defined by `domain_reg`, using `strategy`'s dispatch loop.
#[derive(Debug, Clone, Copy)]
pub struct Task {
    pub start_inst: u32,
    pub inst_count: u32,
    pub domain_reg: u32,
    pub strategy: DispatchStrategy,
    /// Offset into the program's flat binding table.
    pub binding_offset: u32,
    pub binding_count: u32,
}

impl Task {
    pub fn instruction_range(&self) -> std::ops::Range<usize> {
        self.start_inst as usize..(self.start_inst + self.inst_count) as usize
    }

    pub fn binding_range(&self) -> std::ops::Range<usize> {
        self.binding_offset as usize..(self.binding_offset + self.binding_count) as usize
    }
}

/// Decodes the wire-format strategy byte (`sf_dispatch_strategy`).
pub fn strategy_from_u8(value: u8) -> Option<DispatchStrategy> {
    match value {
        0 => Some(DispatchStrategy::Default),
        1 => Some(DispatchStrategy::Reduction),
        2 => Some(DispatchStrategy::TwoPassSync),
        _ => None,
    }
}
