//! Opcode metadata: the per-opcode table the compiler and dispatcher both
//! consult to decide how an instruction's operands are typed, shaped, and
//! iterated. Lazily built once and shared across every call site.

use std::sync::OnceLock;

use bitflags::bitflags;

use crate::types::SF_OP_LIMIT;

/// Broad grouping of what an opcode computes (`sf_op_category`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCategory {
    Core,
    Array,
    State,
}

/// Which dispatch loop an opcode is run under (`sf_dispatch_strategy`).
/// See [`crate::exec::dispatch`] for the three implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStrategy {
    /// Independent, embarrassingly parallel element-wise work.
    Default,
    /// Per-tile partial accumulation, merged by the caller after the batch.
    Reduction,
    /// Local reduce, barrier, single-threaded prefix sweep, then apply.
    TwoPassSync,
}

/// How an opcode's operands are walked relative to the execution domain
/// (`sf_access_pattern`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPattern {
    /// Every operand is read/written element-wise at the domain index.
    Elementwise,
    /// Operand is a whole-tensor view independent of the domain index
    /// (e.g. a reduction accumulator).
    Whole,
}

/// Output-shape derivation rule (`sf_shape_rule`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeRule {
    /// Output shape equals the (broadcast) input shape.
    SameAsInput,
    /// Output shape is whatever the compiler already resolved for `dest`.
    Explicit,
}

/// Output dtype derivation rule (`sf_out_rule`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutRule {
    /// Output dtype equals the (first) input dtype.
    SameAsInput,
    /// Output dtype is whatever the compiler already resolved for `dest`.
    Explicit,
}

bitflags! {
    /// Per-opcode behavioral flags (`SF_OP_FLAG_*`).
    pub struct OpFlags: u16 {
        const SPATIAL     = 1 << 0;
        const REDUCER     = 1 << 1;
        const GENERATOR   = 1 << 2;
        const MEMORY      = 1 << 3;
        const FORCE_DOM   = 1 << 4;
        const COMMUTATIVE = 1 << 5;
        const ASSOCIATIVE = 1 << 6;
    }
}

/// Static, per-opcode metadata row (`sf_op_metadata`). `ports` names the
/// meaning of `src1..src4` for documentation/disassembly purposes; arity
/// is how many of them are actually read.
#[derive(Debug, Clone, Copy)]
pub struct OpMetadata {
    pub name: &'static str,
    pub category: OpCategory,
    pub strategy: DispatchStrategy,
    pub shape_rule: ShapeRule,
    pub out_rule: OutRule,
    pub access: AccessPattern,
    pub ports: [&'static str; 4],
    pub arity: u8,
    pub flags: OpFlags,
}

/// Built-in opcodes this runtime ships kernels for. Non-exhaustive: a real
/// cartridge's compiler may emit opcodes outside this demonstration set,
/// which [`crate::kernel::registry`] will simply fail to resolve at bake
/// time (`SfError::InvalidOp`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    Add = 1,
    Mul = 2,
    Copy = 3,
    Sum = 4,
    CumSum = 5,
    Transpose = 6,
    FillIndex = 7,
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Opcode::Add),
            2 => Some(Opcode::Mul),
            3 => Some(Opcode::Copy),
            4 => Some(Opcode::Sum),
            5 => Some(Opcode::CumSum),
            6 => Some(Opcode::Transpose),
            7 => Some(Opcode::FillIndex),
            _ => None,
        }
    }
}

static METADATA_TABLE: OnceLock<Vec<Option<OpMetadata>>> = OnceLock::new();

fn build_table() -> Vec<Option<OpMetadata>> {
    let mut table: Vec<Option<OpMetadata>> = vec![None; SF_OP_LIMIT as usize];

    let mut set = |op: Opcode, meta: OpMetadata| {
        table[op as usize] = Some(meta);
    };

    set(
        Opcode::Add,
        OpMetadata {
            name: "add",
            category: OpCategory::Core,
            strategy: DispatchStrategy::Default,
            shape_rule: ShapeRule::SameAsInput,
            out_rule: OutRule::SameAsInput,
            access: AccessPattern::Elementwise,
            ports: ["lhs", "rhs", "", ""],
            arity: 2,
            flags: OpFlags::COMMUTATIVE | OpFlags::ASSOCIATIVE,
        },
    );
    set(
        Opcode::Mul,
        OpMetadata {
            name: "mul",
            category: OpCategory::Core,
            strategy: DispatchStrategy::Default,
            shape_rule: ShapeRule::SameAsInput,
            out_rule: OutRule::SameAsInput,
            access: AccessPattern::Elementwise,
            ports: ["lhs", "rhs", "", ""],
            arity: 2,
            flags: OpFlags::COMMUTATIVE | OpFlags::ASSOCIATIVE,
        },
    );
    set(
        Opcode::Copy,
        OpMetadata {
            name: "copy",
            category: OpCategory::Core,
            strategy: DispatchStrategy::Default,
            shape_rule: ShapeRule::SameAsInput,
            out_rule: OutRule::SameAsInput,
            access: AccessPattern::Elementwise,
            ports: ["src", "", "", ""],
            arity: 1,
            flags: OpFlags::empty(),
        },
    );
    set(
        Opcode::Sum,
        OpMetadata {
            name: "sum",
            category: OpCategory::Array,
            strategy: DispatchStrategy::Reduction,
            shape_rule: ShapeRule::Explicit,
            out_rule: OutRule::SameAsInput,
            access: AccessPattern::Whole,
            ports: ["src", "", "", ""],
            arity: 1,
            flags: OpFlags::REDUCER | OpFlags::ASSOCIATIVE | OpFlags::COMMUTATIVE,
        },
    );
    set(
        Opcode::CumSum,
        OpMetadata {
            name: "cumsum",
            category: OpCategory::Array,
            strategy: DispatchStrategy::TwoPassSync,
            shape_rule: ShapeRule::SameAsInput,
            out_rule: OutRule::SameAsInput,
            access: AccessPattern::Elementwise,
            ports: ["src", "", "", ""],
            arity: 1,
            flags: OpFlags::SPATIAL,
        },
    );
    set(
        Opcode::Transpose,
        OpMetadata {
            name: "transpose",
            category: OpCategory::Array,
            strategy: DispatchStrategy::Default,
            shape_rule: ShapeRule::Explicit,
            out_rule: OutRule::SameAsInput,
            access: AccessPattern::Elementwise,
            ports: ["src", "", "", ""],
            arity: 1,
            flags: OpFlags::SPATIAL,
        },
    );
    set(
        Opcode::FillIndex,
        OpMetadata {
            name: "fill_index",
            category: OpCategory::State,
            strategy: DispatchStrategy::Default,
            shape_rule: ShapeRule::Explicit,
            out_rule: OutRule::Explicit,
            access: AccessPattern::Elementwise,
            ports: ["", "", "", ""],
            arity: 0,
            flags: OpFlags::GENERATOR,
        },
    );

    table
}

/// Returns metadata for `opcode`, lazily building the table on first use.
pub fn metadata(opcode: u16) -> Option<&'static OpMetadata> {
    let table = METADATA_TABLE.get_or_init(build_table);
    table.get(opcode as usize).and_then(|m| m.as_ref())
}

/// Human-readable name for `opcode`, `"UNKNOWN"` if unregistered.
pub fn name(opcode: u16) -> &'static str {
    metadata(opcode).map(|m| m.name).unwrap_or("UNKNOWN")
}
