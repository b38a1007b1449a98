//! The on-the-wire error contract, plus the richer Rust-side error type
//! used internally to carry context before it is projected down to a
//! wire [`ErrorCode`].

use thiserror::Error;

/// Wire-level error kinds. This is the contract exposed across the
/// [`crate::backend::Backend`] boundary and returned by `engine_run`: a
/// single byte-sized enum that a non-Rust host (or a future C ABI) can
/// switch on directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    None = 0,
    Oom = 1,
    ShapeMismatch = 2,
    InvalidOp = 3,
    Runtime = 4,
    OutOfBounds = 5,
}

impl ErrorCode {
    /// Parses an error code back out of its wire representation. Unknown
    /// values map to `Runtime` rather than panicking: a corrupt or
    /// forward-versioned value should degrade, not crash the host.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ErrorCode::None,
            1 => ErrorCode::Oom,
            2 => ErrorCode::ShapeMismatch,
            3 => ErrorCode::InvalidOp,
            5 => ErrorCode::OutOfBounds,
            _ => ErrorCode::Runtime,
        }
    }
}

/// The first offending location recorded alongside a dispatch error: the
/// element index within the tile where the kernel reported failure, and
/// the instruction's source line/column as carried on [`crate::program::Instruction`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorLocation {
    pub element_idx: u32,
    pub line: u16,
    pub column: u16,
}

/// Runtime error type.
///
/// Mirrors the six wire [`ErrorCode`] kinds one-to-one so [`SfError::code`]
/// is a lossless projection, while carrying the context a Rust caller
/// actually wants, wrapping lower-level failures with a `Display` story
/// via `thiserror` (see DESIGN.md).
#[derive(Debug, Error)]
pub enum SfError {
    #[error("allocation failed: requested {requested} bytes")]
    Oom { requested: usize },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("invalid opcode {0}")]
    InvalidOp(u16),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("index out of bounds: {index} (bound {bound})")]
    OutOfBounds { index: usize, bound: usize },

    #[error("cartridge load failed: {0}")]
    Load(String),
}

impl SfError {
    /// Projects this error onto the wire [`ErrorCode`] contract.
    pub fn code(&self) -> ErrorCode {
        match self {
            SfError::Oom { .. } => ErrorCode::Oom,
            SfError::ShapeMismatch(_) => ErrorCode::ShapeMismatch,
            SfError::InvalidOp(_) => ErrorCode::InvalidOp,
            SfError::Runtime(_) => ErrorCode::Runtime,
            SfError::OutOfBounds { .. } => ErrorCode::OutOfBounds,
            SfError::Load(_) => ErrorCode::InvalidOp,
        }
    }
}

pub type Result<T> = std::result::Result<T, SfError>;
