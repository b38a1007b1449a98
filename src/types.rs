//! Primitive types shared across the runtime: element data types and the
//! hard capacity constants that size the fixed-capacity arrays used in
//! the hot path (`ExecContext`, `TypeInfo`).

use std::fmt;
use std::str::FromStr;

/// Maximum tensor rank. Shapes and strides are fixed-size `[i32; SF_MAX_DIMS]`
/// arrays rather than `Vec`s so that `TypeInfo` and `ExecContext` can be
/// copied and embedded without allocation on the dispatch hot path.
pub const SF_MAX_DIMS: usize = 8;

/// Maximum number of registers addressable by a single program. Register
/// ids are `u16` on the wire (see [`crate::program::Instruction`]); this
/// cap is well under `u16::MAX` and bounds the size of `ExecContext`'s
/// flat register arrays.
pub const SF_MAX_REGISTERS: usize = 512;

/// Ceiling on opcode values, matching the wire `u16` opcode field's
/// intended range.
pub const SF_OP_LIMIT: u16 = 1024;

/// Element data type. Deliberately small and closed: the runtime never
/// needs to reason about types it doesn't know the byte size of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DType {
    F32 = 1,
    I32 = 2,
    U8 = 3,
}

impl DType {
    /// Size in bytes of one element of this type.
    pub fn size_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::I32 => 4,
            DType::U8 => 1,
        }
    }

    /// Decodes a dtype tag as stored in a cartridge's tensor descriptor.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(DType::F32),
            2 => Some(DType::I32),
            3 => Some(DType::U8),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl FromStr for DType {
    type Err = ();

    /// Case-insensitive parse: `"f32"`, `"i32"`, `"u8"`, `"bool"` (bool
    /// aliases `u8`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f32" => Ok(DType::F32),
            "i32" => Ok(DType::I32),
            "u8" | "bool" => Ok(DType::U8),
            _ => Err(()),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            DType::F32 => "f32",
            DType::I32 => "i32",
            DType::U8 => "u8",
        };
        write!(fmt, "{}", s)
    }
}
