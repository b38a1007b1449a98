//! Named resource bindings: the cartridge's map from a host-visible name
//! (or a built-in provider string like `"host.index.0"`) to a register.

use bitflags::bitflags;

bitflags! {
    /// Port-mapping flags (`SF_SYMBOL_FLAG_*`).
    pub struct SymbolFlags: u8 {
        /// Read-only, bound to the front buffer.
        const INPUT  = 1 << 6;
        /// Write-only, bound to the back buffer.
        const OUTPUT = 1 << 7;
    }
}

/// One entry of the program's symbol table (`sf_bin_symbol`).
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub provider: String,
    pub name_hash: u32,
    pub register_idx: u32,
    /// Hash of the input symbol that drives this output's shape, or 0.
    pub related_name_hash: u32,
    pub flags: SymbolFlags,
    pub builtin_id: u16,
    pub builtin_axis: u8,
}

impl Symbol {
    pub fn is_input(&self) -> bool {
        self.flags.contains(SymbolFlags::INPUT)
    }

    pub fn is_output(&self) -> bool {
        self.flags.contains(SymbolFlags::OUTPUT)
    }
}

/// FNV-1a over `name`'s bytes, used for fast symbol lookup via an
/// `FxHashMap<u32, ...>` keyed by this hash rather than the string
/// itself.
pub fn fnv1a_hash(name: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &byte in name.as_bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
