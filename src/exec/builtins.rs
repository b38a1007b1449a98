//! Built-in providers: symbols whose value is synthesized by the runtime
//! itself (e.g. `"host.index.0"`, the per-axis element index) rather than
//! bound to host-supplied data.

/// Built-in identifiers a provider string can resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum BuiltinId {
    None = 0,
    /// The element's coordinate along a given axis of the domain.
    Index = 1,
    /// The tile's linear job index.
    JobIndex = 2,
}

impl BuiltinId {
    fn from_u16(v: u16) -> Self {
        match v {
            1 => BuiltinId::Index,
            2 => BuiltinId::JobIndex,
            _ => BuiltinId::None,
        }
    }
}

const PROVIDERS: &[(&str, BuiltinId)] = &[("host.index", BuiltinId::Index), ("host.job_index", BuiltinId::JobIndex)];

/// Parses a provider string like `"host.index.0"` into a builtin ID and an
/// optional trailing axis. Unknown providers resolve to `BuiltinId::None`
/// with axis `0` as a catch-all fallthrough.
pub fn parse_provider(provider: &str) -> (BuiltinId, u8) {
    if provider.is_empty() {
        return (BuiltinId::None, 0);
    }
    for &(name, id) in PROVIDERS {
        if let Some(rest) = provider.strip_prefix(name) {
            let axis = rest
                .strip_prefix('.')
                .and_then(|digits| digits.parse::<u8>().ok())
                .unwrap_or(0);
            return (id, axis);
        }
    }
    (BuiltinId::None, 0)
}

/// Re-derives a `BuiltinId` from its wire-format numeric tag (as stored in
/// `sf_bin_symbol::builtin_id`), for programs that carry the already
/// resolved ID rather than the provider string.
pub fn builtin_from_tag(tag: u16) -> BuiltinId {
    BuiltinId::from_u16(tag)
}

/// Synthesizes a built-in value for element `coords` of the domain, for
/// the given builtin/axis pair. `job_idx` is the tile's own job index
/// (used by `JobIndex`); `coords` are full domain-rank indices.
pub fn builtin_value(id: BuiltinId, axis: u8, coords: &[u32], job_idx: u32) -> i64 {
    match id {
        BuiltinId::None => 0,
        BuiltinId::Index => coords.get(axis as usize).copied().unwrap_or(0) as i64,
        BuiltinId::JobIndex => job_idx as i64,
    }
}

/// Splits a flattened, row-major index back into per-axis coordinates
/// against `shape` (last axis fastest-changing), the inverse of the walk
/// `TypeInfo::recompute_strides` lays out. Non-positive dims count as 1,
/// matching `calc_count`/`recompute_strides`.
pub fn decompose_row_major(flat: u32, shape: &[i32]) -> Vec<u32> {
    let mut coords = vec![0u32; shape.len()];
    let mut rem = flat;
    for (axis, &dim) in shape.iter().enumerate().rev() {
        let d = if dim > 0 { dim as u32 } else { 1 };
        coords[axis] = rem % d;
        rem /= d;
    }
    coords
}
