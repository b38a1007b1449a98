//! Process-wide configuration: the typed home for the few knobs a driver
//! would otherwise thread through ad hoc.

use crate::pool::ThreadPoolConfig;

/// Bundles the configuration every engine instance needs at construction.
/// Grows as new ambient concerns (logging sinks, scratch sizing) get a
/// typed home instead of being hardcoded constants.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub thread_pool: ThreadPoolConfig,
    /// Bytes handed to each worker's per-tile scratch arena at bake time.
    pub scratch_bytes_per_worker: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig { thread_pool: ThreadPoolConfig::default(), scratch_bytes_per_worker: 64 * 1024 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_scratch_size() {
        let cfg = EngineConfig::default();
        assert!(cfg.scratch_bytes_per_worker > 0);
        assert!(cfg.thread_pool.num_threads.is_none());
    }
}
