//! Execution machinery: the per-tile [`context::ExecContext`] kernels run
//! against, the three [`dispatch`] strategies that drive it over the
//! thread pool, and [`builtins`] for runtime-synthesized symbols.

pub mod builtins;
pub mod context;
pub mod dispatch;

pub use context::ExecContext;
pub use dispatch::{RegisterBinding, DEFAULT_CHUNK};
