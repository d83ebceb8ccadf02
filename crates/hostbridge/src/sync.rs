//! Atomics used by the completion claim, swapped for loom's under `--cfg loom`.

#[cfg(loom)]
pub use loom::sync::atomic::{AtomicU8, Ordering};

#[cfg(not(loom))]
pub use std::sync::atomic::{AtomicU8, Ordering};
