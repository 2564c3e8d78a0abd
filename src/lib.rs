//! Per-CPU slab caches for a memory allocator front-end
//!
//! This crate implements the layer of a malloc-style allocator that sits
//! between threads and the shared transfer cache: per-CPU, per-size-class
//! LIFO stacks of pre-cached object pointers, pushed and popped with no
//! locks (and, where the kernel cooperates, no atomics) on the fast path.
//!
//! The design follows the per-CPU caching scheme described in
//! [the tcmalloc design notes](https://google.github.io/tcmalloc/design.html),
//! built on Linux
//! [restartable sequences](https://man7.org/linux/man-pages/man2/rseq.2.html)
//! with a portable gate-based fallback.
//!
//! The crate deliberately has no opinion about what the cached pointers
//! point at, how objects map to size classes, or where overflowing batches
//! go: all of that arrives through caller-supplied handlers.

pub mod percpu;
#[cfg(not(loom))]
pub mod slab;
#[cfg(not(loom))]
pub mod sys;

mod loom_testing;
#[cfg(not(loom))]
mod util;
