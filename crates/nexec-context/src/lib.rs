// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Execution context primitive for stackful fibers.
//!
//! Everything that touches raw registers or raw stack memory lives in this
//! crate. Callers get an opaque `ExecutionContext` and two switch operations;
//! they never see frame layouts.
//!
//! Components:
//! - `alloc`: stack memory allocators (mmap with guard page, heap, host hooks)
//! - `stack`: owned stack regions with base/limit bounds
//! - `arch`: per-architecture register frames, trampolines, switch routines
//! - `context`: `ExecutionContext`: create/anchor/destroy/full_switch/quick_switch

#[cfg(not(any(
    all(target_arch = "x86_64", unix),
    all(target_arch = "aarch64", unix)
)))]
compile_error!("nexec-context supports x86_64 and aarch64 on Unix-like targets only");

pub mod alloc;
mod arch;
pub mod context;
pub mod error;
pub mod stack;

pub use alloc::{HeapStackAllocator, HookStackAllocator, MmapStackAllocator, StackAllocator};
pub use context::{EntryFn, ExecutionContext};
pub use error::ContextError;
pub use stack::{Stack, MIN_STACK_SIZE, STACK_ALIGN};
