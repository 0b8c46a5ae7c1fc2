// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Stackful cooperative fibers.
//!
//! An [`ExecutiveManager`] owns fibers and the groups they belong to. A
//! fiber runs a closure on its own stack; the caller drives it with
//! [`Fiber::resume`] and the body hands control back with
//! [`Fiber::yield_now`]. Fibers may resume other fibers, so each thread keeps
//! a stack of the fibers currently in progress on it.
//!
//! Scheduling is entirely cooperative. There is no scheduler thread, no
//! preemption, and a fiber never migrates away from the thread that first
//! resumed it.
//!
//! ```no_run
//! use nexec::{ExecutiveManager, Fiber};
//!
//! let mgr = ExecutiveManager::new();
//! let fiber = mgr
//!     .create_fiber(mgr.default_group(), 0, |f: &Fiber| {
//!         for _ in 0..3 {
//!             f.yield_now();
//!         }
//!     })
//!     .unwrap();
//! while !fiber.is_terminated() {
//!     fiber.resume();
//! }
//! ```

pub mod config;
pub mod error;
pub mod fiber;
pub mod group;
pub mod manager;
pub mod thread_stack;

pub use config::{ExecutiveConfig, DEFAULT_STACK_SIZE};
pub use error::ExecutiveError;
pub use fiber::{Fiber, FiberId, FiberStatus};
pub use group::{FiberGroup, GroupId};
pub use manager::ExecutiveManager;
pub use thread_stack::{ActiveFibers, ThreadFiberStack};

pub use nexec_context::{
    ContextError, HeapStackAllocator, HookStackAllocator, MmapStackAllocator, StackAllocator,
    MIN_STACK_SIZE,
};
