// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Owned fiber stack regions.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::alloc::StackAllocator;
use crate::error::ContextError;

/// Alignment of every stack pointer handed to a fresh context.
pub const STACK_ALIGN: usize = 16;

/// Floor for stack sizes. Panic handling and formatting inside a fiber body
/// need a few pages even for trivial bodies.
pub const MIN_STACK_SIZE: usize = 32 * 1024;

/// A stack region obtained from a `StackAllocator`.
///
/// `base()` is the highest address (stacks grow down from it), `limit()` the
/// lowest usable one. Freed through the same allocator when dropped.
pub struct Stack {
    limit: NonNull<u8>,
    size: usize,
    allocator: Arc<dyn StackAllocator>,
}

// The region is plain memory; who may run on it is the context's business.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Allocate a stack of at least `requested` bytes.
    pub fn new(allocator: Arc<dyn StackAllocator>, requested: usize) -> Result<Self, ContextError> {
        let size = rounded_size(requested, allocator.granularity())
            .ok_or(ContextError::StackTooLarge { requested })?;
        let limit = allocator
            .allocate(size)
            .ok_or(ContextError::OutOfMemory { requested: size })?;

        log::trace!("allocated {}-byte fiber stack at {:p}", size, limit);
        Ok(Self {
            limit,
            size,
            allocator,
        })
    }

    /// Highest address of the region, aligned down to `STACK_ALIGN`.
    pub fn base(&self) -> *mut u8 {
        let top = self.limit.as_ptr() as usize + self.size;
        (top & !(STACK_ALIGN - 1)) as *mut u8
    }

    /// Lowest usable address of the region.
    pub fn limit(&self) -> *mut u8 {
        self.limit.as_ptr()
    }

    /// Usable size in bytes after rounding.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether `addr` lies inside this stack.
    pub fn contains(&self, addr: usize) -> bool {
        let low = self.limit.as_ptr() as usize;
        addr >= low && addr < low + self.size
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("base", &self.base())
            .field("limit", &self.limit())
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        log::trace!("freeing {}-byte fiber stack at {:p}", self.size, self.limit);
        unsafe { self.allocator.deallocate(self.limit, self.size) };
    }
}

/// `max(requested, MIN_STACK_SIZE)` rounded up to `granularity` (and never
/// below `STACK_ALIGN`). `None` on overflow.
fn rounded_size(requested: usize, granularity: usize) -> Option<usize> {
    let granularity = granularity.max(STACK_ALIGN);
    debug_assert!(granularity.is_power_of_two());
    let size = requested.max(MIN_STACK_SIZE);
    size.checked_add(granularity - 1)
        .map(|s| s & !(granularity - 1))
}
