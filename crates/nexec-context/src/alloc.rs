// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Stack memory allocators.
//!
//! The allocator is a capability object handed to the executive manager once,
//! before the first fiber exists. Three implementations ship with the crate:
//! anonymous mappings with a guard page (the default), the global Rust heap,
//! and a pair of host-supplied functions.

use std::alloc::Layout;
use std::fmt;
use std::ptr::{self, NonNull};

use crate::stack::STACK_ALIGN;

/// Source of fiber stack memory.
///
/// `allocate` returns the lowest usable address of a region of at least
/// `size` bytes, or `None` when memory is exhausted. The runtime always
/// passes sizes that are multiples of `granularity()`.
pub trait StackAllocator: Send + Sync + fmt::Debug {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>>;

    /// Release a region previously returned by `allocate`.
    ///
    /// # Safety
    /// `ptr` and `size` must come from a single earlier `allocate` call on
    /// this allocator, and no execution may still be running on the region.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize);

    /// Stack sizes are rounded up to a multiple of this. Must be a power of two.
    fn granularity(&self) -> usize {
        STACK_ALIGN
    }
}

/// Anonymous private mappings with a `PROT_NONE` guard page below the
/// usable region, so an overflowing fiber faults instead of scribbling over
/// its neighbour.
#[derive(Debug, Clone, Copy)]
pub struct MmapStackAllocator {
    page_size: usize,
}

impl MmapStackAllocator {
    pub fn new() -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if page_size > 0 { page_size as usize } else { 4096 };
        Self { page_size }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

impl Default for MmapStackAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK;
#[cfg(not(target_os = "linux"))]
const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

impl StackAllocator for MmapStackAllocator {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let total = size.checked_add(self.page_size)?;
        let region = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_FLAGS,
                -1,
                0,
            )
        };
        if region == libc::MAP_FAILED {
            log::warn!(
                "mmap of {} stack bytes failed: {}",
                total,
                std::io::Error::last_os_error()
            );
            return None;
        }

        // Guard page at the low end; stacks grow down into it.
        if unsafe { libc::mprotect(region, self.page_size, libc::PROT_NONE) } != 0 {
            unsafe { libc::munmap(region, total) };
            return None;
        }

        NonNull::new(unsafe { (region as *mut u8).add(self.page_size) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        let region = ptr.as_ptr().sub(self.page_size);
        if libc::munmap(region as *mut libc::c_void, size + self.page_size) != 0 {
            log::error!(
                "munmap of fiber stack at {:p} failed: {}",
                region,
                std::io::Error::last_os_error()
            );
        }
    }

    fn granularity(&self) -> usize {
        self.page_size
    }
}

/// Stacks from the global Rust allocator. No guard page.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStackAllocator;

impl StackAllocator for HeapStackAllocator {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, STACK_ALIGN).ok()?;
        if layout.size() == 0 {
            return None;
        }
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        let layout = Layout::from_size_align_unchecked(size, STACK_ALIGN);
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }
}

/// Host memory hooks: `allocate(size) -> pointer` and `free(pointer)`.
///
/// A null return from `alloc` is reported as out-of-memory. The host must
/// return memory aligned to at least `STACK_ALIGN`.
#[derive(Clone, Copy)]
pub struct HookStackAllocator {
    alloc: fn(usize) -> *mut u8,
    free: fn(*mut u8),
}

impl HookStackAllocator {
    pub fn new(alloc: fn(usize) -> *mut u8, free: fn(*mut u8)) -> Self {
        Self { alloc, free }
    }
}

impl fmt::Debug for HookStackAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookStackAllocator")
            .field("alloc", &(self.alloc as *const ()))
            .field("free", &(self.free as *const ()))
            .finish()
    }
}

impl StackAllocator for HookStackAllocator {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let ptr = NonNull::new((self.alloc)(size))?;
        debug_assert_eq!(
            ptr.as_ptr() as usize % STACK_ALIGN,
            0,
            "host stack allocator returned misaligned memory"
        );
        Some(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _size: usize) {
        (self.free)(ptr.as_ptr())
    }
}
