// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Execution contexts and the two switch operations.
//!
//! A context is either stack-owning (created for a fiber, starts at an entry
//! function) or an anchor (a slot for the state of an execution that is
//! already running, such as the thread's own stack or a resumer). The saved
//! register frame lives on the context's stack at `sp`; the context itself
//! only records where.

use std::ffi::c_void;
use std::fmt;
use std::ptr;
use std::sync::Arc;

use crate::alloc::StackAllocator;
use crate::arch;
use crate::error::ContextError;
use crate::stack::Stack;

/// First function executed on a fresh context. Receives the `arg` given at
/// creation and must never return; leave the context by switching away.
pub type EntryFn = unsafe extern "C" fn(arg: *mut c_void) -> !;

/// Saved execution state plus the stack it runs on.
pub struct ExecutionContext {
    /// Stack pointer at the last save. Zero for an anchor that was never
    /// switched away from.
    sp: usize,
    stack: Option<Stack>,
}

impl ExecutionContext {
    /// Allocate a stack of at least `stack_size` bytes and prepare it so the
    /// first switch into the context calls `entry(arg)`.
    pub fn create(
        allocator: Arc<dyn StackAllocator>,
        stack_size: usize,
        entry: EntryFn,
        arg: *mut c_void,
    ) -> Result<Self, ContextError> {
        let stack = Stack::new(allocator, stack_size)?;
        Ok(Self::on_stack(stack, entry, arg))
    }

    /// Prepare an already allocated stack.
    pub fn on_stack(stack: Stack, entry: EntryFn, arg: *mut c_void) -> Self {
        assert!(
            stack.size() > arch::FRAME_SIZE,
            "stack of {} bytes cannot hold a register frame",
            stack.size()
        );
        // SAFETY: base() is 16-byte aligned and the region below it is ours.
        let sp = unsafe { arch::init_frame(stack.base(), entry, arg) };
        Self {
            sp,
            stack: Some(stack),
        }
    }

    /// A context standing for the execution that is currently running.
    /// Becomes valid to switch into once something switched away from it.
    pub const fn anchor() -> Self {
        Self { sp: 0, stack: None }
    }

    pub fn is_anchor(&self) -> bool {
        self.stack.is_none()
    }

    pub fn stack(&self) -> Option<&Stack> {
        self.stack.as_ref()
    }

    /// Highest address of the owned stack.
    pub fn stack_base(&self) -> Option<*mut u8> {
        self.stack.as_ref().map(Stack::base)
    }

    /// Lowest usable address of the owned stack.
    pub fn stack_limit(&self) -> Option<*mut u8> {
        self.stack.as_ref().map(Stack::limit)
    }

    /// Size of the owned stack; zero for anchors.
    pub fn stack_size(&self) -> usize {
        self.stack.as_ref().map_or(0, Stack::size)
    }

    /// Release the stack.
    ///
    /// Panics if called while executing on this context's own stack.
    pub fn destroy(self) {
        if let Some(stack) = &self.stack {
            assert!(
                !stack.contains(arch::current_stack_pointer()),
                "destroying the execution context that is currently running"
            );
        }
        drop(self);
    }

    /// Save the current execution into `from` and continue in `to`.
    ///
    /// Returns when some other execution switches back into `from`, which
    /// may be through an entirely different call path than the one that
    /// reached this call.
    ///
    /// # Safety
    /// - `from` must be the context describing the execution making the call.
    /// - `to` must be a fresh context or one saved by an earlier switch, must
    ///   not be running anywhere, and must have been saved on this OS thread.
    /// - Neither pointer may be freed until control comes back to `from`.
    pub unsafe fn full_switch(from: *mut ExecutionContext, to: *const ExecutionContext) {
        let to_sp = (*to).sp;
        debug_assert_ne!(to_sp, 0, "switching into an anchor that was never saved");
        arch::switch_stack(ptr::addr_of_mut!((*from).sp), to_sp);
    }

    /// Switch used to return to a known resumer (yield and termination).
    ///
    /// Preserves the same callee-saved register set as `full_switch`; both
    /// kinds share one frame layout, so a context saved by either may be
    /// restored by either.
    ///
    /// # Safety
    /// Same contract as [`ExecutionContext::full_switch`]. In addition `to`
    /// must be the context that last switched into `from`.
    #[inline]
    pub unsafe fn quick_switch(from: *mut ExecutionContext, to: *const ExecutionContext) {
        let to_sp = (*to).sp;
        debug_assert_ne!(to_sp, 0, "returning to a resumer that never switched away");
        arch::switch_stack(ptr::addr_of_mut!((*from).sp), to_sp);
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("sp", &(self.sp as *const u8))
            .field("stack", &self.stack)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{HeapStackAllocator, MmapStackAllocator};
    use std::hint::black_box;
    use std::ptr::NonNull;

    fn mmap() -> Arc<dyn StackAllocator> {
        Arc::new(MmapStackAllocator::new())
    }

    struct PingPong {
        main: ExecutionContext,
        worker: ExecutionContext,
        observed: u64,
    }

    unsafe extern "C" fn ping_pong_entry(arg: *mut c_void) -> ! {
        let pp = arg as *mut PingPong;
        // Lives on the worker stack; survives every switch.
        let mut local = 0u64;
        loop {
            local += 10;
            (*pp).observed = local;
            ExecutionContext::quick_switch(
                ptr::addr_of_mut!((*pp).worker),
                ptr::addr_of!((*pp).main),
            );
        }
    }

    fn ping_pong(allocator: Arc<dyn StackAllocator>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let pp = Box::into_raw(Box::new(PingPong {
            main: ExecutionContext::anchor(),
            worker: ExecutionContext::anchor(),
            observed: 0,
        }));
        unsafe {
            (*pp).worker =
                ExecutionContext::create(allocator, 0, ping_pong_entry, pp as *mut c_void)
                    .unwrap();
            for round in 1..=3u64 {
                ExecutionContext::full_switch(
                    ptr::addr_of_mut!((*pp).main),
                    ptr::addr_of!((*pp).worker),
                );
                assert_eq!((*pp).observed, round * 10);
            }
            drop(Box::from_raw(pp));
        }
    }

    #[test]
    fn fresh_context_runs_entry_and_keeps_its_stack() {
        ping_pong(mmap());
    }

    #[test]
    fn heap_stacks_switch_too() {
        ping_pong(Arc::new(HeapStackAllocator));
    }

    #[test]
    fn caller_locals_survive_switches() {
        let ints = black_box([0x1111u64, 0x2222, 0x3333, 0x4444, 0x5555, 0x6666]);
        let floats = black_box([1.5f64, -2.25, 3.125, 1e300, -0.0, 42.0, 7.75, 0.1]);
        let (a, b, c) = (black_box(11u64), black_box(22u64), black_box(2.5f64));

        ping_pong(mmap());

        assert_eq!(black_box(a) + black_box(b), 33);
        assert_eq!(black_box(c) * 2.0, 5.0);
        assert_eq!(black_box(ints), [0x1111, 0x2222, 0x3333, 0x4444, 0x5555, 0x6666]);
        assert_eq!(black_box(floats), [1.5, -2.25, 3.125, 1e300, -0.0, 42.0, 7.75, 0.1]);
    }

    #[test]
    fn anchor_has_no_stack() {
        let anchor = ExecutionContext::anchor();
        assert!(anchor.is_anchor());
        assert_eq!(anchor.stack_size(), 0);
        assert!(anchor.stack_base().is_none());
        assert!(anchor.stack_limit().is_none());
        anchor.destroy();
    }

    #[test]
    fn created_context_reports_bounds() {
        let ctx = ExecutionContext::create(mmap(), 128 * 1024, ping_pong_entry, ptr::null_mut())
            .unwrap();
        assert!(!ctx.is_anchor());
        assert!(ctx.stack_size() >= 128 * 1024);
        let base = ctx.stack_base().unwrap() as usize;
        let limit = ctx.stack_limit().unwrap() as usize;
        assert!(base > limit);
        assert!(base - limit <= ctx.stack_size());
        ctx.destroy();
    }

    #[derive(Debug)]
    struct Exhausted;

    impl StackAllocator for Exhausted {
        fn allocate(&self, _size: usize) -> Option<NonNull<u8>> {
            None
        }

        unsafe fn deallocate(&self, _ptr: NonNull<u8>, _size: usize) {}
    }

    #[test]
    fn create_reports_out_of_memory() {
        let err = ExecutionContext::create(
            Arc::new(Exhausted),
            64 * 1024,
            ping_pong_entry,
            ptr::null_mut(),
        )
        .unwrap_err();
        assert!(matches!(err, ContextError::OutOfMemory { .. }));
    }
}
