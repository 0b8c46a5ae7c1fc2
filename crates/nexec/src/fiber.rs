// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fibers: a stack-owning execution context plus lifecycle status.
//!
//! Status moves SUSPENDED → RUNNING on `resume`, RUNNING → SUSPENDED on
//! `yield_now`, and RUNNING → TERMINATED when the body returns. The group
//! and the manager may also move a fiber that is not running straight to
//! TERMINATED; nothing leaves TERMINATED.

use std::any::Any;
use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use nexec_context::{ExecutionContext, Stack};

use crate::group::GroupId;
use crate::thread_stack::ThreadRegistry;

/// Fiber lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FiberStatus {
    /// Executing on some thread's stack (possibly with nested fibers above it).
    Running = 0,
    /// Created and not yet started, or parked at a `yield_now`.
    Suspended = 1,
    /// Body returned, or force-terminated. Final.
    Terminated = 2,
}

impl FiberStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::Suspended,
            _ => Self::Terminated,
        }
    }
}

/// Manager-unique fiber identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(pub(crate) u64);

impl FiberId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) type FiberBody = Box<dyn FnOnce(&Fiber) + Send>;
pub(crate) type TerminationCallback = Box<dyn FnOnce(&Fiber) + Send>;
type PanicPayload = Box<dyn Any + Send>;

/// A cooperatively scheduled execution with its own stack.
///
/// Created by [`ExecutiveManager::create_fiber`](crate::ExecutiveManager::create_fiber)
/// in the SUSPENDED state. Drive it with [`resume`](Fiber::resume) until
/// [`is_terminated`](Fiber::is_terminated); inside the body, give control
/// back with [`yield_now`](Fiber::yield_now).
pub struct Fiber {
    id: FiberId,
    status: AtomicU8,
    /// The fiber's own saved state.
    callee: UnsafeCell<ExecutionContext>,
    /// Saved state of whoever resumed the fiber. Meaningful only while RUNNING.
    runtime: UnsafeCell<ExecutionContext>,
    stack_released: AtomicBool,
    stack_size: usize,
    body: Mutex<Option<FiberBody>>,
    on_terminate: Mutex<Option<TerminationCallback>>,
    /// Panic raised by the body or termination callback, re-raised by `resume`.
    panic: Mutex<Option<PanicPayload>>,
    resumed_at: Mutex<Option<Instant>>,
    time_slice: Mutex<Option<Duration>>,
    group: Mutex<Option<GroupId>>,
    /// Thread of the first resume. Saved frames are only valid there.
    home: OnceLock<ThreadId>,
    threads: Arc<ThreadRegistry>,
}

// SAFETY: the two contexts and the stack are only touched on the fiber's
// home thread. `home` is claimed once, by the first `resume` or the first
// forced termination, and both operations refuse every other thread. On the
// home thread the fiber is either executing (and then on that thread's
// active-fiber stack, or inside `yield_now`/`finish` with no user code left
// to run) or parked in `callee`, so a destroyer there can never overlap code
// running on the stack. `stack_released` makes the release a one-shot.
// Everything else is atomic or behind a mutex.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    pub(crate) fn new(
        id: FiberId,
        stack: Stack,
        body: FiberBody,
        on_terminate: Option<TerminationCallback>,
        threads: Arc<ThreadRegistry>,
    ) -> Arc<Self> {
        let stack_size = stack.size();
        Arc::new_cyclic(|weak| {
            // Address of the allocation under construction; fixed for the
            // fiber's lifetime.
            let arg = weak.as_ptr() as *mut c_void;
            Fiber {
                id,
                status: AtomicU8::new(FiberStatus::Suspended as u8),
                callee: UnsafeCell::new(ExecutionContext::on_stack(stack, fiber_entry, arg)),
                runtime: UnsafeCell::new(ExecutionContext::anchor()),
                stack_released: AtomicBool::new(false),
                stack_size,
                body: Mutex::new(Some(body)),
                on_terminate: Mutex::new(on_terminate),
                panic: Mutex::new(None),
                resumed_at: Mutex::new(None),
                time_slice: Mutex::new(None),
                group: Mutex::new(None),
                home: OnceLock::new(),
                threads,
            }
        })
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn status(&self) -> FiberStatus {
        FiberStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.status() == FiberStatus::Running
    }

    pub fn is_suspended(&self) -> bool {
        self.status() == FiberStatus::Suspended
    }

    pub fn is_terminated(&self) -> bool {
        self.status() == FiberStatus::Terminated
    }

    /// Group the fiber currently belongs to.
    pub fn group(&self) -> Option<GroupId> {
        *self.group.lock().unwrap()
    }

    /// When the fiber was last resumed. `None` until the first resume.
    pub fn resumed_at(&self) -> Option<Instant> {
        *self.resumed_at.lock().unwrap()
    }

    /// Budget consulted by [`yield_proc`](Fiber::yield_proc).
    pub fn time_slice(&self) -> Option<Duration> {
        *self.time_slice.lock().unwrap()
    }

    /// Usable stack size after rounding.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Thread the fiber is bound to, once it has been resumed.
    pub fn home_thread(&self) -> Option<ThreadId> {
        self.home.get().copied()
    }

    /// Whether this fiber is the innermost running fiber of the calling thread.
    pub fn is_current_on_stack(&self) -> bool {
        self.threads.current().is_top(self)
    }

    /// Run the fiber until it yields or terminates.
    ///
    /// No-op unless SUSPENDED. Panics if the fiber was first resumed on a
    /// different thread. A panic raised by the body (or by the termination
    /// callback) is re-raised here, after the fiber has terminated.
    pub fn resume(self: &Arc<Self>) {
        if self.status() != FiberStatus::Suspended {
            return;
        }

        let current = thread::current().id();
        let home = *self.home.get_or_init(|| current);
        assert!(
            home == current,
            "fiber {} belongs to thread {:?} and cannot be resumed from {:?}",
            self.id,
            home,
            current
        );

        if self
            .status
            .compare_exchange(
                FiberStatus::Suspended as u8,
                FiberStatus::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        *self.resumed_at.lock().unwrap() = Some(Instant::now());
        self.threads.current().push(Arc::clone(self));

        log::trace!("resuming fiber {}", self.id);
        // SAFETY: we are on the home thread and won RUNNING, so nothing else
        // touches the contexts until the fiber switches back into `runtime`.
        unsafe { ExecutionContext::full_switch(self.runtime.get(), self.callee.get()) };

        let payload = self.panic.lock().unwrap().take();
        if let Some(payload) = payload {
            panic::resume_unwind(payload);
        }
    }

    /// Suspend the fiber and return control to its resumer.
    ///
    /// Must be called from the fiber's own body. Panics if the fiber is not
    /// RUNNING or is not the innermost running fiber of the calling thread.
    pub fn yield_now(&self) {
        assert!(
            self.is_running(),
            "fiber {} cannot yield while {:?}",
            self.id,
            self.status()
        );
        {
            let stack = self.threads.current();
            assert!(
                stack.is_top(self),
                "fiber {} yielded but is not on top of this thread's active-fiber stack",
                self.id
            );
            stack.pop();
        }

        self.status
            .store(FiberStatus::Suspended as u8, Ordering::Release);

        log::trace!("fiber {} yielding", self.id);
        // SAFETY: we are running on `callee` and `runtime` holds the resumer
        // that switched into us on this thread.
        unsafe { ExecutionContext::quick_switch(self.callee.get(), self.runtime.get()) };
    }

    /// Yield only once the fiber has used up its time slice since the last
    /// resume. Returns whether it yielded. Without a time slice this never
    /// yields.
    pub fn yield_proc(&self) -> bool {
        let Some(slice) = self.time_slice() else {
            return false;
        };
        let elapsed = self
            .resumed_at()
            .map_or(Duration::ZERO, |at| at.elapsed());
        if elapsed < slice {
            return false;
        }
        self.yield_now();
        true
    }

    pub(crate) fn set_group(&self, group: Option<GroupId>) {
        *self.group.lock().unwrap() = group;
    }

    pub(crate) fn set_time_slice(&self, slice: Option<Duration>) {
        *self.time_slice.lock().unwrap() = slice;
    }

    /// Whether the calling thread may destroy the fiber right now. See
    /// [`assert_destroyable`](Fiber::assert_destroyable).
    pub(crate) fn is_destroyable_here(&self) -> bool {
        !self.is_running()
            && self.home.get().is_none_or(|home| *home == thread::current().id())
            && !self.threads.current().contains(self)
    }

    /// Panics unless the calling thread may destroy the fiber: it is not
    /// RUNNING, it was not resumed on another thread, and it is not still
    /// executing on this thread (a termination callback runs on the fiber's
    /// own stack after the status became TERMINATED).
    pub(crate) fn assert_destroyable(&self) {
        assert!(
            !self.is_running(),
            "fiber {} cannot be destroyed while running",
            self.id
        );
        let current = thread::current().id();
        if let Some(home) = self.home.get() {
            assert!(
                *home == current,
                "fiber {} belongs to thread {:?} and cannot be destroyed from {:?}",
                self.id,
                home,
                current
            );
        }
        assert!(
            !self.threads.current().contains(self),
            "fiber {} cannot be destroyed from its own termination callback",
            self.id
        );
    }

    /// Terminate without running the body further and release the stack.
    ///
    /// The termination callback does not fire. Frames of a body that already
    /// started are abandoned, not unwound. Returns true if the fiber was
    /// SUSPENDED (false if it had already terminated).
    ///
    /// A fiber that was never resumed becomes bound to the calling thread,
    /// so a concurrent first `resume` elsewhere is refused.
    pub(crate) fn force_terminate(&self) -> bool {
        let current = thread::current().id();
        self.home.get_or_init(|| current);
        self.assert_destroyable();
        let was_suspended = match self.status.compare_exchange(
            FiberStatus::Suspended as u8,
            FiberStatus::Terminated as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(prev) if FiberStatus::from_u8(prev) == FiberStatus::Running => {
                panic!("fiber {} cannot be destroyed while running", self.id)
            }
            Err(_) => false,
        };

        drop(self.body.lock().unwrap().take());
        drop(self.on_terminate.lock().unwrap().take());

        if !self.stack_released.swap(true, Ordering::AcqRel) {
            // SAFETY: TERMINATED is final, we are on the home thread and the
            // fiber is not on its active-fiber stack, so nothing runs on or
            // switches into `callee`.
            let context = unsafe { mem::replace(&mut *self.callee.get(), ExecutionContext::anchor()) };
            context.destroy();
        }

        if was_suspended {
            log::debug!("fiber {} force-terminated", self.id);
        }
        was_suspended
    }

    /// Body of the fiber's own stack.
    fn run(&self) -> ! {
        let body = self.body.lock().unwrap().take();
        if let Some(body) = body {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| body(self))) {
                self.stash_panic(payload);
            }
        }
        self.finish()
    }

    /// Natural termination. Never returns into the fiber's stack.
    fn finish(&self) -> ! {
        self.status
            .store(FiberStatus::Terminated as u8, Ordering::Release);

        let callback = self.on_terminate.lock().unwrap().take();
        if let Some(callback) = callback {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(self))) {
                self.stash_panic(payload);
            }
        }

        {
            let popped = self.threads.current().pop();
            assert!(
                popped.is_some_and(|top| std::ptr::eq(Arc::as_ptr(&top), self)),
                "fiber {} terminated but was not on top of its thread's active-fiber stack",
                self.id
            );
        }

        log::trace!("fiber {} terminated", self.id);
        // SAFETY: same as `yield_now`; TERMINATED guarantees nobody switches
        // back into `callee`.
        unsafe { ExecutionContext::quick_switch(self.callee.get(), self.runtime.get()) };
        // Unreachable: a terminated fiber is never resumed.
        std::process::abort()
    }

    /// Keep the first panic; later ones (e.g. from the callback) are dropped.
    fn stash_panic(&self, payload: PanicPayload) {
        let mut slot = self.panic.lock().unwrap();
        if slot.is_none() {
            *slot = Some(payload);
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("group", &self.group())
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

/// First function on every fiber stack.
unsafe extern "C" fn fiber_entry(arg: *mut c_void) -> ! {
    // SAFETY: `arg` is the fiber's own address, kept alive by the resumer's
    // `Arc` and the active-fiber stack entry for as long as it runs.
    let fiber = &*(arg as *const Fiber);
    fiber.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ExecutiveManager;
    use std::sync::atomic::AtomicUsize;

    fn manager() -> ExecutiveManager {
        let _ = env_logger::builder().is_test(true).try_init();
        ExecutiveManager::new()
    }

    #[test]
    fn status_sequence_is_suspended_running_terminated() {
        let mgr = manager();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let fiber = mgr
            .create_fiber(mgr.default_group(), 0, move |f: &Fiber| {
                s.lock().unwrap().push(f.status());
                f.yield_now();
                s.lock().unwrap().push(f.status());
            })
            .unwrap();

        assert_eq!(fiber.status(), FiberStatus::Suspended);
        fiber.resume();
        assert_eq!(fiber.status(), FiberStatus::Suspended);
        fiber.resume();
        assert_eq!(fiber.status(), FiberStatus::Terminated);
        fiber.resume();
        assert_eq!(fiber.status(), FiberStatus::Terminated);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![FiberStatus::Running, FiberStatus::Running]
        );
    }

    #[test]
    fn fiber_locals_survive_yields() {
        let mgr = manager();
        let out = Arc::new(AtomicUsize::new(0));
        let o = out.clone();
        let fiber = mgr
            .create_fiber(mgr.default_group(), 0, move |f: &Fiber| {
                let mut acc = Vec::new();
                for i in 1..=4 {
                    acc.push(i * i);
                    o.store(acc.iter().sum(), Ordering::SeqCst);
                    f.yield_now();
                }
            })
            .unwrap();

        let expected = [1, 5, 14, 30];
        for want in expected {
            fiber.resume();
            assert_eq!(out.load(Ordering::SeqCst), want);
        }
        fiber.resume();
        assert!(fiber.is_terminated());
    }

    #[test]
    fn resume_records_timestamp_and_home_thread() {
        let mgr = manager();
        let fiber = mgr
            .create_fiber(mgr.default_group(), 0, |f: &Fiber| f.yield_now())
            .unwrap();
        assert!(fiber.resumed_at().is_none());
        assert!(fiber.home_thread().is_none());

        let before = Instant::now();
        fiber.resume();
        assert!(fiber.resumed_at().unwrap() >= before);
        assert_eq!(fiber.home_thread(), Some(thread::current().id()));
        fiber.resume();
    }

    #[test]
    fn resume_from_another_thread_is_rejected() {
        let mgr = manager();
        let fiber = mgr
            .create_fiber(mgr.default_group(), 0, |f: &Fiber| f.yield_now())
            .unwrap();
        fiber.resume();

        let remote = fiber.clone();
        let result = thread::spawn(move || remote.resume()).join();
        assert!(result.is_err());
        assert!(fiber.is_suspended());

        fiber.resume();
        assert!(fiber.is_terminated());
    }

    #[test]
    fn body_panic_terminates_and_resurfaces_from_resume() {
        let mgr = manager();
        let callbacks = Arc::new(AtomicUsize::new(0));
        let c = callbacks.clone();
        let fiber = mgr
            .create_fiber_with(
                mgr.default_group(),
                0,
                |_: &Fiber| panic!("boom inside fiber"),
                move |_: &Fiber| {
                    c.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();

        let result = panic::catch_unwind(AssertUnwindSafe(|| fiber.resume()));
        let payload = result.unwrap_err();
        let msg = payload.downcast_ref::<&str>().copied().unwrap_or_default();
        assert!(msg.contains("boom inside fiber"));
        assert!(fiber.is_terminated());
        assert_eq!(callbacks.load(Ordering::SeqCst), 1);
        assert!(mgr.current_stack().is_empty());
    }

    #[test]
    fn yield_from_outside_the_fiber_is_rejected() {
        let mgr = manager();
        let fiber = mgr
            .create_fiber(mgr.default_group(), 0, |f: &Fiber| f.yield_now())
            .unwrap();
        let result = panic::catch_unwind(AssertUnwindSafe(|| fiber.yield_now()));
        assert!(result.is_err());
        assert!(fiber.is_suspended());
    }

    #[test]
    fn yield_proc_respects_time_slice() {
        let mgr = manager();
        let group = mgr.create_group("sliced");
        mgr.set_time_slice(group, Some(Duration::from_millis(20)))
            .unwrap();

        let checks = Arc::new(AtomicUsize::new(0));
        let c = checks.clone();
        let fiber = mgr
            .create_fiber(group, 0, move |f: &Fiber| {
                // Immediately after a resume the slice is not used up.
                assert!(!f.yield_proc());
                c.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                assert!(f.yield_proc());
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert_eq!(fiber.time_slice(), Some(Duration::from_millis(20)));
        fiber.resume();
        assert_eq!(checks.load(Ordering::SeqCst), 1);
        assert!(fiber.is_suspended());
        fiber.resume();
        assert_eq!(checks.load(Ordering::SeqCst), 2);
        assert!(fiber.is_terminated());
    }

    #[test]
    fn yield_proc_without_slice_never_yields() {
        let mgr = manager();
        let fiber = mgr
            .create_fiber(mgr.default_group(), 0, |f: &Fiber| {
                for _ in 0..100 {
                    assert!(!f.yield_proc());
                }
            })
            .unwrap();
        fiber.resume();
        assert!(fiber.is_terminated());
    }

    #[test]
    fn is_current_on_stack_only_inside_body() {
        let mgr = manager();
        let inside = Arc::new(AtomicBool::new(false));
        let i = inside.clone();
        let fiber = mgr
            .create_fiber(mgr.default_group(), 0, move |f: &Fiber| {
                i.store(f.is_current_on_stack(), Ordering::SeqCst);
            })
            .unwrap();
        assert!(!fiber.is_current_on_stack());
        fiber.resume();
        assert!(inside.load(Ordering::SeqCst));
        assert!(!fiber.is_current_on_stack());
    }
}
