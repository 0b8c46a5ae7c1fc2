// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-thread active-fiber stacks.
//!
//! Each OS thread that resumes fibers gets a LIFO of the fibers currently in
//! progress on its native stack. `resume` pushes, `yield_now` and natural
//! termination pop. The top entry is the innermost running fiber.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::iter::FusedIterator;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::vec;

use crate::fiber::Fiber;

/// Fibers in progress on one OS thread, outermost first.
pub struct ThreadFiberStack {
    thread: ThreadId,
    entries: Mutex<Vec<Arc<Fiber>>>,
}

impl ThreadFiberStack {
    fn new(thread: ThreadId) -> Self {
        Self {
            thread,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// The OS thread this stack belongs to.
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub(crate) fn push(&self, fiber: Arc<Fiber>) {
        self.entries.lock().unwrap().push(fiber);
    }

    pub(crate) fn pop(&self) -> Option<Arc<Fiber>> {
        self.entries.lock().unwrap().pop()
    }

    /// Innermost running fiber.
    pub fn top(&self) -> Option<Arc<Fiber>> {
        self.entries.lock().unwrap().last().cloned()
    }

    pub fn is_top(&self, fiber: &Fiber) -> bool {
        self.entries
            .lock()
            .unwrap()
            .last()
            .is_some_and(|top| ptr::eq(Arc::as_ptr(top), fiber))
    }

    pub fn contains(&self, fiber: &Fiber) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .any(|entry| ptr::eq(Arc::as_ptr(entry), fiber))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the active fibers, outermost first. Later pushes and pops
    /// do not affect an iterator that already exists.
    pub fn iter(&self) -> ActiveFibers {
        ActiveFibers {
            inner: self.entries.lock().unwrap().clone().into_iter(),
        }
    }
}

impl fmt::Debug for ThreadFiberStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<_> = self.iter().map(|fiber| fiber.id()).collect();
        f.debug_struct("ThreadFiberStack")
            .field("thread", &self.thread)
            .field("fibers", &ids)
            .finish()
    }
}

/// Single-pass iterator over a [`ThreadFiberStack`] snapshot.
pub struct ActiveFibers {
    inner: vec::IntoIter<Arc<Fiber>>,
}

impl Iterator for ActiveFibers {
    type Item = Arc<Fiber>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for ActiveFibers {}
impl FusedIterator for ActiveFibers {}

/// Thread → active-fiber stack map, owned by the manager and shared with its
/// fibers. Stacks are created the first time a thread is looked up.
///
/// The map is for lookups by thread id. The calling thread finds its own
/// stack through a thread-local cache, so resume and yield never take the
/// map lock after the first lookup. A thread's entry is dropped when the
/// thread exits with an empty stack.
pub(crate) struct ThreadRegistry {
    id: u64,
    stacks: Mutex<HashMap<ThreadId, Arc<ThreadFiberStack>>>,
}

static NEXT_REGISTRY: AtomicU64 = AtomicU64::new(1);

/// This thread's stacks, one per live registry it has touched.
#[derive(Default)]
struct LocalStacks {
    entries: Vec<LocalEntry>,
}

struct LocalEntry {
    registry: u64,
    owner: Weak<ThreadRegistry>,
    stack: Arc<ThreadFiberStack>,
}

impl LocalStacks {
    fn find(&self, registry: u64) -> Option<Arc<ThreadFiberStack>> {
        self.entries
            .iter()
            .find(|entry| entry.registry == registry)
            .map(|entry| Arc::clone(&entry.stack))
    }

    fn insert(&mut self, owner: &Arc<ThreadRegistry>, stack: Arc<ThreadFiberStack>) {
        self.entries.retain(|entry| entry.owner.strong_count() > 0);
        self.entries.push(LocalEntry {
            registry: owner.id,
            owner: Arc::downgrade(owner),
            stack,
        });
    }
}

impl Drop for LocalStacks {
    fn drop(&mut self) {
        for entry in self.entries.drain(..) {
            if let Some(owner) = entry.owner.upgrade() {
                owner.forget(&entry.stack);
            }
        }
    }
}

thread_local! {
    static LOCAL_STACKS: RefCell<LocalStacks> = RefCell::new(LocalStacks::default());
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            id: NEXT_REGISTRY.fetch_add(1, Ordering::Relaxed),
            stacks: Mutex::new(HashMap::new()),
        }
    }

    pub fn stack_for(&self, thread: ThreadId) -> Arc<ThreadFiberStack> {
        let mut stacks = self.stacks.lock().unwrap();
        stacks
            .entry(thread)
            .or_insert_with(|| {
                log::trace!("creating active-fiber stack for {:?}", thread);
                Arc::new(ThreadFiberStack::new(thread))
            })
            .clone()
    }

    /// Stack of the calling thread.
    pub fn current(self: &Arc<Self>) -> Arc<ThreadFiberStack> {
        LOCAL_STACKS
            .try_with(|local| {
                let mut local = local.borrow_mut();
                if let Some(stack) = local.find(self.id) {
                    return stack;
                }
                let stack = self.stack_for(thread::current().id());
                local.insert(self, Arc::clone(&stack));
                stack
            })
            // Thread-local storage is already torn down during thread exit.
            .unwrap_or_else(|_| self.stack_for(thread::current().id()))
    }

    pub fn thread_count(&self) -> usize {
        self.stacks.lock().unwrap().len()
    }

    /// Drop the entry of an exiting thread.
    fn forget(&self, stack: &Arc<ThreadFiberStack>) {
        if !stack.is_empty() {
            log::warn!(
                "thread {:?} exited with {} fibers on its active-fiber stack",
                stack.thread(),
                stack.len()
            );
            return;
        }
        let mut stacks = self.stacks.lock().unwrap();
        if stacks
            .get(&stack.thread())
            .is_some_and(|entry| Arc::ptr_eq(entry, stack))
        {
            stacks.remove(&stack.thread());
        }
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ExecutiveManager;

    fn parked_fibers(mgr: &ExecutiveManager, n: usize) -> Vec<Arc<Fiber>> {
        (0..n)
            .map(|_| {
                mgr.create_fiber(mgr.default_group(), 0, |_: &Fiber| {})
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn push_pop_top_contains() {
        let mgr = ExecutiveManager::new();
        let fibers = parked_fibers(&mgr, 3);
        let stack = ThreadFiberStack::new(thread::current().id());
        assert!(stack.is_empty());
        assert!(stack.top().is_none());

        for fiber in &fibers {
            stack.push(fiber.clone());
        }
        assert_eq!(stack.len(), 3);
        assert_eq!(stack.top().unwrap().id(), fibers[2].id());
        assert!(stack.is_top(&fibers[2]));
        assert!(!stack.is_top(&fibers[0]));
        assert!(stack.contains(&fibers[0]));

        assert_eq!(stack.pop().unwrap().id(), fibers[2].id());
        assert!(!stack.contains(&fibers[2]));
        assert_eq!(stack.top().unwrap().id(), fibers[1].id());
    }

    #[test]
    fn iteration_is_outermost_first_snapshot() {
        let mgr = ExecutiveManager::new();
        let fibers = parked_fibers(&mgr, 3);
        let stack = ThreadFiberStack::new(thread::current().id());
        for fiber in &fibers {
            stack.push(fiber.clone());
        }

        let mut iter = stack.iter();
        assert_eq!(iter.len(), 3);
        stack.pop();
        stack.pop();

        let ids: Vec<_> = iter.by_ref().map(|f| f.id()).collect();
        assert_eq!(ids, fibers.iter().map(|f| f.id()).collect::<Vec<_>>());
        assert!(iter.next().is_none());
        assert_eq!(stack.iter().count(), 1);
    }

    #[test]
    fn registry_creates_one_stack_per_thread() {
        let registry = Arc::new(ThreadRegistry::default());
        let here = registry.current();
        assert!(Arc::ptr_eq(&here, &registry.stack_for(thread::current().id())));

        let other = thread::spawn(|| thread::current().id()).join().unwrap();
        let there = registry.stack_for(other);
        assert_eq!(there.thread(), other);
        assert!(!Arc::ptr_eq(&here, &there));
        assert_eq!(registry.thread_count(), 2);
    }

    #[test]
    fn current_is_cached_per_registry() {
        let first = Arc::new(ThreadRegistry::default());
        let second = Arc::new(ThreadRegistry::default());
        let a = first.current();
        assert!(Arc::ptr_eq(&a, &first.current()));
        assert!(!Arc::ptr_eq(&a, &second.current()));
        assert_eq!(first.thread_count(), 1);
        assert_eq!(second.thread_count(), 1);
    }

    #[test]
    fn exited_threads_are_pruned() {
        let registry = Arc::new(ThreadRegistry::default());
        let here = registry.current();

        let remote = Arc::clone(&registry);
        let other = thread::spawn(move || {
            let stack = remote.current();
            assert!(stack.is_empty());
            thread::current().id()
        })
        .join()
        .unwrap();

        assert_eq!(registry.thread_count(), 1);
        assert!(Arc::ptr_eq(&here, &registry.stack_for(thread::current().id())));
        // A later lookup by id starts a fresh stack.
        assert!(registry.stack_for(other).is_empty());
        assert_eq!(registry.thread_count(), 2);
    }
}
