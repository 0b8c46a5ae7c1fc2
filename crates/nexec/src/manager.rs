// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Executive manager: registry of all fibers and groups.
//!
//! The manager owns every fiber (`Arc<Fiber>` in an id-keyed registry) and
//! every group (id sets into that registry). It also owns the thread →
//! active-fiber stack map and the stack allocator. No registry lock is held
//! while a fiber runs, so bodies may call back into the manager.

use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::ThreadId;
use std::time::Duration;

use indexmap::IndexMap;
use nexec_context::{Stack, StackAllocator};

use crate::config::ExecutiveConfig;
use crate::error::ExecutiveError;
use crate::fiber::{Fiber, FiberBody, FiberId, TerminationCallback};
use crate::group::{self, FiberGroup, GroupId};
use crate::thread_stack::{ThreadFiberStack, ThreadRegistry};

#[derive(Default)]
struct Registry {
    fibers: IndexMap<FiberId, Arc<Fiber>>,
    groups: IndexMap<GroupId, FiberGroup>,
}

impl Registry {
    /// `fiber` itself must be registered here. Ids are only unique within a
    /// manager, so a fiber of another manager may share an id with one of
    /// ours.
    fn registered(&self, fiber: &Fiber) -> Result<&Arc<Fiber>, ExecutiveError> {
        self.fibers
            .get(&fiber.id())
            .filter(|entry| ptr::eq(Arc::as_ptr(entry), fiber))
            .ok_or(ExecutiveError::UnknownFiber(fiber.id()))
    }
}

/// Owner of all fibers and groups.
pub struct ExecutiveManager {
    default_stack_size: usize,
    default_time_slice: Option<Duration>,
    /// Fixed once the first fiber has been created.
    allocator: Mutex<Arc<dyn StackAllocator>>,
    /// Fibers ever created; guards `set_allocator`.
    fibers_created: AtomicU64,
    next_id: AtomicU64,
    registry: Mutex<Registry>,
    threads: Arc<ThreadRegistry>,
    default_group: GroupId,
}

impl ExecutiveManager {
    pub fn new() -> Self {
        Self::with_config(ExecutiveConfig::default())
    }

    pub fn with_config(config: ExecutiveConfig) -> Self {
        let default_group = GroupId(1);
        let mut registry = Registry::default();
        registry.groups.insert(
            default_group,
            FiberGroup::new(default_group, "default", config.default_time_slice),
        );

        log::debug!(
            "executive manager created (default stack {} bytes, allocator {:?})",
            config.default_stack_size,
            config.allocator
        );
        Self {
            default_stack_size: config.default_stack_size,
            default_time_slice: config.default_time_slice,
            allocator: Mutex::new(config.allocator),
            fibers_created: AtomicU64::new(0),
            next_id: AtomicU64::new(default_group.0 + 1),
            registry: Mutex::new(registry),
            threads: Arc::new(ThreadRegistry::default()),
            default_group,
        }
    }

    /// Current settings, including the allocator in effect.
    pub fn config(&self) -> ExecutiveConfig {
        ExecutiveConfig {
            default_stack_size: self.default_stack_size,
            default_time_slice: self.default_time_slice,
            allocator: self.allocator(),
        }
    }

    pub fn allocator(&self) -> Arc<dyn StackAllocator> {
        Arc::clone(&self.allocator.lock().unwrap())
    }

    /// Replace the stack allocator.
    ///
    /// Panics once any fiber has been created: stacks already handed out
    /// must go back to the allocator they came from.
    pub fn set_allocator(&self, allocator: Arc<dyn StackAllocator>) {
        let mut current = self.allocator.lock().unwrap();
        assert!(
            self.fibers_created.load(Ordering::Acquire) == 0,
            "stack allocator cannot change after the first fiber was created"
        );
        log::debug!("stack allocator set to {:?}", allocator);
        *current = allocator;
    }

    /// Group every manager starts with.
    pub fn default_group(&self) -> GroupId {
        self.default_group
    }

    pub fn create_group(&self, name: impl Into<String>) -> GroupId {
        let id = GroupId(self.next_id());
        let group = FiberGroup::new(id, name, self.default_time_slice);
        log::debug!("created fiber group {} ({:?})", id, group.name());
        self.registry.lock().unwrap().groups.insert(id, group);
        id
    }

    /// Create a SUSPENDED fiber in `group`. A `stack_size` of zero selects
    /// the configured default.
    pub fn create_fiber<B>(
        &self,
        group: GroupId,
        stack_size: usize,
        body: B,
    ) -> Result<Arc<Fiber>, ExecutiveError>
    where
        B: FnOnce(&Fiber) + Send + 'static,
    {
        self.spawn(group, stack_size, Box::new(body), None)
    }

    /// Like [`create_fiber`](Self::create_fiber), with a callback invoked
    /// exactly once when the body returns.
    pub fn create_fiber_with<B, T>(
        &self,
        group: GroupId,
        stack_size: usize,
        body: B,
        on_terminate: T,
    ) -> Result<Arc<Fiber>, ExecutiveError>
    where
        B: FnOnce(&Fiber) + Send + 'static,
        T: FnOnce(&Fiber) + Send + 'static,
    {
        self.spawn(group, stack_size, Box::new(body), Some(Box::new(on_terminate)))
    }

    fn spawn(
        &self,
        group: GroupId,
        stack_size: usize,
        body: FiberBody,
        on_terminate: Option<TerminationCallback>,
    ) -> Result<Arc<Fiber>, ExecutiveError> {
        if !self.registry.lock().unwrap().groups.contains_key(&group) {
            return Err(ExecutiveError::UnknownGroup(group));
        }

        let size = if stack_size == 0 {
            self.default_stack_size
        } else {
            stack_size
        };
        let stack = {
            let allocator = self.allocator.lock().unwrap();
            let stack = Stack::new(Arc::clone(&allocator), size)?;
            self.fibers_created.fetch_add(1, Ordering::AcqRel);
            stack
        };

        let id = FiberId(self.next_id());
        let fiber = Fiber::new(id, stack, body, on_terminate, Arc::clone(&self.threads));

        let mut registry = self.registry.lock().unwrap();
        let Some(entry) = registry.groups.get_mut(&group) else {
            // Group destroyed concurrently; dropping the fiber frees its stack.
            return Err(ExecutiveError::UnknownGroup(group));
        };
        entry.insert(&fiber)?;
        registry.fibers.insert(id, Arc::clone(&fiber));

        log::debug!(
            "created fiber {} in group {} ({} byte stack)",
            id,
            group,
            fiber.stack_size()
        );
        Ok(fiber)
    }

    /// Terminate and unregister a fiber.
    ///
    /// Panics if the fiber is running or was resumed on another thread. The
    /// termination callback does not fire.
    pub fn close_fiber(&self, fiber: &Fiber) -> Result<(), ExecutiveError> {
        fiber.assert_destroyable();
        let removed = {
            let mut registry = self.registry.lock().unwrap();
            registry.registered(fiber)?;
            if let Some(group) = fiber.group() {
                if let Some(entry) = registry.groups.get_mut(&group) {
                    entry.remove(fiber)?;
                }
            }
            registry.fibers.shift_remove(&fiber.id())
        };
        if let Some(removed) = removed {
            removed.force_terminate();
        }
        log::debug!("closed fiber {}", fiber.id());
        Ok(())
    }

    /// Move a groupless fiber into `group`.
    pub fn add_fiber(&self, group: GroupId, fiber: &Fiber) -> Result<(), ExecutiveError> {
        let mut registry = self.registry.lock().unwrap();
        registry.registered(fiber)?;
        registry
            .groups
            .get_mut(&group)
            .ok_or(ExecutiveError::UnknownGroup(group))?
            .insert(fiber)
    }

    /// Take a fiber out of `group`. It stays registered, without a group.
    pub fn remove_fiber(&self, group: GroupId, fiber: &Fiber) -> Result<(), ExecutiveError> {
        let mut registry = self.registry.lock().unwrap();
        registry.registered(fiber)?;
        registry
            .groups
            .get_mut(&group)
            .ok_or(ExecutiveError::UnknownGroup(group))?
            .remove(fiber)
    }

    /// Force-terminate every member of `group` that has not terminated.
    ///
    /// Panics, without touching any member, if one of them is running or
    /// cannot be destroyed from the calling thread.
    /// Members stay registered. Returns how many were terminated.
    pub fn terminate_all(&self, group: GroupId) -> Result<usize, ExecutiveError> {
        let members = self.group_members(group)?;
        Ok(group::terminate_members(group, &members))
    }

    /// Terminate all members, unregister them and remove the group.
    /// Returns how many fibers were destroyed.
    ///
    /// Panics, leaving the group and its members as they were, if any member
    /// cannot be destroyed from the calling thread.
    pub fn destroy_group(&self, group: GroupId) -> Result<usize, ExecutiveError> {
        group::ensure_destroyable(group, &self.group_members(group)?);

        let removed: Vec<Arc<Fiber>> = {
            let mut registry = self.registry.lock().unwrap();
            let entry = registry
                .groups
                .shift_remove(&group)
                .ok_or(ExecutiveError::UnknownGroup(group))?;
            entry
                .members()
                .filter_map(|id| registry.fibers.shift_remove(&id))
                .collect()
        };

        for fiber in &removed {
            fiber.set_group(None);
            fiber.force_terminate();
        }
        log::debug!("destroyed group {} with {} fibers", group, removed.len());
        Ok(removed.len())
    }

    /// Resume every SUSPENDED member once, in member order. Returns how many
    /// were resumed.
    pub fn pulse_group(&self, group: GroupId) -> Result<usize, ExecutiveError> {
        let members = self.group_members(group)?;
        let mut resumed = 0;
        for fiber in members.iter().filter(|fiber| fiber.is_suspended()) {
            fiber.resume();
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Set the time slice of `group` and all of its current members.
    pub fn set_time_slice(
        &self,
        group: GroupId,
        slice: Option<Duration>,
    ) -> Result<(), ExecutiveError> {
        let mut registry = self.registry.lock().unwrap();
        let Registry { fibers, groups } = &mut *registry;
        let entry = groups
            .get_mut(&group)
            .ok_or(ExecutiveError::UnknownGroup(group))?;
        entry.set_time_slice(slice);
        for id in entry.members() {
            if let Some(fiber) = fibers.get(&id) {
                fiber.set_time_slice(slice);
            }
        }
        Ok(())
    }

    /// Snapshot of a group.
    pub fn group(&self, group: GroupId) -> Result<FiberGroup, ExecutiveError> {
        self.registry
            .lock()
            .unwrap()
            .groups
            .get(&group)
            .cloned()
            .ok_or(ExecutiveError::UnknownGroup(group))
    }

    /// Members of `group`, in member order.
    pub fn group_members(&self, group: GroupId) -> Result<Vec<Arc<Fiber>>, ExecutiveError> {
        let registry = self.registry.lock().unwrap();
        let entry = registry
            .groups
            .get(&group)
            .ok_or(ExecutiveError::UnknownGroup(group))?;
        Ok(entry
            .members()
            .filter_map(|id| registry.fibers.get(&id).cloned())
            .collect())
    }

    pub fn groups(&self) -> Vec<GroupId> {
        self.registry.lock().unwrap().groups.keys().copied().collect()
    }

    pub fn fiber(&self, id: FiberId) -> Option<Arc<Fiber>> {
        self.registry.lock().unwrap().fibers.get(&id).cloned()
    }

    pub fn fiber_count(&self) -> usize {
        self.registry.lock().unwrap().fibers.len()
    }

    pub fn group_count(&self) -> usize {
        self.registry.lock().unwrap().groups.len()
    }

    /// Active-fiber stack of `thread`, created on first use.
    pub fn active_stack(&self, thread: ThreadId) -> Arc<ThreadFiberStack> {
        self.threads.stack_for(thread)
    }

    /// Active-fiber stack of the calling thread.
    pub fn current_stack(&self) -> Arc<ThreadFiberStack> {
        self.threads.current()
    }

    /// Innermost fiber running on the calling thread.
    pub fn current_fiber(&self) -> Option<Arc<Fiber>> {
        self.threads.current().top()
    }

    /// Number of threads that have an active-fiber stack.
    pub fn thread_count(&self) -> usize {
        self.threads.thread_count()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for ExecutiveManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ExecutiveManager {
    fn drop(&mut self) {
        let registry = self
            .registry
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        registry.groups.clear();
        let fibers: Vec<Arc<Fiber>> = registry.fibers.drain(..).map(|(_, f)| f).collect();

        for fiber in fibers {
            if !fiber.is_destroyable_here() {
                log::error!(
                    "fiber {} is running or bound to another thread at manager shutdown; leaving its stack alone",
                    fiber.id()
                );
                continue;
            }
            fiber.force_terminate();
        }
    }
}
