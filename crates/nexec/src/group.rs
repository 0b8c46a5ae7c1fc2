// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber groups: named scheduling domains with batch lifecycle operations.
//!
//! A group holds fiber ids, not fibers; the manager's registry owns the
//! fibers. Membership keeps insertion order so diagnostics and pulses visit
//! members in a stable order.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexSet;

use crate::error::ExecutiveError;
use crate::fiber::{Fiber, FiberId};

/// Manager-unique group identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub(crate) u64);

impl GroupId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A named set of fibers sharing a time slice.
#[derive(Debug, Clone)]
pub struct FiberGroup {
    id: GroupId,
    name: String,
    members: IndexSet<FiberId>,
    time_slice: Option<Duration>,
}

impl FiberGroup {
    pub(crate) fn new(id: GroupId, name: impl Into<String>, time_slice: Option<Duration>) -> Self {
        Self {
            id,
            name: name.into(),
            members: IndexSet::new(),
            time_slice,
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, fiber: FiberId) -> bool {
        self.members.contains(&fiber)
    }

    /// Member ids in insertion order.
    pub fn members(&self) -> impl Iterator<Item = FiberId> + '_ {
        self.members.iter().copied()
    }

    pub fn time_slice(&self) -> Option<Duration> {
        self.time_slice
    }

    /// Adopt `fiber`. Fails if it already belongs to a group (this one
    /// included). The fiber inherits the group's time slice.
    pub(crate) fn insert(&mut self, fiber: &Fiber) -> Result<(), ExecutiveError> {
        if let Some(group) = fiber.group() {
            return Err(ExecutiveError::AlreadyInGroup {
                fiber: fiber.id(),
                group,
            });
        }
        self.members.insert(fiber.id());
        fiber.set_group(Some(self.id));
        fiber.set_time_slice(self.time_slice);
        Ok(())
    }

    /// Release `fiber`, leaving it groupless.
    pub(crate) fn remove(&mut self, fiber: &Fiber) -> Result<(), ExecutiveError> {
        if !self.members.shift_remove(&fiber.id()) {
            return Err(ExecutiveError::NotAMember {
                fiber: fiber.id(),
                group: self.id,
            });
        }
        fiber.set_group(None);
        Ok(())
    }

    pub(crate) fn set_time_slice(&mut self, slice: Option<Duration>) {
        self.time_slice = slice;
    }
}

/// Panics if any member is running or cannot be destroyed from the calling
/// thread. Checked before any member is touched so a rejected batch leaves
/// the group as it was.
pub(crate) fn ensure_destroyable(group: GroupId, members: &[Arc<Fiber>]) {
    if let Some(running) = members.iter().find(|fiber| fiber.is_running()) {
        panic!(
            "cannot terminate group {}: fiber {} is running",
            group,
            running.id()
        );
    }
    for fiber in members {
        fiber.assert_destroyable();
    }
}

/// Force-terminate every member that has not terminated yet. Bodies do not
/// run further and termination callbacks do not fire. Returns how many
/// members were terminated by this call.
pub(crate) fn terminate_members(group: GroupId, members: &[Arc<Fiber>]) -> usize {
    ensure_destroyable(group, members);
    let terminated = members
        .iter()
        .filter(|fiber| fiber.force_terminate())
        .count();
    log::debug!(
        "group {}: terminated {} of {} fibers",
        group,
        terminated,
        members.len()
    );
    terminated
}
