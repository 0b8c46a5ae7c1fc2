// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Recoverable executive errors.
//!
//! Contract violations (yielding from the wrong context, destroying a
//! running fiber, resuming from a foreign thread, swapping the allocator
//! late) are panics, never values of this type.

use nexec_context::ContextError;
use thiserror::Error;

use crate::fiber::FiberId;
use crate::group::GroupId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutiveError {
    /// Stack allocation failed; no fiber was created.
    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("fiber group {0} does not exist")]
    UnknownGroup(GroupId),

    #[error("fiber {0} is not registered with this manager")]
    UnknownFiber(FiberId),

    #[error("fiber {fiber} already belongs to group {group}")]
    AlreadyInGroup { fiber: FiberId, group: GroupId },

    #[error("fiber {fiber} is not a member of group {group}")]
    NotAMember { fiber: FiberId, group: GroupId },
}
