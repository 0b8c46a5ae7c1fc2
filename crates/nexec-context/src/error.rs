// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Context creation errors.

use thiserror::Error;

/// Why an execution context could not be created.
///
/// Only resource problems are reported here. Misuse of a context (switching
/// into a destroyed one, destroying the active one) is a contract violation
/// and is never turned into an error value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The stack allocator returned no memory.
    #[error("out of memory allocating a {requested}-byte fiber stack")]
    OutOfMemory { requested: usize },

    /// Rounding the requested size up to the allocator granularity overflowed.
    #[error("fiber stack of {requested} bytes is too large")]
    StackTooLarge { requested: usize },
}
