// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Architecture boundary.
//!
//! Each backend provides the same three items:
//! - `switch_stack(from_sp, to_sp)`: push the callee-saved registers on the
//!   current stack, store the stack pointer into `*from_sp`, load `to_sp`,
//!   pop the callee-saved registers found there and return into that context.
//! - `init_frame(top, entry, arg)`: lay out a frame below `top` that, when
//!   popped by `switch_stack`, enters the trampoline which calls `entry(arg)`.
//! - `FRAME_SIZE`: bytes occupied by one saved frame.
//!
//! The frame a context is saved with is always the frame it is restored
//! from, so the layout only has to agree with itself.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub(crate) use self::x86_64::{init_frame, switch_stack, FRAME_SIZE};

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub(crate) use self::aarch64::{init_frame, switch_stack, FRAME_SIZE};

/// Approximate current stack pointer: the address of a local.
#[inline(never)]
pub(crate) fn current_stack_pointer() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}
