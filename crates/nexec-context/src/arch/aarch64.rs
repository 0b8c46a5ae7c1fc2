// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! AArch64 (AAPCS64) backend.
//!
//! Callee-saved state: x19-x28, the frame pointer x29, the link register x30
//! and the low 64 bits of v8-v15 (d8-d15). x18 is platform-reserved and
//! never touched.

use std::arch::naked_asm;
use std::ffi::c_void;
use std::mem;

use crate::context::EntryFn;

/// Saved frame, lowest address first. Must match the stp/ldp offsets in
/// `switch_stack`.
#[repr(C)]
struct Frame {
    /// x19..=x28
    gpr: [usize; 10],
    fp: usize,
    lr: usize,
    /// d8..=d15
    fpr: [u64; 8],
}

pub(crate) const FRAME_SIZE: usize = mem::size_of::<Frame>();

const _: () = assert!(FRAME_SIZE == 160);

/// Write the initial frame below `top` and return the stack pointer to
/// store in the context.
///
/// # Safety
/// `top` must be 16-byte aligned and at least `FRAME_SIZE` bytes above the
/// limit of a writable stack.
pub(crate) unsafe fn init_frame(top: *mut u8, entry: EntryFn, arg: *mut c_void) -> usize {
    debug_assert_eq!(top as usize % 16, 0);
    let frame = top.sub(FRAME_SIZE) as *mut Frame;
    let mut gpr = [0usize; 10];
    gpr[0] = arg as usize;
    gpr[1] = entry as *const () as usize;
    frame.write(Frame {
        gpr,
        fp: 0,
        lr: trampoline as *const () as usize,
        fpr: [0; 8],
    });
    frame as usize
}

/// First code run on a fresh stack. x19 carries the argument, x20 the entry
/// point. x29 is zero so frame-pointer walks stop here.
#[unsafe(naked)]
unsafe extern "C" fn trampoline() {
    naked_asm!(
        "mov x0, x19",
        "blr x20",
        // Entry functions diverge.
        "brk #0x1",
    )
}

#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch_stack(_from_sp: *mut usize, _to_sp: usize) {
    naked_asm!(
        "sub sp, sp, #160",
        "stp x19, x20, [sp, #0]",
        "stp x21, x22, [sp, #16]",
        "stp x23, x24, [sp, #32]",
        "stp x25, x26, [sp, #48]",
        "stp x27, x28, [sp, #64]",
        "stp x29, x30, [sp, #80]",
        "stp d8, d9, [sp, #96]",
        "stp d10, d11, [sp, #112]",
        "stp d12, d13, [sp, #128]",
        "stp d14, d15, [sp, #144]",
        "mov x9, sp",
        "str x9, [x0]",
        "mov sp, x1",
        "ldp x19, x20, [sp, #0]",
        "ldp x21, x22, [sp, #16]",
        "ldp x23, x24, [sp, #32]",
        "ldp x25, x26, [sp, #48]",
        "ldp x27, x28, [sp, #64]",
        "ldp x29, x30, [sp, #80]",
        "ldp d8, d9, [sp, #96]",
        "ldp d10, d11, [sp, #112]",
        "ldp d12, d13, [sp, #128]",
        "ldp d14, d15, [sp, #144]",
        "add sp, sp, #160",
        "ret",
    )
}
