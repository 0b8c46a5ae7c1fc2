// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! x86_64 System V backend.
//!
//! Callee-saved state: rbx, rbp, r12-r15, the MXCSR control bits and the x87
//! control word. No vector register is callee-saved under System V.

use std::arch::naked_asm;
use std::ffi::c_void;
use std::mem;

use crate::context::EntryFn;

/// Saved frame, lowest address first. Must match the push/pop order in
/// `switch_stack`.
#[repr(C)]
struct Frame {
    mxcsr: u32,
    fpu_cw: u16,
    _pad: u16,
    r15: usize,
    r14: usize,
    r13: usize,
    r12: usize,
    rbx: usize,
    rbp: usize,
    ret: usize,
}

pub(crate) const FRAME_SIZE: usize = mem::size_of::<Frame>();

const _: () = assert!(FRAME_SIZE == 64);

/// Power-on defaults: all exceptions masked, round to nearest.
const DEFAULT_MXCSR: u32 = 0x1F80;
const DEFAULT_FPU_CW: u16 = 0x037F;

/// Write the initial frame below `top` and return the stack pointer to
/// store in the context.
///
/// After `switch_stack` pops the frame and returns into the trampoline the
/// stack pointer equals `top`, which is 16-byte aligned; the trampoline's
/// `call` then leaves the entry function with the ABI-mandated alignment.
///
/// # Safety
/// `top` must be 16-byte aligned and at least `FRAME_SIZE` bytes above the
/// limit of a writable stack.
pub(crate) unsafe fn init_frame(top: *mut u8, entry: EntryFn, arg: *mut c_void) -> usize {
    debug_assert_eq!(top as usize % 16, 0);
    let frame = top.sub(FRAME_SIZE) as *mut Frame;
    frame.write(Frame {
        mxcsr: DEFAULT_MXCSR,
        fpu_cw: DEFAULT_FPU_CW,
        _pad: 0,
        r15: 0,
        r14: 0,
        r13: entry as *const () as usize,
        r12: arg as usize,
        rbx: 0,
        rbp: 0,
        ret: trampoline as *const () as usize,
    });
    frame as usize
}

/// First code run on a fresh stack. r12 carries the argument, r13 the entry
/// point. rbp is zero so frame-pointer walks stop here.
#[unsafe(naked)]
unsafe extern "C" fn trampoline() {
    naked_asm!(
        "mov rdi, r12",
        "call r13",
        // Entry functions diverge.
        "ud2",
    )
}

#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch_stack(_from_sp: *mut usize, _to_sp: usize) {
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "sub rsp, 8",
        "stmxcsr dword ptr [rsp]",
        "fnstcw word ptr [rsp + 4]",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "ldmxcsr dword ptr [rsp]",
        "fldcw word ptr [rsp + 4]",
        "add rsp, 8",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    )
}
