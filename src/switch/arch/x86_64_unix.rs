//! X86-64 SysV. The annoying part is not the register set but the frame
//! discipline: this function's own frame is part of the region being saved
//! and restored, so it is naked and does all its bookkeeping by hand.
//!
//! Fun ABI facts:
//!
//! * `rsp` must be 16-byte aligned at every `call`, which is why the spill
//!   area below the six pushes is 8 bytes and not 16.
//! * `mxcsr` and the x87 control word are callee-saved; everything else the
//!   target cares about was caller-saved by the compiler around our call.
use core::arch::naked_asm;

/// Relocates the stack pointer onto the switch target's slice.
///
/// # Safety
///
/// * A target must have been published for this thread (see the hooks in
///   `switch`); the hooks run mid-pivot and do the actual byte moves.
/// * Returns twice when the target is fresh: see the module contract.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn pivot() -> isize {
    naked_asm!(
        // step 1: spill everything a resume must see. our caller's return
        // address is already on the stack; it rides along with the frame.
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "sub rsp, 8",
        "stmxcsr [rsp]",
        "fnstcw [rsp + 4]",
        // the stack now looks like this:
        // | rsp rel | data                    |
        // |---------|-------------------------|
        // | +56     | return address          |
        // | +8..+56 | r15 r14 r13 r12 rbx rbp |
        // | +4      | x87 control word        |
        // | 0       | mxcsr                   |

        // step 2: let the save hook evacuate whatever the target's slice is
        // about to reclaim. it answers with the relocation delta (either
        // sign), or 1 for a fresh target; deltas are 16-aligned so the two
        // can't collide. a hook that cannot save aborts the process.
        "mov rdi, rsp",
        "call {save}",
        "cmp rax, 1",
        "je 2f",

        // step 3: the pivot itself. rsp lands exactly on the target's
        // spill area, saved by its own trip through step 1.
        "add rsp, rax",
        "call {restore}",
        "xor eax, eax",

        // step 4: reload. on the resumed path this is the target's state;
        // on the fresh path it is our own, still sitting where we put it.
        "2:",
        "ldmxcsr [rsp]",
        "fldcw [rsp + 4]",
        "add rsp, 8",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
        save = sym crate::switch::save_hook,
        restore = sym crate::switch::restore_hook,
    )
}
