//! Aarch64. More registers to spill than x86-64 (x19-x28, the low halves of
//! v8-v15, fp and lr) but the paired load/store instructions keep it short.
//!
//! Fun ABI facts:
//!
//! * `sp` must stay 16-byte aligned at all times, not just at calls, so the
//!   whole spill area is carved out in one predecrement.
//! * Only the low 64 bits of v8-v15 are callee-saved; `stp` on the `d`
//!   views is exactly right.
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
        // step 1: spill. one 160-byte frame: fp and lr at the bottom, then
        // x19-x28, then d8-d15.
        "stp x29, x30, [sp, #-160]!",
        "stp x19, x20, [sp, #16]",
        "stp x21, x22, [sp, #32]",
        "stp x23, x24, [sp, #48]",
        "stp x25, x26, [sp, #64]",
        "stp x27, x28, [sp, #80]",
        "stp d8, d9, [sp, #96]",
        "stp d10, d11, [sp, #112]",
        "stp d12, d13, [sp, #128]",
        "stp d14, d15, [sp, #144]",

        // step 2: the save hook evacuates what the target will reclaim and
        // answers with the relocation delta (either sign), or 1 for a fresh
        // target; deltas are 16-aligned so nothing collides. a hook that
        // cannot save aborts the process.
        "mov x0, sp",
        "bl {save}",
        "cmp x0, #1",
        "b.eq 2f",

        // step 3: the pivot. sp lands on the target's spill frame, written
        // by its own trip through step 1.
        "add sp, sp, x0",
        "bl {restore}",
        "mov x0, #0",

        // step 4: reload. the target's state on the resumed path, our own
        // untouched spill on the fresh path.
        "2:",
        "ldp x19, x20, [sp, #16]",
        "ldp x21, x22, [sp, #32]",
        "ldp x23, x24, [sp, #48]",
        "ldp x25, x26, [sp, #64]",
        "ldp x27, x28, [sp, #80]",
        "ldp d8, d9, [sp, #96]",
        "ldp d10, d11, [sp, #112]",
        "ldp d12, d13, [sp, #128]",
        "ldp d14, d15, [sp, #144]",
        "ldp x29, x30, [sp], #160",
        "ret",
        save = sym crate::switch::save_hook,
        restore = sym crate::switch::restore_hook,
    )
}
