//! Per-architecture pivot primitives.
//!
//! Each implementation exports one function:
//!
//! `unsafe extern "C" fn pivot() -> isize`
//!
//! which spills the callee-saved state, calls
//! [`save_hook`](super::save_hook) with the spilled stack pointer, relocates
//! the stack pointer by the returned delta, calls
//! [`restore_hook`](super::restore_hook), reloads the (now the target's)
//! spilled state and returns. The contract on the return value:
//!
//! * `0`: a suspended coroutine was resumed; you are its continuation.
//! * [`FRESH`]: the target had never run; the stack pointer did not move
//!   and the caller's frame is now the new coroutine's first frame.
//!
//! There is no error return: a save hook that cannot do its job must abort
//! the process, since once evacuation is in doubt the native stack cannot
//! be trusted either way.

/// Answer from the save hook meaning "first entry: don't relocate, don't
/// restore". Never a valid relocation delta; those are multiples of the
/// stack alignment.
pub(crate) const FRESH: isize = 1;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub(crate) use aarch64::*;

#[cfg(all(target_arch = "x86_64", unix))]
mod x86_64_unix;
#[cfg(all(target_arch = "x86_64", unix))]
pub(crate) use x86_64_unix::*;

#[cfg(not(any(
    target_arch = "aarch64",
    all(target_arch = "x86_64", unix),
)))]
compile_error!("Unsupported target platform!");
