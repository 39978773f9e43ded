//! Host-runtime bookkeeping carried across switches.
//!
//! An embedding interpreter usually has per-thread execution state that must
//! travel with the coroutine rather than the OS thread: an exception chain,
//! recursion counters, frame-stack pointers, ambient context variables. The
//! switch machinery knows nothing about any of that; it only promises to call
//! [`ContextHooks::capture`] on the coroutine being suspended and
//! [`ContextHooks::restore`] on the one being resumed, exactly at the switch
//! boundary and never anywhere else.
//!
//! Hosts that have no such state simply register nothing.

use std::sync::OnceLock;

/// An opaque snapshot of whatever the host wants preserved.
pub type ContextSnapshot = Box<dyn std::any::Any + Send>;

pub trait ContextHooks: Sync {
    /// Read the current thread's host state into a snapshot. Called on the
    /// coroutine being switched away from.
    fn capture(&self) -> ContextSnapshot;

    /// Write a snapshot back into the current thread's host state. `None`
    /// means a never-before-run coroutine is being entered and the host
    /// should install a fresh context.
    fn restore(&self, snapshot: Option<ContextSnapshot>);
}

static HOOKS: OnceLock<&'static dyn ContextHooks> = OnceLock::new();

/// Register the process-wide context hooks. Returns `false` if hooks were
/// already installed (the first registration wins; swapping hooks while
/// coroutines hold snapshots from the old ones would be meaningless).
pub fn set_context_hooks(hooks: &'static dyn ContextHooks) -> bool {
    HOOKS.set(hooks).is_ok()
}

pub(crate) fn capture() -> Option<ContextSnapshot> {
    HOOKS.get().map(|h| h.capture())
}

/// Restore a previously captured snapshot; `None` asks the host for a fresh
/// context (first entry into a coroutine).
pub(crate) fn restore(snapshot: Option<ContextSnapshot>) {
    if let Some(h) = HOOKS.get() {
        h.restore(snapshot);
    }
}
