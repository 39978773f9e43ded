//! Cooperative stack-switching coroutines that share one native stack per
//! thread.
//!
//! A [`Coroutine`] is an independent thread of control multiplexed onto an
//! ordinary OS thread. Nothing preempts it: control moves only when a
//! coroutine explicitly [`switch`es](Coroutine::switch) to another, carrying
//! a [`Payload`] across. Each thread has a root coroutine standing for its
//! original stack; spawned coroutines form a tree under it, and switching to
//! a dead coroutine falls through to its nearest live ancestor, so the tree
//! doubles as a fallback-scheduling chain.
//!
//! Rather than giving each coroutine its own allocated stack, all coroutines
//! on a thread share the thread's native stack. Suspending one leaves its
//! frames in place until a sibling actually grows over them, at which point
//! the overlapped bytes are evacuated to the heap and copied back on resume.
//! That is cheap for the common call-pattern where a coroutine never yields
//! far from its caller, and it means a coroutine can be created without
//! deciding its stack size up front.
//!
//! ```
//! use sapling::{current, spawn, Payload};
//!
//! let root = current();
//! let doubler = spawn(move |payload| {
//!     let mut x: i64 = payload.downcast().unwrap();
//!     loop {
//!         x = root.switch(Payload::new(x * 2))?.downcast().unwrap();
//!     }
//! });
//! assert_eq!(doubler.switch(Payload::new(21i64)).unwrap().downcast::<i64>().unwrap(), 42);
//! assert_eq!(doubler.switch(Payload::new(3i64)).unwrap().downcast::<i64>().unwrap(), 6);
//! ```
//!
//! Once started, a coroutine is affine to the thread it first ran on;
//! handles may travel, operations may not. An embedding interpreter can
//! register [`ContextHooks`] to carry its own per-thread bookkeeping across
//! switches, and a per-thread [trace hook](set_trace) observes every
//! completed switch.

mod coroutine;
mod error;
mod hooks;
mod payload;
mod runtime;
mod stack;
mod switch;

pub use coroutine::{Coroutine, Entry, State};
pub use error::{Error, PanicPayload};
pub use hooks::{set_context_hooks, ContextHooks, ContextSnapshot};
pub use payload::Payload;
pub use runtime::{set_trace, total_root_coroutines, TraceEvent, TraceHook};

/// The coroutine currently running on this thread. On a thread that has
/// never run one, this is the moment its root coroutine springs into being.
pub fn current() -> Coroutine {
    runtime::current_coroutine()
}

/// Create a coroutine with the current coroutine as its parent. It does not
/// run until something switches to it.
pub fn spawn<F>(entry: F) -> Coroutine
where
    F: FnOnce(Payload) -> Result<Payload, Error> + Send + 'static,
{
    spawn_with_parent(entry, &current())
}

/// Create a coroutine under an explicit parent. The parent is where the
/// entry point's result (or unhandled error) is delivered when the
/// coroutine finishes.
pub fn spawn_with_parent<F>(entry: F, parent: &Coroutine) -> Coroutine
where
    F: FnOnce(Payload) -> Result<Payload, Error> + Send + 'static,
{
    runtime::drain_deferred();
    Coroutine::new_spawned(Box::new(entry), parent.inner.clone())
}

/// Settle any deferred-destruction work queued for this thread by handle
/// drops elsewhere. This happens automatically at every coroutine
/// operation; embedders with a deferred-callback facility can also schedule
/// it explicitly.
pub fn collect_garbage() {
    runtime::drain_deferred();
}
