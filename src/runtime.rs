//! Per-thread coroutine state and the process-wide cleanup machinery.
//!
//! Each OS thread that touches a coroutine gets a lazily created
//! [`ThreadContext`] in thread-local storage: the thread's root coroutine,
//! whichever coroutine is currently running, and the thread's trace hook.
//! The only state shared between threads is a counter of live roots and a
//! lock-protected queue of coroutines whose last handle was dropped somewhere
//! other than their owning thread.

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use log::{debug, warn};

use crate::coroutine::{self, Coroutine, Inner, Kind};
use crate::stack::StackState;

/// Locks in this crate are only ever taken by the thread that owns the
/// coroutine's execution, and never across a call into user code, so a
/// poisoned lock means a bug in the switch machinery itself; carrying on
/// with the inner value is the least-bad option mid-switch.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

static NEXT_COROUTINE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);
static TOTAL_ROOTS: AtomicUsize = AtomicUsize::new(0);

/// Coroutines awaiting destruction, keyed by the thread context that owns
/// them. Only the owning thread can deliver an exit safely; everyone else
/// leaves a note here.
static DESTROY_QUEUE: LazyLock<Mutex<HashMap<u64, Vec<Arc<Inner>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

pub(crate) fn next_coroutine_id() -> u64 {
    NEXT_COROUTINE_ID.fetch_add(1, Ordering::Relaxed)
}

/// How many threads currently have a live root coroutine.
pub fn total_root_coroutines() -> usize {
    TOTAL_ROOTS.load(Ordering::Relaxed)
}

/// Fired after every completed switch, with the coroutine control came from
/// and the one it arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    /// A plain value-carrying switch.
    Switch,
    /// The switch delivered an error to raise.
    Throw,
}

pub type TraceHook = Box<dyn FnMut(TraceEvent, &Coroutine, &Coroutine)>;

pub(crate) struct ThreadContext {
    pub(crate) id: u64,
    root: Coroutine,
    current: RefCell<Coroutine>,
    trace: RefCell<Option<TraceHook>>,
}

thread_local! {
    static CONTEXT: RefCell<Option<ThreadContext>> = const { RefCell::new(None) };
}

impl ThreadContext {
    fn new() -> ThreadContext {
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new_cyclic(|weak| Inner {
            id: next_coroutine_id(),
            handles: AtomicUsize::new(1),
            kind: Kind::Root {
                thread: Mutex::new(Some(id)),
            },
            stack: Mutex::new(StackState::new_root()),
            exec: Mutex::new(None),
            args: Mutex::new(None),
            root: Mutex::new(weak.clone()),
        });
        let root = Coroutine { inner };
        TOTAL_ROOTS.fetch_add(1, Ordering::Relaxed);
        debug!("thread context {} created, root coroutine {}", id, root.id());
        ThreadContext {
            id,
            root: root.clone(),
            current: RefCell::new(root),
            trace: RefCell::new(None),
        }
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        // Anything still holding bytes on this stack will never run again:
        // walk the ownership chain and discard those slices outright.
        let current = self.current.borrow().inner.clone();
        if !Arc::ptr_eq(&current, &self.root.inner) {
            warn!(
                "thread context {} torn down while coroutine {} was still running",
                self.id, current.id
            );
        }
        let mut link = Some(current);
        while let Some(c) = link {
            link = lock(&c.stack).prev.clone();
            if !matches!(c.kind, Kind::Root { .. }) && c.is_active() {
                coroutine::deactivate_and_free(&c);
            }
        }
        // Resumes from other threads must now fail cleanly instead of
        // touching a stack that no longer exists.
        if let Kind::Root { thread } = &self.root.inner.kind {
            *lock(thread) = None;
        }
        // Notes left for us can be settled in place: with the stack gone
        // there is nothing to deliver an exit to.
        let stale = lock(&DESTROY_QUEUE).remove(&self.id);
        for inner in stale.into_iter().flatten() {
            if inner.is_active() {
                coroutine::deactivate_and_free(&inner);
            }
        }
        TOTAL_ROOTS.fetch_sub(1, Ordering::Relaxed);
        debug!("thread context {} torn down", self.id);
    }
}

pub(crate) fn with<R>(f: impl FnOnce(&ThreadContext) -> R) -> R {
    CONTEXT.with(|cell| {
        if cell.borrow().is_none() {
            let fresh = ThreadContext::new();
            *cell.borrow_mut() = Some(fresh);
        }
        let ctx = cell.borrow();
        f(ctx.as_ref().expect("thread context just initialised"))
    })
}

/// This thread's context id, without creating a context. `None` on threads
/// that never ran a coroutine, or whose context is being torn down.
pub(crate) fn current_thread_id() -> Option<u64> {
    CONTEXT
        .try_with(|cell| cell.borrow().as_ref().map(|c| c.id))
        .ok()
        .flatten()
}

pub(crate) fn current_coroutine() -> Coroutine {
    with(|ctx| ctx.current.borrow().clone())
}

pub(crate) fn current_inner() -> Arc<Inner> {
    with(|ctx| ctx.current.borrow().inner.clone())
}

pub(crate) fn is_current(inner: &Arc<Inner>) -> bool {
    CONTEXT
        .try_with(|cell| {
            cell.borrow()
                .as_ref()
                .map_or(false, |c| Arc::ptr_eq(&c.current.borrow().inner, inner))
        })
        .unwrap_or(false)
}

/// Install `new` as the running coroutine, returning the one it displaced.
pub(crate) fn swap_current(new: Coroutine) -> Coroutine {
    with(|ctx| ctx.current.replace(new))
}

/// Install (or clear) this thread's trace hook, returning the old one.
pub fn set_trace(hook: Option<TraceHook>) -> Option<TraceHook> {
    with(|ctx| ctx.trace.replace(hook))
}

/// Invoke the trace hook, if any. The hook is taken out for the duration so
/// it may itself switch; if it panics it stays uninstalled, since a hook
/// that blows up mid-switch cannot be trusted with the next one.
pub(crate) fn fire_trace(event: TraceEvent, origin: &Coroutine, target: &Coroutine) {
    let hook = with(|ctx| ctx.trace.take());
    if let Some(mut h) = hook {
        let ok = catch_unwind(AssertUnwindSafe(|| h(event, origin, target))).is_ok();
        if ok {
            with(|ctx| {
                let mut slot = ctx.trace.borrow_mut();
                if slot.is_none() {
                    *slot = Some(h);
                }
            });
        } else {
            warn!("trace hook panicked; tracing disabled on this thread");
        }
    }
}

/// Queue `inner` for destruction by its owning thread.
pub(crate) fn defer_destroy(owner: u64, inner: Arc<Inner>) {
    debug!(
        "deferring destruction of coroutine {} to thread context {}",
        inner.id, owner
    );
    lock(&DESTROY_QUEUE).entry(owner).or_default().push(inner.clone());
    // The owner may have exited between the caller's affinity check and the
    // push above, in which case nobody will ever drain the note; re-check
    // and settle it here.
    let owner_gone = coroutine::find_root(&inner).map_or(true, |r| coroutine::stamp_of(&r).is_none());
    if owner_gone {
        if let Some(list) = lock(&DESTROY_QUEUE).get_mut(&owner) {
            list.retain(|i| !Arc::ptr_eq(i, &inner));
        }
        if inner.is_active() {
            coroutine::deactivate_and_free(&inner);
        }
    }
}

/// Settle destruction notes left for this thread. Called at every coroutine
/// operation; also the entry point an embedder's deferred-callback facility
/// should schedule.
pub(crate) fn drain_deferred() {
    let id = with(|ctx| ctx.id);
    let pending = lock(&DESTROY_QUEUE).remove(&id);
    let Some(pending) = pending else { return };
    for inner in pending {
        if inner.is_active() {
            coroutine::kill_in_place(&inner);
        }
    }
}
