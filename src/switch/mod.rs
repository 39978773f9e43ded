//! The switch protocol: resolving a target, pivoting the stack, and
//! bootstrapping coroutines that have never run.
//!
//! The pivot itself ([`arch::pivot`]) relocates the stack pointer, so no
//! frame below it can carry information across a switch: everything the
//! arrival side needs travels through thread-locals. For the same reason,
//! nothing owned may be live in a frame when its stack moves out from under
//! it; every function here confines its temporaries to scopes that end
//! before the pivot.

mod arch;

use std::cell::Cell;
use std::mem::ManuallyDrop;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, error, trace};

use crate::coroutine::{self, Coroutine, Inner, State};
use crate::error::{Error, PanicPayload};
use crate::hooks;
use crate::payload::{Payload, SwitchArgs};
use crate::runtime::{self, lock, TraceEvent};
use crate::stack;

thread_local! {
    /// The coroutine being switched into, published just before the pivot
    /// and claimed just after. Holds a raw `Arc` so the target stays alive
    /// across the gap where no frame owns it.
    static PIVOT_TARGET: Cell<*const Inner> = const { Cell::new(core::ptr::null()) };
}

/// What the arrival side of a pivot learns.
struct Arrival {
    /// True when the pivot entered a coroutine that had never run: the
    /// caller's frame is now the new coroutine's first frame.
    first_entry: bool,
    /// The coroutine control came from.
    origin: Coroutine,
}

/// Called by the pivot after spilling registers, with the spilled stack
/// pointer. Evacuates whatever the target's slice will overwrite and answers
/// with the relocation delta, or [`arch::FRESH`] for a first entry.
///
/// There is no failure return: evacuation can only fail by failing to
/// allocate, which aborts, and a panic cannot cross the `extern "C"`
/// boundary without aborting either. Once a save is in doubt the native
/// stack cannot be trusted.
pub(crate) unsafe extern "C" fn save_hook(stackref: *mut u8) -> isize {
    let raw = PIVOT_TARGET.with(|c| c.get());
    debug_assert!(!raw.is_null());
    let target = ManuallyDrop::new(Arc::from_raw(raw));
    let current = runtime::current_inner();
    stack::evacuate(&target, &current, stackref);
    let st = lock(&target.stack);
    if !st.active() {
        arch::FRESH
    } else {
        (st.start() as isize) - (stackref as isize)
    }
}

/// Called by the pivot after the stack pointer has moved: copy the target's
/// evacuated bytes back over the live stack.
pub(crate) unsafe extern "C" fn restore_hook() {
    let raw = PIVOT_TARGET.with(|c| c.get());
    debug_assert!(!raw.is_null());
    let target = ManuallyDrop::new(Arc::from_raw(raw));
    let current = runtime::current_inner();
    stack::restore(&target, &current);
}

/// Publish the target and run the pivot. Returns on the *arrival* side:
/// either the resumed continuation of some earlier `pivot_in` on this
/// stack, or (for a first entry) this very call, with the caller's frame
/// now belonging to the new coroutine.
#[inline(never)]
fn pivot_in(target: Arc<Inner>) -> Arrival {
    PIVOT_TARGET.with(|c| c.set(Arc::into_raw(target)));
    let err = unsafe { arch::pivot() };
    arrive(err == arch::FRESH)
}

/// Post-pivot bookkeeping, using only thread-locals: claim the published
/// target, restore its host context, and make it current.
fn arrive(first_entry: bool) -> Arrival {
    let arrived = unsafe {
        let raw = PIVOT_TARGET.with(|c| c.replace(core::ptr::null()));
        debug_assert!(!raw.is_null());
        Arc::from_raw(raw)
    };
    hooks::restore(if first_entry {
        None
    } else {
        lock(&arrived.exec).take()
    });
    if first_entry {
        lock(&arrived.stack).set_active();
    }
    let origin = runtime::swap_current(Coroutine::from_inner(arrived));
    Arrival { first_entry, origin }
}

/// A full switch between two started coroutines: park the departing side's
/// host context, pivot, arrive.
#[inline(never)]
fn switch_stacks(target: &Coroutine) -> Arrival {
    {
        let current = runtime::current_inner();
        *lock(&current.exec) = hooks::capture();
    }
    pivot_in(target.inner.clone())
}

/// The switch operation. Resolves `target` through the ancestor-fallback
/// chain, then resumes or bootstraps whatever it lands on; returns when
/// something switches back, delivering that switch's payload.
pub(crate) fn switch_to(target: &Coroutine, args: SwitchArgs) -> Result<Payload, Error> {
    runtime::drain_deferred();
    check_switch_allowed(&target.inner)?;
    let mut args = Some(args);
    let mut resolved = target.inner.clone();
    loop {
        match resolved.state() {
            State::Active => {
                if runtime::is_current(&resolved) {
                    // switching to yourself: the payload bounces straight back
                    return take_args(&mut args).deliver();
                }
                trace!("switching to coroutine {}", resolved.id);
                let wrapper = Coroutine::from_inner(resolved.clone());
                *lock(&resolved.args) = Some(take_args(&mut args));
                let arrival = switch_stacks(&wrapper);
                debug_assert!(!arrival.first_entry);
                return finish(arrival);
            }
            State::NotStarted => match bootstrap(&resolved, take_args(&mut args)) {
                Bootstrap::Raced(returned) => {
                    // someone re-entrant got there first; retry as a resume
                    args = Some(returned);
                }
                Bootstrap::Resumed(arrival) => return finish(arrival),
            },
            State::Dead => {
                // ancestor fallback: the parent tree doubles as a
                // scheduling chain
                resolved = match resolved.parent_arc() {
                    Some(p) => p,
                    None => return Err(Error::Unrooted),
                };
            }
        }
    }
}

fn take_args(args: &mut Option<SwitchArgs>) -> SwitchArgs {
    args.take().unwrap_or(SwitchArgs::Value(Payload::none()))
}

/// Runs on the resumed side of a completed switch: consume whatever payload
/// our resumer parked on us, fire the trace hook, deliver.
fn finish(arrival: Arrival) -> Result<Payload, Error> {
    let me = runtime::current_coroutine();
    let args = lock(&me.inner.args).take();
    let args = args.unwrap_or(SwitchArgs::Value(Payload::none()));
    let event = if args.is_throw() {
        TraceEvent::Throw
    } else {
        TraceEvent::Switch
    };
    runtime::fire_trace(event, &arrival.origin, &me);
    args.deliver()
}

/// Preconditions, checked before any stack is touched: the target's family
/// must be rooted on this very thread.
fn check_switch_allowed(target: &Arc<Inner>) -> Result<(), Error> {
    let root = coroutine::find_root(target).ok_or(Error::Unrooted)?;
    match coroutine::stamp_of(&root) {
        None => Err(Error::ThreadGone),
        Some(stamp) if stamp != runtime::with(|ctx| ctx.id) => Err(Error::WrongThread),
        Some(_) => Ok(()),
    }
}

enum Bootstrap {
    /// The target started while we were resolving; retry the switch.
    Raced(SwitchArgs),
    /// We were eventually switched back into; the switch is complete.
    Resumed(Arrival),
}

/// First switch into a coroutine that has never run.
///
/// The pivot for a first entry returns twice: once here with
/// `first_entry` set (the frame below this one has become the new
/// coroutine, which runs its entry point and never returns), and once more
/// much later, when something switches back into the original caller.
#[inline(never)]
fn bootstrap(target: &Arc<Inner>, args: SwitchArgs) -> Bootstrap {
    if target.is_started() {
        return Bootstrap::Raced(args);
    }
    // Park the payload on the target: this frame's locals won't survive the
    // arbitrary switching that can happen before the entry point consumes it.
    *lock(&target.args) = Some(args);
    let mark: usize = 0;
    let mark = &mark as *const usize as *mut u8;
    {
        let current = runtime::current_inner();
        let family = lock(&current.root).clone();
        *lock(&target.root) = family;
        let prev = stack::chain_anchor(&current);
        lock(&target.stack).anchor(mark, prev);
    }
    debug!("bootstrapping coroutine {}", target.id);
    let wrapper = Coroutine::from_inner(target.clone());
    let arrival = switch_stacks(&wrapper);
    if arrival.first_entry {
        enter(arrival.origin)
    }
    Bootstrap::Resumed(arrival)
}

/// The first frames of a freshly entered coroutine. Runs the entry point
/// under a panic boundary and never returns: control leaves through the
/// death switch, and any unwind that reaches this frame aborts the process,
/// because the frames below it belong to other coroutines and cannot be
/// unwound across a pivot.
fn enter(origin: Coroutine) -> ! {
    let _ = catch_unwind(AssertUnwindSafe(move || {
        let result = {
            let me = runtime::current_coroutine();
            let args = lock(&me.inner.args).take();
            let event = match &args {
                Some(a) if a.is_throw() => TraceEvent::Throw,
                _ => TraceEvent::Switch,
            };
            runtime::fire_trace(event, &origin, &me);
            drop(origin);
            let result = match args {
                // thrown into before ever running: the entry point is skipped
                Some(SwitchArgs::Throw(e)) => Err(e),
                Some(SwitchArgs::Value(p)) => run_entry(&me, p),
                None => run_entry(&me, Payload::none()),
            };
            // an uncaught exit marker is a clean death, not an error
            match result {
                Err(Error::Exit) => Ok(Payload::none()),
                other => other,
            }
            // `me` dropped here: nothing owned may ride into the death switch
        };
        die(result);
    }));
    error!("unwind escaped a coroutine boundary; aborting");
    std::process::abort();
}

/// Run the entry point, converting a panic into an error for the resumer.
fn run_entry(me: &Coroutine, payload: Payload) -> Result<Payload, Error> {
    match me.inner.take_entry() {
        Some(entry) => match catch_unwind(AssertUnwindSafe(move || entry(payload))) {
            Ok(result) => result,
            Err(panic) => Err(Error::Panicked(PanicPayload(panic))),
        },
        None => Ok(Payload::none()),
    }
}

/// Tear the current coroutine down and hand its result to the nearest live
/// ancestor. There is nothing to come back to: the dying slice is dropped
/// from the stack chain and its bytes are never saved.
fn die(result: Result<Payload, Error>) -> ! {
    let successor = {
        let me = runtime::current_inner();
        debug!("coroutine {} finished", me.id);
        let my_root = lock(&me.root).upgrade();
        let parent = me.parent_arc();
        coroutine::mark_dead(&me);
        let mut next = parent;
        loop {
            match next {
                None => break None,
                Some(c) if c.state() == State::Dead => next = c.parent_arc(),
                Some(c) => {
                    // A started ancestor must live on our thread; a never
                    // started one gets bound to it when we anchor it below.
                    let same_family = !c.is_started()
                        || match (&my_root, coroutine::find_root(&c)) {
                            (Some(a), Some(b)) => Arc::ptr_eq(a, &b),
                            _ => false,
                        };
                    if !same_family {
                        break None;
                    }
                    break Some(c);
                }
            }
        }
    };
    match successor {
        Some(c) => final_switch(c, result),
        None => {
            // Deliberate policy: with no thread left to receive the result,
            // there is nothing to continue.
            error!("coroutine died with no live ancestor; aborting");
            std::process::abort();
        }
    }
}

/// The dying coroutine's last pivot. Nothing owned may be live here when the
/// stack moves: the result is parked on the successor and the successor
/// `Arc` itself is consumed by the publication.
fn final_switch(successor: Arc<Inner>, result: Result<Payload, Error>) -> ! {
    *lock(&successor.args) = Some(SwitchArgs::from(result));
    let started = successor.is_started();
    if !started {
        // Dying straight into a never-run ancestor: anchor it on what is,
        // for a moment longer, our stack.
        let mark: usize = 0;
        let mark = &mark as *const usize as *mut u8;
        let current = runtime::current_inner();
        let family = lock(&current.root).clone();
        *lock(&successor.root) = family;
        let prev = stack::chain_anchor(&current);
        lock(&successor.stack).anchor(mark, prev);
    }
    let arrival = pivot_in(successor);
    // Only reachable when the dying frame continued as a fresh ancestor's
    // first entry; a resume into this frame is impossible.
    if arrival.first_entry {
        enter(arrival.origin)
    }
    error!("resumed a dead coroutine's stack; aborting");
    std::process::abort();
}
