use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};

use crate::error::Error;
use crate::hooks::ContextSnapshot;
use crate::payload::{Payload, SwitchArgs};
use crate::runtime::{self, lock};
use crate::stack::StackState;

/// A coroutine's entry point. Receives the payload of the switch that
/// started it; its result is forwarded to the nearest live ancestor.
pub type Entry = Box<dyn FnOnce(Payload) -> Result<Payload, Error> + Send + 'static>;

/// Where a coroutine is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Created but never switched into; holds no stack bytes.
    NotStarted,
    /// Has live (or evacuated) stack content: running or suspended.
    Active,
    /// Finished or killed. Terminal; the object may linger as a reference
    /// target but will never run again.
    Dead,
}

/// The two concrete kinds of coroutine. Root coroutines stand for a thread's
/// original stack and exist one per thread; spawned ones carry an entry
/// point and a parent link.
pub(crate) enum Kind {
    Root {
        /// The owning thread's context id; cleared when that thread exits so
        /// resume attempts fail instead of touching a dead stack.
        thread: Mutex<Option<u64>>,
    },
    Spawned {
        entry: Mutex<Option<Entry>>,
        parent: Mutex<Option<Arc<Inner>>>,
    },
}

pub(crate) struct Inner {
    pub(crate) id: u64,
    /// User-visible handles, distinct from the `Arc` count: internal links
    /// (parent, stack chain, queues) don't keep a coroutine reachable.
    pub(crate) handles: AtomicUsize,
    pub(crate) kind: Kind,
    pub(crate) stack: Mutex<StackState>,
    /// Host bookkeeping parked here while the coroutine is suspended.
    pub(crate) exec: Mutex<Option<ContextSnapshot>>,
    /// The payload of the switch currently in flight towards us.
    pub(crate) args: Mutex<Option<SwitchArgs>>,
    /// Root coroutine of the thread we last ran on. Weak: a coroutine must
    /// not keep its thread's root alive after the thread is gone.
    pub(crate) root: Mutex<Weak<Inner>>,
}

// The raw pointers inside `StackState` are addresses into the owning
// thread's native stack; they are only ever dereferenced by that thread,
// mid-pivot. Every other field is either plainly `Send` or guarded by a
// `Mutex`. Cross-thread access is limited to state queries and to freeing
// heap buffers after the owning thread is known to be gone.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl Inner {
    pub(crate) fn state(&self) -> State {
        let st = lock(&self.stack);
        if st.active() {
            State::Active
        } else if st.started() {
            State::Dead
        } else {
            State::NotStarted
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        lock(&self.stack).started()
    }

    pub(crate) fn is_active(&self) -> bool {
        lock(&self.stack).active()
    }

    pub(crate) fn parent_arc(&self) -> Option<Arc<Inner>> {
        match &self.kind {
            Kind::Root { .. } => None,
            Kind::Spawned { parent, .. } => lock(parent).clone(),
        }
    }

    pub(crate) fn take_entry(&self) -> Option<Entry> {
        match &self.kind {
            Kind::Root { .. } => None,
            Kind::Spawned { entry, .. } => lock(entry).take(),
        }
    }
}

/// The root coroutine's owning thread, if it is still running.
pub(crate) fn stamp_of(root: &Arc<Inner>) -> Option<u64> {
    match &root.kind {
        Kind::Root { thread } => *lock(thread),
        Kind::Spawned { .. } => None,
    }
}

/// The root coroutine reachable from `this`: its own recorded root once it
/// has started, otherwise the first one found up the parent chain.
pub(crate) fn find_root(this: &Arc<Inner>) -> Option<Arc<Inner>> {
    let mut cur = this.clone();
    loop {
        if matches!(cur.kind, Kind::Root { .. }) {
            return Some(cur);
        }
        if cur.is_started() {
            return lock(&cur.root).upgrade();
        }
        let next = cur.parent_arc()?;
        cur = next;
    }
}

/// Strip a finished coroutine down to its identity: stack bytes, host
/// snapshot, pending payload and entry point all go. The parent link stays;
/// dead coroutines still route switches to their ancestors.
pub(crate) fn mark_dead(inner: &Arc<Inner>) {
    lock(&inner.stack).release_bytes();
    *lock(&inner.exec) = None;
    inner.take_entry();
}

/// Dispose of a coroutine whose thread is already gone. No code can run on a
/// stack that no longer exists, so there is nothing to deliver an exit to:
/// just drop the resources and sever the thread affinity.
pub(crate) fn deactivate_and_free(inner: &Arc<Inner>) {
    debug!("coroutine {} outlived its thread; freeing in place", inner.id);
    lock(&inner.stack).force_dead();
    *lock(&inner.exec) = None;
    *lock(&inner.args) = None;
    *lock(&inner.root) = Weak::new();
    inner.take_entry();
}

/// Deliver the exit marker to a coroutine that became unreachable while
/// still active, on its own thread. The victim's parent is temporarily
/// repointed at the current coroutine so control comes straight back here
/// instead of wandering off to the victim's real parent.
pub(crate) fn kill_in_place(inner: &Arc<Inner>) {
    debug!("killing unreachable coroutine {}", inner.id);
    let me = runtime::current_inner();
    let old_parent = match &inner.kind {
        Kind::Spawned { parent, .. } => mem::replace(&mut *lock(parent), Some(me)),
        Kind::Root { .. } => return,
    };
    let victim = Coroutine::from_inner(inner.clone());
    let _ = crate::switch::switch_to(&victim, SwitchArgs::Throw(Error::Exit));
    if let Kind::Spawned { parent, .. } = &inner.kind {
        *lock(parent) = old_parent;
    }
    if victim.is_active() {
        // It caught the exit and switched away again. Nothing more we can
        // safely do; keep the handle forever rather than retry on every drop.
        warn!("exit did not kill coroutine {}; leaking it", inner.id);
        mem::forget(victim);
    }
}

/// Runs when the last user handle to a coroutine goes away.
fn reap(inner: &Arc<Inner>) {
    if matches!(inner.kind, Kind::Root { .. }) {
        // roots die with their thread, not with their handles
        return;
    }
    match inner.state() {
        State::Dead => {}
        State::NotStarted => {
            // discarded before ever running: straight to dead, no stack
            // resources were ever allocated
            debug!("coroutine {} discarded before starting", inner.id);
            lock(&inner.stack).force_dead();
            *lock(&inner.args) = None;
            inner.take_entry();
        }
        State::Active => {
            let stamp = find_root(inner).and_then(|r| stamp_of(&r));
            match (stamp, runtime::current_thread_id()) {
                (None, _) => deactivate_and_free(inner),
                (Some(owner), Some(here)) if owner == here => kill_in_place(inner),
                (Some(owner), _) => runtime::defer_destroy(owner, inner.clone()),
            }
        }
    }
}

/// A handle to a coroutine.
///
/// Handles are cheap to clone and may be sent between threads, but a started
/// coroutine only ever runs on the thread it first ran on; operations from
/// anywhere else fail with [`Error::WrongThread`]. When the last handle to a
/// still-active coroutine is dropped, the runtime delivers [`Error::Exit`]
/// into it so its entry point can unwind and release what it holds.
pub struct Coroutine {
    pub(crate) inner: Arc<Inner>,
}

impl Coroutine {
    pub(crate) fn from_inner(inner: Arc<Inner>) -> Coroutine {
        inner.handles.fetch_add(1, Ordering::Relaxed);
        Coroutine { inner }
    }

    pub(crate) fn new_spawned(entry: Entry, parent: Arc<Inner>) -> Coroutine {
        let inner = Arc::new(Inner {
            id: runtime::next_coroutine_id(),
            handles: AtomicUsize::new(1),
            kind: Kind::Spawned {
                entry: Mutex::new(Some(entry)),
                parent: Mutex::new(Some(parent)),
            },
            stack: Mutex::new(StackState::new_unstarted()),
            exec: Mutex::new(None),
            args: Mutex::new(None),
            root: Mutex::new(Weak::new()),
        });
        debug!("spawned coroutine {}", inner.id);
        Coroutine { inner }
    }

    /// Stable identity for the lifetime of the coroutine object.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> State {
        self.inner.state()
    }

    /// Has the first switch-in happened yet?
    pub fn is_started(&self) -> bool {
        self.inner.is_started()
    }

    /// Running or suspended with live stack content.
    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    pub fn is_dead(&self) -> bool {
        self.state() == State::Dead
    }

    /// Is this a thread's root coroutine?
    pub fn is_root(&self) -> bool {
        matches!(self.inner.kind, Kind::Root { .. })
    }

    /// Bytes of this coroutine's stack slice currently evacuated to the
    /// heap. Zero for a coroutine whose region nobody has reclaimed.
    pub fn stack_saved(&self) -> usize {
        lock(&self.inner.stack).saved_bytes()
    }

    pub fn parent(&self) -> Option<Coroutine> {
        self.inner.parent_arc().map(Coroutine::from_inner)
    }

    /// Rewire this coroutine's parent link.
    ///
    /// The tree must stay a tree (no cycles), and a started coroutine can
    /// only be moved within its own thread's family, by that thread.
    pub fn set_parent(&self, new_parent: &Coroutine) -> Result<(), Error> {
        let slot = match &self.inner.kind {
            Kind::Root { .. } => return Err(Error::Root),
            Kind::Spawned { parent, .. } => parent,
        };
        // would we appear in our own ancestry?
        let mut p = Some(new_parent.inner.clone());
        while let Some(n) = p {
            if Arc::ptr_eq(&n, &self.inner) {
                return Err(Error::ParentCycle);
            }
            p = n.parent_arc();
        }
        if self.is_started() {
            let mine = find_root(&self.inner);
            let theirs = find_root(&new_parent.inner);
            match (&mine, &theirs) {
                (Some(a), Some(b)) if Arc::ptr_eq(a, b) => {}
                _ => return Err(Error::CrossThreadParent),
            }
            let owner = mine.and_then(|r| stamp_of(&r));
            if owner != runtime::current_thread_id() {
                return Err(Error::WrongThread);
            }
        }
        *lock(slot) = Some(new_parent.inner.clone());
        Ok(())
    }

    /// Replace the entry point. Only possible before the first switch-in.
    pub fn set_entry<F>(&self, entry: F) -> Result<(), Error>
    where
        F: FnOnce(Payload) -> Result<Payload, Error> + Send + 'static,
    {
        match &self.inner.kind {
            Kind::Root { .. } => Err(Error::Started),
            Kind::Spawned { entry: slot, .. } => {
                if self.is_started() {
                    return Err(Error::Started);
                }
                *lock(slot) = Some(Box::new(entry));
                Ok(())
            }
        }
    }

    /// Transfer control to this coroutine, delivering `payload`.
    ///
    /// Returns when something switches back here, with whatever value (or
    /// error) that switch carried. Switching to a dead coroutine falls
    /// through to its nearest live ancestor; if that ancestor is the caller,
    /// the payload simply bounces back.
    pub fn switch(&self, payload: Payload) -> Result<Payload, Error> {
        crate::switch::switch_to(self, SwitchArgs::Value(payload))
    }

    /// Like [`switch`](Coroutine::switch), but the target's suspended switch
    /// call returns `Err(error)` instead of a value.
    pub fn throw(&self, error: Error) -> Result<Payload, Error> {
        if self.is_dead() && error.is_exit() {
            // exiting the already-exited degenerates to a plain value switch
            return crate::switch::switch_to(self, SwitchArgs::Value(Payload::none()));
        }
        crate::switch::switch_to(self, SwitchArgs::Throw(error))
    }

    /// Ask the coroutine to terminate by raising [`Error::Exit`] at its
    /// suspension point. A coroutine that lets the marker propagate dies
    /// cleanly and its parent receives an empty payload.
    pub fn kill(&self) -> Result<Payload, Error> {
        self.throw(Error::Exit)
    }
}

impl Clone for Coroutine {
    fn clone(&self) -> Coroutine {
        Coroutine::from_inner(self.inner.clone())
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        if self.inner.handles.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        std::sync::atomic::fence(Ordering::Acquire);
        reap(&self.inner);
    }
}

impl PartialEq for Coroutine {
    fn eq(&self, other: &Coroutine) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Coroutine {}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<Coroutine {}", self.inner.id)?;
        if self.is_root() {
            f.write_str(" root")?;
        }
        if runtime::is_current(&self.inner) {
            f.write_str(" current")?;
        }
        match self.state() {
            State::NotStarted => f.write_str(" pending")?,
            State::Active => f.write_str(" active")?,
            State::Dead => f.write_str(" dead")?,
        }
        f.write_str(">")
    }
}
