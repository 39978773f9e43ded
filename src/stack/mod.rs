//! Bookkeeping for the slices of native stack owned by each coroutine.
//!
//! Every coroutine on a thread shares that thread's one native stack. A
//! coroutine's slice is the address range its frames occupied when it last
//! ran:
//!
//! ```text
//!                |     ^^^       |
//!                |  older data   |
//!   stack_stop   |_______________|
//!                |               |
//!                |  this slice,  |
//!                |  still live   |
//!              * |_______________| . .  _________   heap[..len]
//!                |               |     |         |
//!                |  reclaimed by |     |  newer   |
//!                |  somebody     |     |  part of |
//!   stack_start  |    newer      | . . |the slice |  heap[0]
//!                |_______________|     |_________|
//!                |     vvv       |
//! ```
//!
//! A suspended slice is typically split in two: an older part still sitting
//! at its real addresses, and a newer part evacuated to the heap because a
//! sibling has since grown over that range. Either part may be empty.
//!
//! States are encoded in the two boundary pointers:
//! * both null: never started
//! * `stack_stop` set, `stack_start` null: finished
//! * both set: active (the running coroutine's `stack_start` is a
//!   placeholder until it is next evacuated)
//!
//! Slices on one thread form a chain through `prev`, ordered by address, from
//! the running coroutine up to the root. The chain tracks who owns which
//! bytes right now; it is unrelated to the parent tree. The root coroutine
//! owns the whole rest of the stack, which we mark with the largest possible
//! address since we cannot know where the thread's stack really ends.

use std::sync::Arc;

use crate::coroutine::Inner;
use crate::runtime::lock;

/// Sentinel `stack_stop` for root coroutines: "everything above us".
const ROOT_STACK_STOP: *mut u8 = usize::MAX as *mut u8;

/// Placeholder `stack_start` for a slice that is live but has not been
/// evacuated yet, so its true low watermark is not known.
const SOMEWHERE: *mut u8 = 1 as *mut u8;

pub(crate) struct StackState {
    stack_start: *mut u8,
    stack_stop: *mut u8,
    heap: Vec<u8>,
    /// The slice whose bytes sit immediately above ours on the native stack.
    pub(crate) prev: Option<Arc<Inner>>,
}

impl StackState {
    pub(crate) fn new_unstarted() -> StackState {
        StackState {
            stack_start: core::ptr::null_mut(),
            stack_stop: core::ptr::null_mut(),
            heap: Vec::new(),
            prev: None,
        }
    }

    pub(crate) fn new_root() -> StackState {
        StackState {
            stack_start: SOMEWHERE,
            stack_stop: ROOT_STACK_STOP,
            heap: Vec::new(),
            prev: None,
        }
    }

    pub(crate) fn started(&self) -> bool {
        !self.stack_stop.is_null()
    }

    pub(crate) fn active(&self) -> bool {
        !self.stack_start.is_null()
    }

    pub(crate) fn is_root(&self) -> bool {
        self.stack_stop == ROOT_STACK_STOP
    }

    pub(crate) fn saved_bytes(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn start(&self) -> *mut u8 {
        self.stack_start
    }

    pub(crate) fn stop(&self) -> *mut u8 {
        self.stack_stop
    }

    pub(crate) fn set_start(&mut self, start: *mut u8) {
        self.stack_start = start;
    }

    /// Stake out a new slice ending at `mark`, chained below `prev`'s bytes.
    /// The slice is started but not yet active; it becomes active on the far
    /// side of its first pivot.
    pub(crate) fn anchor(&mut self, mark: *mut u8, prev: Option<Arc<Inner>>) {
        debug_assert!(!self.started());
        self.stack_stop = mark;
        self.prev = prev;
    }

    pub(crate) fn set_active(&mut self) {
        debug_assert!(self.started());
        self.stack_start = SOMEWHERE;
    }

    /// Extend the heap copy to cover `[stack_start, stop)`. The older part
    /// already saved is never copied twice, and a `stop` at or below the
    /// watermark (the reclaimed region doesn't reach our slice) saves
    /// nothing.
    ///
    /// # Safety
    ///
    /// `stack_start` must be the slice's true low watermark and the bytes up
    /// to `stop` must still be live on this thread's stack.
    pub(crate) unsafe fn save_up_to(&mut self, stop: *const u8) {
        let have = self.heap.len() as isize;
        let want = (stop as isize) - (self.stack_start as isize);
        if want > have {
            let src =
                core::slice::from_raw_parts(self.stack_start.offset(have), (want - have) as usize);
            self.heap.extend_from_slice(src);
        }
    }

    /// Put the evacuated bytes back at their real addresses and drop the
    /// heap copy. A slice that was never reclaimed skips the copy entirely.
    ///
    /// # Safety
    ///
    /// The address range must belong to this coroutine again, i.e. the stack
    /// pointer has already been moved below `stack_start`.
    pub(crate) unsafe fn restore_bytes(&mut self) {
        if !self.heap.is_empty() {
            core::ptr::copy_nonoverlapping(self.heap.as_ptr(), self.stack_start, self.heap.len());
            self.heap = Vec::new();
        }
    }

    /// Release the bytes; the slice reads as finished afterwards. The chain
    /// link survives: a dying coroutine's final pivot still walks it, and
    /// [`restore`] severs it once a successor is wired in.
    pub(crate) fn release_bytes(&mut self) {
        self.stack_start = core::ptr::null_mut();
        self.heap = Vec::new();
    }

    /// Release everything, chain link included. Only for coroutines leaving
    /// the stack-ownership game entirely (dead thread, never started).
    pub(crate) fn discard(&mut self) {
        self.release_bytes();
        self.prev = None;
    }

    /// Make a never-started coroutine read as finished. A killed coroutine
    /// that never ran still needs a terminal state.
    pub(crate) fn force_dead(&mut self) {
        if self.stack_stop.is_null() {
            self.stack_stop = SOMEWHERE;
        }
        self.discard();
    }
}

/// Evacuate every slice the incoming region `[.., target_stop)` will
/// overwrite, walking the ownership chain from the coroutine being left.
/// The departing coroutine adopts `stackref` (the pivot's spilled stack
/// pointer) as its new low watermark; a dying one drops out of the chain
/// instead, since its bytes will never be wanted again.
///
/// # Safety
///
/// Must only run between the spill and the stack-pointer move of a pivot on
/// the thread that owns all the slices involved.
pub(crate) unsafe fn evacuate(target: &Arc<Inner>, current: &Arc<Inner>, stackref: *mut u8) {
    let target_stop = lock(&target.stack).stop();
    let mut owner = {
        let mut st = lock(&current.stack);
        if st.active() {
            // a running coroutine is entirely present on the stack
            debug_assert_eq!(st.saved_bytes(), 0);
            st.set_start(stackref);
            current.clone()
        } else {
            match st.prev.clone() {
                Some(p) => p,
                None => return,
            }
        }
    };
    loop {
        let next = {
            let mut st = lock(&owner.stack);
            if !st.active() {
                // stale link to a finished slice; nothing to save
                st.prev.clone()
            } else if st.stop() < target_stop {
                // wholly inside the region being reclaimed
                let stop = st.stop();
                st.save_up_to(stop);
                st.prev.clone()
            } else {
                break;
            }
        };
        match next {
            Some(n) => owner = n,
            None => return,
        }
    }
    if !Arc::ptr_eq(&owner, target) {
        lock(&owner.stack).save_up_to(target_stop);
    }
}

/// Bring `target`'s evacuated bytes back onto the stack and rewire its chain
/// link to the nearest slice strictly above it. Runs on the arrival side of
/// a pivot, after the stack pointer has moved.
///
/// # Safety
///
/// Same as [`evacuate`]: mid-pivot, owner thread only.
pub(crate) unsafe fn restore(target: &Arc<Inner>, current: &Arc<Inner>) {
    let my_stop = {
        let mut st = lock(&target.stack);
        st.restore_bytes();
        st.stop()
    };
    let mut owner = {
        let st = lock(&current.stack);
        if st.active() {
            Some(current.clone())
        } else {
            st.prev.clone()
        }
    };
    while let Some(o) = owner.take() {
        let (stop, active, prev) = {
            let st = lock(&o.stack);
            (st.stop(), st.active(), st.prev.clone())
        };
        if active && stop > my_stop {
            owner = Some(o);
            break;
        }
        owner = prev;
    }
    lock(&target.stack).prev = owner;
    // Once a successor is wired in, a dying coroutine's own link is garbage.
    let mut cur = lock(&current.stack);
    if !cur.active() {
        cur.prev = None;
    }
}

/// First slice in the chain from `current` that still owns stack bytes; the
/// anchor point for a freshly started coroutine's `prev`.
pub(crate) fn chain_anchor(current: &Arc<Inner>) -> Option<Arc<Inner>> {
    let mut c = current.clone();
    loop {
        let (active, prev) = {
            let st = lock(&c.stack);
            (st.active(), st.prev.clone())
        };
        if active {
            return Some(c);
        }
        match prev {
            Some(p) => c = p,
            None => return None,
        }
    }
}
