use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};

use sapling::{
    collect_garbage, current, set_trace, spawn, spawn_with_parent, Coroutine, Error, PanicPayload,
    Payload, State, TraceEvent,
};

fn val(r: Result<Payload, Error>) -> i64 {
    r.unwrap().downcast::<i64>().unwrap()
}

#[test]
fn round_trip_switch() {
    let root = current();
    let b = spawn(move |p| {
        let x: i64 = p.downcast().unwrap();
        let y: i64 = root.switch(Payload::new(x * 3))?.downcast().unwrap();
        Ok(Payload::new(y + 1))
    });
    assert_eq!(val(b.switch(Payload::new(7i64))), 21);
    assert!(b.is_active());
    // resuming lets it finish; its result lands in its parent, which is us
    assert_eq!(val(b.switch(Payload::new(10i64))), 11);
    assert!(b.is_dead());
}

#[test]
fn doubling_scenario() {
    let root = current();
    let a = spawn(move |p| {
        let x: i64 = p.downcast().unwrap();
        let x: i64 = root.switch(Payload::new(x * 2))?.downcast().unwrap();
        Ok(Payload::new(x + 1))
    });
    assert_eq!(val(a.switch(Payload::new(5i64))), 10);
    assert_eq!(val(a.switch(Payload::new(100i64))), 101);
    assert!(a.is_dead());
    // dead target: the payload bounces back off the nearest live ancestor,
    // which happens to be us
    assert_eq!(val(a.switch(Payload::new(31i64))), 31);
}

#[test]
fn fallback_to_parent() {
    let root = current();
    let relay = spawn(move |p| {
        let mut x: i64 = p.downcast().unwrap();
        loop {
            x = root.switch(Payload::new(x * 10))?.downcast().unwrap();
        }
    });
    assert_eq!(val(relay.switch(Payload::new(1i64))), 10);
    // a child that dies instantly hands its payload to its parent, the relay
    let child = spawn_with_parent(|p| Ok(p), &relay);
    assert_eq!(val(child.switch(Payload::new(7i64))), 70);
    assert!(child.is_dead());
    // switching to the dead child now behaves exactly like switching to the
    // relay directly
    assert_eq!(val(child.switch(Payload::new(5i64))), 50);
    assert_eq!(val(relay.switch(Payload::new(5i64))), 50);
}

#[test]
fn parent_cycles_rejected() {
    let a = spawn(|p| Ok(p));
    let b = spawn_with_parent(|p| Ok(p), &a);
    assert!(matches!(a.set_parent(&a), Err(Error::ParentCycle)));
    assert!(matches!(a.set_parent(&b), Err(Error::ParentCycle)));
    // the tree is untouched by the failed attempts
    assert_eq!(b.parent().unwrap(), a);
    assert_eq!(a.parent().unwrap(), current());
    let c = spawn(|p| Ok(p));
    b.set_parent(&c).unwrap();
    assert_eq!(b.parent().unwrap(), c);
}

#[test]
fn thread_affinity_enforced() {
    let root = current();
    let a = spawn(move |p| {
        let y: i64 = root.switch(p)?.downcast().unwrap();
        Ok(Payload::new(y))
    });
    assert_eq!(val(a.switch(Payload::new(4i64))), 4);
    let handle = a.clone();
    let rejected = std::thread::spawn(move || {
        matches!(handle.switch(Payload::new(9i64)), Err(Error::WrongThread))
    })
    .join()
    .unwrap();
    assert!(rejected);
    // nothing was mutated over there: resuming here still works
    assert_eq!(val(a.switch(Payload::new(8i64))), 8);
    assert!(a.is_dead());
}

#[test]
fn bootstrap_runs_entry_exactly_once() {
    let entries = Arc::new(AtomicUsize::new(0));
    let counter = entries.clone();
    let root = current();
    let a = spawn(move |p| {
        counter.fetch_add(1, Ordering::SeqCst);
        // a switch to ourselves must not bootstrap again
        let p = current().switch(p)?;
        let p = root.switch(p)?;
        Ok(p)
    });
    assert_eq!(val(a.switch(Payload::new(5i64))), 5);
    assert_eq!(entries.load(Ordering::SeqCst), 1);
    a.switch(Payload::none()).unwrap();
    assert!(a.is_dead());
    assert_eq!(entries.load(Ordering::SeqCst), 1);
}

#[test]
fn discarding_unstarted_never_runs_it() {
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let c = spawn(move |p| {
        flag.store(true, Ordering::SeqCst);
        Ok(p)
    });
    assert_eq!(c.state(), State::NotStarted);
    drop(c);
    collect_garbage();
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn kill_before_start() {
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let c = spawn(move |p| {
        flag.store(true, Ordering::SeqCst);
        Ok(p)
    });
    let out = c.kill().unwrap();
    assert!(out.is_none());
    assert!(c.is_dead());
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn dropping_last_handle_delivers_exit() {
    struct Canary(Arc<AtomicBool>);
    impl Drop for Canary {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }
    let dropped = Arc::new(AtomicBool::new(false));
    let canary = Canary(dropped.clone());
    let root = current();
    let c = spawn(move |p| {
        let _canary = canary;
        let p = root.switch(p)?;
        Ok(p)
    });
    c.switch(Payload::new(1i64)).unwrap();
    assert!(c.is_active());
    assert!(!dropped.load(Ordering::SeqCst));
    drop(c);
    assert!(dropped.load(Ordering::SeqCst));
}

#[test]
fn exit_is_catchable() {
    let root = current();
    let c = spawn(move |p| match root.switch(p) {
        Err(Error::Exit) => Ok(Payload::new("tidy")),
        other => other,
    });
    c.switch(Payload::none()).unwrap();
    let out = c.kill().unwrap();
    assert_eq!(out.downcast::<&str>().unwrap(), "tidy");
    assert!(c.is_dead());
    // exiting the already-exited is a plain value switch
    assert!(c.kill().unwrap().is_none());
}

#[test]
fn thrown_errors_surface_at_the_suspension_point() {
    let root = current();
    let c = spawn(move |p| root.switch(p));
    c.switch(Payload::none()).unwrap();
    let err = c
        .throw(Error::Panicked(PanicPayload(Box::new("boom"))))
        .unwrap_err();
    match err {
        // the entry let it propagate, so it came back to us through the
        // parent chain
        Error::Panicked(p) => assert_eq!(p.message(), Some("boom")),
        other => panic!("unexpected: {other:?}"),
    }
    assert!(c.is_dead());
}

#[test]
fn entry_panic_is_captured() {
    let c = spawn(|_| panic!("kaboom"));
    let err = c.switch(Payload::none()).unwrap_err();
    match err {
        Error::Panicked(p) => assert_eq!(p.message(), Some("kaboom")),
        other => panic!("unexpected: {other:?}"),
    }
    assert!(c.is_dead());
}

#[test]
fn trace_hook_observes_switches() {
    let log: Rc<RefCell<Vec<(TraceEvent, u64, u64)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    let old = set_trace(Some(Box::new(move |event, origin, target| {
        sink.borrow_mut().push((event, origin.id(), target.id()));
    })));
    assert!(old.is_none());

    let root = current();
    let root_id = root.id();
    let c = spawn(move |p| root.switch(p));
    let c_id = c.id();
    c.switch(Payload::none()).unwrap();
    assert_eq!(
        &*log.borrow(),
        &[
            (TraceEvent::Switch, root_id, c_id),
            (TraceEvent::Switch, c_id, root_id),
        ]
    );
    log.borrow_mut().clear();

    c.throw(Error::Panicked(PanicPayload(Box::new("x"))))
        .unwrap_err();
    assert_eq!(
        &*log.borrow(),
        &[
            (TraceEvent::Throw, root_id, c_id),
            (TraceEvent::Throw, c_id, root_id),
        ]
    );
    assert!(set_trace(None).is_some());
}

#[test]
fn suspended_coroutine_reports_saved_bytes() {
    let root = current();
    let c = spawn(move |p| {
        let p = root.switch(p)?;
        Ok(p)
    });
    assert_eq!(c.stack_saved(), 0);
    c.switch(Payload::none()).unwrap();
    // yielding to the root reclaims the whole slice
    assert!(c.stack_saved() > 0);
    c.switch(Payload::none()).unwrap();
    assert_eq!(c.stack_saved(), 0);
    assert!(c.is_dead());
}

#[test]
fn siblings_interleave() {
    let root = current();
    let r2 = root.clone();
    let a = spawn(move |p| {
        let mut x: i64 = p.downcast().unwrap();
        loop {
            x = root.switch(Payload::new(x + 1))?.downcast().unwrap();
        }
    });
    let b = spawn(move |p| {
        let mut x: i64 = p.downcast().unwrap();
        loop {
            x = r2.switch(Payload::new(x * 2))?.downcast().unwrap();
        }
    });
    // interleaving forces each sibling's slice out to the heap and back
    // around the other's
    for i in 0..10i64 {
        assert_eq!(val(a.switch(Payload::new(i))), i + 1);
        assert_eq!(val(b.switch(Payload::new(i))), i * 2);
    }
}

#[test]
fn yields_from_deep_frames() {
    fn descend(root: &Coroutine, depth: i64, acc: i64) -> Result<i64, Error> {
        if depth == 0 {
            let got: i64 = root.switch(Payload::new(acc))?.downcast().unwrap();
            Ok(got + acc)
        } else {
            descend(root, depth - 1, acc + depth)
        }
    }
    let root = current();
    let c = spawn(move |p| {
        let start: i64 = p.downcast().unwrap();
        let out = descend(&root, 32, start)?;
        Ok(Payload::new(out))
    });
    // 1 + 2 + ... + 32
    assert_eq!(val(c.switch(Payload::new(0i64))), 528);
    assert!(c.stack_saved() > 0);
    assert_eq!(val(c.switch(Payload::new(1000i64))), 1528);
    assert!(c.is_dead());
}

#[test]
fn cross_thread_drop_defers_to_owner() {
    let (to_main, from_worker) = mpsc::channel();
    let (to_worker, from_main) = mpsc::channel();
    let exited = Arc::new(AtomicBool::new(false));
    let observed = exited.clone();
    let worker = std::thread::spawn(move || {
        let root = current();
        let c = spawn(move |p| match root.switch(p) {
            Err(Error::Exit) => {
                observed.store(true, Ordering::SeqCst);
                Err(Error::Exit)
            }
            other => other,
        });
        c.switch(Payload::none()).unwrap();
        to_main.send(c).unwrap(); // the only handle crosses threads
        from_main.recv().unwrap(); // wait for main to drop it
        collect_garbage(); // the owner settles the kill
        exited.load(Ordering::SeqCst)
    });
    let c = from_worker.recv().unwrap();
    drop(c); // wrong thread: queued for the owner instead of killed here
    to_worker.send(()).unwrap();
    assert!(worker.join().unwrap());
}

#[test]
fn resuming_after_owner_thread_exit_fails_cleanly() {
    let c = std::thread::spawn(|| {
        let root = current();
        let c = spawn(move |p| root.switch(p));
        c.switch(Payload::none()).unwrap();
        c
    })
    .join()
    .unwrap();
    assert!(matches!(c.switch(Payload::none()), Err(Error::ThreadGone)));
    assert!(matches!(c.kill(), Err(Error::ThreadGone)));
}

#[test]
fn entry_point_is_fixed_once_started() {
    let root = current();
    let c = spawn(|_| Ok(Payload::new(1i64)));
    c.set_entry(|_| Ok(Payload::new(2i64))).unwrap();
    assert_eq!(val(c.switch(Payload::none())), 2);
    assert!(matches!(
        c.set_entry(|_| Ok(Payload::none())),
        Err(Error::Started)
    ));
    let d = spawn(move |p| root.switch(p));
    d.switch(Payload::none()).unwrap();
    assert!(matches!(
        d.set_entry(|_| Ok(Payload::none())),
        Err(Error::Started)
    ));
}

#[test]
fn started_coroutines_cannot_change_family() {
    let foreign = std::thread::spawn(|| {
        let root = current();
        let c = spawn(move |p| root.switch(p));
        c.switch(Payload::none()).unwrap();
        c
    })
    .join()
    .unwrap();
    let root = current();
    let local = spawn(move |p| root.switch(p));
    local.switch(Payload::none()).unwrap();
    assert!(matches!(
        local.set_parent(&foreign),
        Err(Error::CrossThreadParent)
    ));
    assert!(matches!(current().set_parent(&local), Err(Error::Root)));
}

#[test]
fn current_is_stable_and_root() {
    let a = current();
    let b = current();
    assert_eq!(a, b);
    assert!(a.is_root());
    assert!(a.is_active());
    assert!(a.is_started());
    assert!(a.parent().is_none());
    assert!(sapling::total_root_coroutines() >= 1);
}

#[test]
fn payload_downcast() {
    let p = Payload::new(5i64);
    assert!(p.downcast_ref::<i64>().is_some());
    let p = p.downcast::<String>().unwrap_err();
    assert_eq!(p.downcast::<i64>().unwrap(), 5);
    assert!(Payload::none().is_none());
}

// Context hooks are process-wide, so this recorder must stay coherent even
// while other tests switch concurrently: every snapshot is the same value,
// and the assertions below are monotonic.
struct Recorder {
    captures: AtomicUsize,
    fresh_restores: AtomicUsize,
    saved_restores: AtomicUsize,
}

impl sapling::ContextHooks for Recorder {
    fn capture(&self) -> sapling::ContextSnapshot {
        self.captures.fetch_add(1, Ordering::SeqCst);
        Box::new(42u32)
    }

    fn restore(&self, snapshot: Option<sapling::ContextSnapshot>) {
        match snapshot {
            None => self.fresh_restores.fetch_add(1, Ordering::SeqCst),
            Some(b) => {
                assert_eq!(*b.downcast::<u32>().unwrap(), 42);
                self.saved_restores.fetch_add(1, Ordering::SeqCst)
            }
        };
    }
}

static RECORDER: Recorder = Recorder {
    captures: AtomicUsize::new(0),
    fresh_restores: AtomicUsize::new(0),
    saved_restores: AtomicUsize::new(0),
};

#[test]
fn context_hooks_ride_along_with_switches() {
    sapling::set_context_hooks(&RECORDER);
    let before = RECORDER.captures.load(Ordering::SeqCst);
    let root = current();
    let c = spawn(move |p| root.switch(p));
    // bootstrap: capture us, restore a fresh context; yield: capture it,
    // restore ours
    c.switch(Payload::none()).unwrap();
    // resume: capture us, restore its snapshot; death: restore ours
    c.switch(Payload::none()).unwrap();
    assert!(RECORDER.captures.load(Ordering::SeqCst) >= before + 3);
    assert!(RECORDER.fresh_restores.load(Ordering::SeqCst) >= 1);
    assert!(RECORDER.saved_restores.load(Ordering::SeqCst) >= 2);
}
