use core::any::Any;
use core::fmt;

/// The payload of a panic that escaped a coroutine's entry point.
///
/// Carried inside [`Error::Panicked`] so the coroutine that resumed the
/// panicking one can decide whether to inspect it or re-raise it with
/// `std::panic::resume_unwind`.
pub struct PanicPayload(pub Box<dyn Any + Send>);

impl PanicPayload {
    pub fn into_inner(self) -> Box<dyn Any + Send> {
        self.0
    }

    /// Best-effort view of the panic message, for logging.
    pub fn message(&self) -> Option<&str> {
        if let Some(s) = self.0.downcast_ref::<&'static str>() {
            Some(s)
        } else if let Some(s) = self.0.downcast_ref::<String>() {
            Some(s)
        } else {
            None
        }
    }
}

impl fmt::Debug for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.message() {
            Some(m) => write!(f, "PanicPayload({:?})", m),
            None => f.write_str("PanicPayload(..)"),
        }
    }
}

/// Everything that can go wrong with a coroutine, plus the two conditions
/// that travel *through* coroutines: the cooperative exit marker and a
/// captured entry-point panic.
///
/// Usage errors are raised synchronously, before any stack is touched, so a
/// failed call leaves every coroutine exactly as it was.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Cooperative termination marker. Raised inside a coroutine by
    /// [`Coroutine::kill`](crate::Coroutine::kill); catchable like any other
    /// error, and a coroutine that lets it propagate dies *cleanly* (its
    /// parent receives an empty payload rather than this error).
    #[error("coroutine exit")]
    Exit,

    /// The target's family lives on another OS thread. Coroutines are
    /// thread-affine once started.
    #[error("cannot switch to a coroutine bound to a different thread")]
    WrongThread,

    /// The thread the target's family belonged to has already exited, so
    /// there is no stack left to resume onto.
    #[error("coroutine's thread has exited")]
    ThreadGone,

    /// No root coroutine is reachable through the target's parent chain.
    #[error("coroutine has no reachable root")]
    Unrooted,

    /// The requested parent link would make the tree a cycle.
    #[error("parent link would create a cycle")]
    ParentCycle,

    /// A started coroutine can only be reparented within its own thread's
    /// family.
    #[error("cannot move a started coroutine to a parent on a different thread")]
    CrossThreadParent,

    /// Root coroutines represent the thread's original stack; they have no
    /// parent to reassign.
    #[error("cannot reparent a root coroutine")]
    Root,

    /// The operation only makes sense before the first switch-in.
    #[error("coroutine already started")]
    Started,

    /// The coroutine's entry point panicked. The panic was stopped at the
    /// switch boundary and handed to whoever resumed the coroutine.
    #[error("coroutine entry point panicked")]
    Panicked(PanicPayload),
}

impl Error {
    /// True for the cooperative exit marker.
    pub fn is_exit(&self) -> bool {
        matches!(self, Error::Exit)
    }
}
