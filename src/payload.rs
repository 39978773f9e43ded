use core::any::Any;
use core::fmt;

use crate::error::Error;

/// The value carried by a switch.
///
/// Whatever one coroutine passes to [`switch`](crate::Coroutine::switch)
/// comes out of the suspended `switch` call inside the target. The payload is
/// deliberately untyped: the two sides of a switch are usually different
/// functions and the type system has no edge to hang a parameter on.
pub struct Payload(Option<Box<dyn Any + Send>>);

impl Payload {
    /// The empty payload, delivered when a switch carries no value.
    pub fn none() -> Payload {
        Payload(None)
    }

    pub fn new<T: Any + Send>(value: T) -> Payload {
        Payload(Some(Box::new(value)))
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    /// Takes the value out, or gives the payload back if the type is wrong
    /// (or the payload is empty).
    pub fn downcast<T: Any>(self) -> Result<T, Payload> {
        match self.0 {
            Some(b) => match b.downcast::<T>() {
                Ok(v) => Ok(*v),
                Err(b) => Err(Payload(Some(b))),
            },
            None => Err(Payload(None)),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_deref().and_then(|b| b.downcast_ref())
    }
}

impl Default for Payload {
    fn default() -> Payload {
        Payload::none()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.0.is_some() {
            f.write_str("Payload(..)")
        } else {
            f.write_str("Payload(none)")
        }
    }
}

/// What a switch delivers: a value, or an error to raise at the target's
/// suspension point. Parked on the target immediately before the stacks move
/// and consumed immediately on arrival.
pub(crate) enum SwitchArgs {
    Value(Payload),
    Throw(Error),
}

impl SwitchArgs {
    /// Unpack on the receiving side.
    pub(crate) fn deliver(self) -> Result<Payload, Error> {
        match self {
            SwitchArgs::Value(p) => Ok(p),
            SwitchArgs::Throw(e) => Err(e),
        }
    }

    pub(crate) fn is_throw(&self) -> bool {
        matches!(self, SwitchArgs::Throw(_))
    }
}

impl From<Result<Payload, Error>> for SwitchArgs {
    fn from(r: Result<Payload, Error>) -> SwitchArgs {
        match r {
            Ok(p) => SwitchArgs::Value(p),
            Err(e) => SwitchArgs::Throw(e),
        }
    }
}
