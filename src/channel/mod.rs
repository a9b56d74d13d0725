//! Suspension-based channels.
//!
//! Two implementations share this vocabulary:
//!
//! - [`spsc`]: a lock-free bounded ring for exactly one producer and one
//!   consumer, with one parked waiter per side;
//! - [`multi`]: a rendezvous channel with a queue of waiting senders or
//!   receivers, safe for any number of parties.
//!
//! Channel operations that can suspend return a step enum instead of
//! blocking: `Suspended` means the caller's continuation was parked and
//! the outcome will arrive through its delegate.

pub mod multi;
pub mod spsc;

pub use multi::MultiChannel;
pub use spsc::{spsc_channel, SpscReceiver, SpscSender};

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::error::{CancelCause, CloseHandlerError, DynError, RecvError};
use crate::exception::invoke_handler_safely;

/// A received value, or the marker that the channel closed instead.
#[derive(Debug)]
pub enum ValueOrClosed<E> {
    /// A delivered element.
    Value(E),
    /// The channel closed (with an optional cause) before an element
    /// could be delivered.
    Closed(Option<DynError>),
}

impl<E> ValueOrClosed<E> {
    /// `true` for the closed marker.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    /// Converts the closed marker into an error.
    pub fn into_result(self) -> Result<E, RecvError> {
        match self {
            Self::Value(v) => Ok(v),
            Self::Closed(cause) => Err(RecvError::Closed(cause)),
        }
    }
}

/// Outcome of a single-producer send attempt. The element travels back to
/// the producer in every non-terminal outcome so it can be retried.
#[derive(Debug)]
pub enum SendStep<E> {
    /// The element was published.
    Sent,
    /// No capacity; the producer's continuation is parked. Retry with the
    /// returned element once the continuation resumes.
    Suspended(E),
    /// The channel is closed for send.
    Closed(E, Option<DynError>),
    /// The producer's job was cancelled while parked.
    Cancelled(E, CancelCause),
}

/// Outcome of a single-consumer receive attempt.
#[derive(Debug)]
pub enum ReceiveStep<E> {
    /// An element was taken.
    Value(E),
    /// The channel is empty; the consumer's continuation is parked. Retry
    /// once the continuation resumes.
    Suspended,
    /// The channel is closed and drained.
    Closed(Option<DynError>),
    /// The consumer's job was cancelled while parked.
    Cancelled(CancelCause),
}

/// Outcome of a rendezvous send. After `Suspended` the element lives in
/// the channel's waiter queue; the final outcome (delivered or failed)
/// arrives through the sender's delegate.
#[derive(Debug)]
pub enum MultiSendStep<E> {
    /// A receiver took the element synchronously.
    Sent,
    /// The sender is queued with its element.
    Suspended,
    /// The channel is closed for send.
    Closed(E, Option<DynError>),
    /// The queued element was rejected (channel cancelled) before the
    /// sender finished suspending; the element is gone.
    Failed(DynError),
    /// The sender's job was already cancelled.
    Cancelled(CancelCause),
}

/// Outcome of a rendezvous receive.
#[derive(Debug)]
pub enum MultiReceiveStep<E> {
    /// A value (or the closed marker) was available synchronously.
    Ready(ValueOrClosed<E>),
    /// The receiver is queued.
    Suspended,
    /// The receiver's job was already cancelled.
    Cancelled(CancelCause),
}

/// A one-shot close notification callback.
pub type CloseHandler = Box<dyn FnOnce(Option<&DynError>) + Send + 'static>;

const OC_NONE: u8 = 0;
const OC_SET: u8 = 1;
const OC_INVOKED: u8 = 2;

/// The close-handler slot: at most one handler, invoked at most once.
///
/// `None -> Set -> Invoked`; a second registration is rejected with an
/// error naming which stage it collided with.
pub(crate) struct OnClose {
    state: AtomicU8,
    handler: Mutex<Option<CloseHandler>>,
}

impl OnClose {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(OC_NONE),
            handler: Mutex::new(None),
        }
    }

    /// Parks the handler. The caller must re-check its own closed flag
    /// afterwards and call [`OnClose::invoke`] if the channel already
    /// closed, so registration never misses a close that raced ahead.
    pub(crate) fn register(&self, handler: CloseHandler) -> Result<(), CloseHandlerError> {
        let mut slot = self.handler.lock();
        match self.state.load(Ordering::Acquire) {
            OC_NONE => {
                *slot = Some(handler);
                self.state.store(OC_SET, Ordering::Release);
                Ok(())
            }
            OC_SET => Err(CloseHandlerError::AlreadyRegistered),
            _ => Err(CloseHandlerError::AlreadyInvoked),
        }
    }

    /// Runs the parked handler, if any. Idempotent.
    pub(crate) fn invoke(&self, cause: Option<&DynError>) {
        let handler = {
            let mut slot = self.handler.lock();
            if self.state.load(Ordering::Acquire) != OC_SET {
                return;
            }
            self.state.store(OC_INVOKED, Ordering::Release);
            slot.take()
        };
        if let Some(handler) = handler {
            invoke_handler_safely("close", "channel", move || handler(cause));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn on_close_runs_handler_once() {
        let oc = OnClose::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        oc.register(Box::new(move |cause| {
            assert!(cause.is_none());
            f.fetch_add(1, Ordering::SeqCst);
        }))
        .expect("first registration");
        oc.invoke(None);
        oc.invoke(None);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_registration_is_rejected() {
        let oc = OnClose::new();
        oc.register(Box::new(|_| {})).expect("first registration");
        assert_eq!(
            oc.register(Box::new(|_| {})).unwrap_err(),
            CloseHandlerError::AlreadyRegistered
        );
        oc.invoke(None);
        assert_eq!(
            oc.register(Box::new(|_| {})).unwrap_err(),
            CloseHandlerError::AlreadyInvoked
        );
    }

    #[test]
    fn value_or_closed_conversions() {
        let v: ValueOrClosed<u32> = ValueOrClosed::Value(3);
        assert!(!v.is_closed());
        assert_eq!(v.into_result().ok(), Some(3));

        let c: ValueOrClosed<u32> = ValueOrClosed::Closed(None);
        assert!(c.is_closed());
        assert!(matches!(c.into_result(), Err(RecvError::Closed(None))));
    }
}
