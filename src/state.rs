//! The completion-state vocabulary shared by continuations and dispatch.
//!
//! [`DispatchedState`] is the single closed sum type describing everything a
//! suspension point can hold: not-yet-completed markers, a parked
//! cancellation handler, terminal values and failures, and the sentinel
//! states the dispatch machinery threads through task queues. Keeping it one
//! enum means every consumer branches with an exhaustive `match` and new
//! states cannot be silently ignored.

use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{CancelCause, DynError};

/// A one-shot cancellation callback installed on a continuation.
///
/// Invoked at most once, with the cause, when the continuation is cancelled.
pub type CancelHandler = Box<dyn FnOnce(&CancelCause) + Send + 'static>;

/// A one-shot callback attached to a resumed value, invoked only if the
/// value ends up being dropped because the continuation was cancelled.
pub type OnCancellation = Box<dyn FnOnce(&CancelCause) + Send + 'static>;

/// Identity token for idempotent resumption.
///
/// Two `try_resume` calls with the same token are the same logical resume;
/// the repeat is accepted without delivering twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdempotentToken(pub u64);

/// Terminal marker for a continuation that was cancelled.
///
/// Carries two once-flags that make the races around late arrivals safe:
/// `resumed` absorbs exactly one resume that lost the race against
/// cancellation (a second one is a caller bug), and `handled` records that
/// a cancellation handler observed the cause (a second handler is a caller
/// bug).
pub struct CancelledContinuation {
    cause: CancelCause,
    resumed: AtomicBool,
    handled: AtomicBool,
}

impl CancelledContinuation {
    /// Creates the marker. `handled` starts true when a handler was already
    /// invoked as part of the cancelling transition itself.
    #[must_use]
    pub fn new(cause: CancelCause, handled: bool) -> Self {
        Self {
            cause,
            resumed: AtomicBool::new(false),
            handled: AtomicBool::new(handled),
        }
    }

    /// The cancellation cause.
    #[must_use]
    pub fn cause(&self) -> &CancelCause {
        &self.cause
    }

    /// Claims the single allowed post-cancellation resume.
    /// Returns `true` for the first caller only.
    pub fn make_resumed(&self) -> bool {
        !self.resumed.swap(true, Ordering::AcqRel)
    }

    /// Claims the single allowed cancellation-handler observation.
    /// Returns `true` for the first caller only.
    pub fn make_handled(&self) -> bool {
        !self.handled.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for CancelledContinuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelledContinuation")
            .field("cause", &self.cause)
            .field("resumed", &self.resumed.load(Ordering::Relaxed))
            .field("handled", &self.handled.load(Ordering::Relaxed))
            .finish()
    }
}

/// Everything a suspension point can hold.
pub enum DispatchedState<T> {
    /// Sentinel: the state was already taken, or a queue cell is vacant.
    /// Observing this where a real state is required is a fatal protocol
    /// violation.
    Undefined,
    /// Suspended or about to suspend, no handler installed.
    Active,
    /// Suspended with a parked cancellation handler.
    CancelHandler(CancelHandler),
    /// Terminally cancelled.
    Cancelled(CancelledContinuation),
    /// Completed with a value.
    Success(T),
    /// Completed with a user failure.
    Failure(DynError),
    /// Completed idempotently: repeats with the same token are accepted.
    CompletedIdempotent {
        /// Identity of the logical resume.
        token: IdempotentToken,
        /// The delivered value.
        value: T,
    },
    /// Completed with a value plus a callback to run if the value is
    /// discarded by a subsequent cancellation.
    CompletedWithCancellation {
        /// The delivered value.
        value: T,
        /// Runs only if the value is dropped due to cancellation.
        on_cancellation: OnCancellation,
    },
}

impl<T> DispatchedState<T> {
    /// The vacant sentinel.
    #[must_use]
    pub fn undefined() -> Self {
        Self::Undefined
    }

    /// The handler-less not-yet-completed state.
    #[must_use]
    pub fn active() -> Self {
        Self::Active
    }

    /// Not-yet-completed with a parked cancellation handler.
    #[must_use]
    pub fn cancel_handler(handler: CancelHandler) -> Self {
        Self::CancelHandler(handler)
    }

    /// Terminal cancellation marker.
    #[must_use]
    pub fn cancelled(marker: CancelledContinuation) -> Self {
        Self::Cancelled(marker)
    }

    /// Successful completion.
    #[must_use]
    pub fn success(value: T) -> Self {
        Self::Success(value)
    }

    /// Failed completion.
    #[must_use]
    pub fn failure(error: DynError) -> Self {
        Self::Failure(error)
    }

    /// Idempotent completion.
    #[must_use]
    pub fn completed_idempotent(token: IdempotentToken, value: T) -> Self {
        Self::CompletedIdempotent { token, value }
    }

    /// Completion with a cancellation fallback callback.
    #[must_use]
    pub fn completed_with_cancellation(value: T, on_cancellation: OnCancellation) -> Self {
        Self::CompletedWithCancellation {
            value,
            on_cancellation,
        }
    }

    /// Completed with a value (any of the three value-carrying forms).
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Success(_)
                | Self::CompletedIdempotent { .. }
                | Self::CompletedWithCancellation { .. }
        )
    }

    /// Completed with a user failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Not yet completed (with or without a handler).
    #[must_use]
    pub fn is_not_completed(&self) -> bool {
        matches!(self, Self::Active | Self::CancelHandler(_))
    }

    /// Reached a terminal state (value, failure, or cancellation).
    #[must_use]
    pub fn is_completed(&self) -> bool {
        !self.is_not_completed() && !matches!(self, Self::Undefined)
    }

    /// The handler-less not-yet-completed state specifically.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// A parked cancellation handler specifically.
    #[must_use]
    pub fn is_cancel_handler(&self) -> bool {
        matches!(self, Self::CancelHandler(_))
    }

    /// The terminal cancellation marker.
    #[must_use]
    pub fn is_cancelled_continuation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// The idempotent completion form.
    #[must_use]
    pub fn is_completed_idempotent(&self) -> bool {
        matches!(self, Self::CompletedIdempotent { .. })
    }

    /// Anything but the vacant sentinel.
    #[must_use]
    pub fn is_not_undefined(&self) -> bool {
        !matches!(self, Self::Undefined)
    }

    /// The failure payload, if completed with one. Cancellation markers
    /// expose their cause through [`DispatchedState::Cancelled`] instead.
    #[must_use]
    pub fn failure_ref(&self) -> Option<&DynError> {
        match self {
            Self::Failure(e) => Some(e),
            _ => None,
        }
    }
}

impl<T> fmt::Debug for DispatchedState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("Undefined"),
            Self::Active => f.write_str("Active"),
            Self::CancelHandler(_) => f.write_str("CancelHandler(..)"),
            Self::Cancelled(c) => f.debug_tuple("Cancelled").field(c).finish(),
            Self::Success(_) => f.write_str("Success(..)"),
            Self::Failure(e) => f.debug_tuple("Failure").field(&e.to_string()).finish(),
            Self::CompletedIdempotent { token, .. } => f
                .debug_struct("CompletedIdempotent")
                .field("token", token)
                .finish(),
            Self::CompletedWithCancellation { .. } => f.write_str("CompletedWithCancellation(..)"),
        }
    }
}

/// Convenience constructor for a [`DynError`] from any error value.
#[must_use]
pub fn dyn_error<E>(error: E) -> DynError
where
    E: std::error::Error + Send + Sync + 'static,
{
    Arc::new(error)
}
