//! Error types and error handling strategy for corocore.
//!
//! The runtime distinguishes three families of failure, and the distinction
//! is load-bearing for the resumption protocol:
//!
//! - **Cancellation** ([`CancelCause`]): a normal control-flow signal. It
//!   propagates through the continuation/job chain like a result and is
//!   never reported to the fatal sink.
//! - **User computation failure** ([`DynError`] inside
//!   [`Failure::Error`]): an arbitrary error produced by task code,
//!   delivered as a failed resumption to whoever is awaiting.
//! - **Fatal machinery failure** ([`FatalError`]): a broken internal
//!   invariant, a panicking completion handler, or a failure nobody was
//!   awaiting. These always funnel to the global sink in
//!   [`crate::exception`] so operators can tell "our bug" from "caller's
//!   bug".
//!
//! Channel operations use dedicated error enums ([`SendError`],
//! [`RecvError`], [`TrySendError`], [`TryRecvError`]) that hand the
//! rejected element back to the caller wherever one was consumed.

use core::fmt;
use std::sync::Arc;

use thiserror::Error;

/// A shared, type-erased user error.
///
/// Failures cross thread and continuation boundaries, so they are
/// reference-counted rather than boxed.
pub type DynError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// The cause of a cancellation.
///
/// Cancellation is control flow, not an error condition: a `CancelCause`
/// flowing through a continuation means "stop cleanly", and carries an
/// optional root cause for diagnostics (e.g. the error that failed a
/// sibling and cancelled the parent job).
#[derive(Clone)]
pub struct CancelCause {
    message: Arc<str>,
    cause: Option<DynError>,
}

impl CancelCause {
    /// Creates a cancellation cause with a message and no root cause.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into().into(),
            cause: None,
        }
    }

    /// Creates a cancellation cause wrapping a root cause.
    #[must_use]
    pub fn with_cause(message: impl Into<String>, cause: DynError) -> Self {
        Self {
            message: message.into().into(),
            cause: Some(cause),
        }
    }

    /// The human-readable cancellation message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The root cause, if the cancellation wraps one.
    #[must_use]
    pub fn root_cause(&self) -> Option<&DynError> {
        self.cause.as_ref()
    }
}

impl fmt::Debug for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelCause")
            .field("message", &self.message)
            .field("cause", &self.cause.as_ref().map(ToString::to_string))
            .finish()
    }
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cancelled: {}", self.message)
    }
}

impl std::error::Error for CancelCause {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// The failed half of a resumption outcome.
#[derive(Debug, Clone, Error)]
pub enum Failure {
    /// The continuation was cancelled before (or instead of) being resumed.
    #[error(transparent)]
    Cancelled(CancelCause),
    /// Task code produced an ordinary error.
    #[error(transparent)]
    Error(DynError),
}

impl Failure {
    /// Returns `true` if this failure is a cancellation signal.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Returns the cancellation cause, if this is a cancellation.
    #[must_use]
    pub fn cancel_cause(&self) -> Option<&CancelCause> {
        match self {
            Self::Cancelled(cause) => Some(cause),
            Self::Error(_) => None,
        }
    }
}

impl From<CancelCause> for Failure {
    fn from(cause: CancelCause) -> Self {
        Self::Cancelled(cause)
    }
}

/// Error raised by a send into a closed channel.
#[derive(Debug, Clone, Error)]
#[error("channel is closed for send")]
pub struct ClosedForSend {
    /// The close cause, if the channel was closed with one.
    #[source]
    pub cause: Option<DynError>,
}

/// Error raised by a receive from a closed and drained channel.
#[derive(Debug, Clone, Error)]
#[error("channel is closed for receive")]
pub struct ClosedForReceive {
    /// The close cause, if the channel was closed with one.
    #[source]
    pub cause: Option<DynError>,
}

/// Terminal outcome of a driven (blocking or retried) send.
#[derive(Debug, Error)]
pub enum SendError<T> {
    /// The channel was closed before the element could be delivered.
    /// Hands the element back along with the close cause, if any.
    #[error("send failed: channel closed")]
    Closed(T, Option<DynError>),
    /// The sender's job was cancelled while waiting for capacity.
    #[error("send failed: {1}")]
    Cancelled(T, CancelCause),
}

/// Outcome of a non-suspending `offer`.
#[derive(Debug, Error)]
pub enum TrySendError<T> {
    /// The channel has no capacity (or no waiting receiver); nothing was
    /// mutated and the element is returned.
    #[error("channel is full")]
    Full(T),
    /// The channel is closed for send.
    #[error("channel is closed")]
    Closed(T, Option<DynError>),
}

/// Terminal outcome of a driven (blocking or retried) receive.
#[derive(Debug, Clone, Error)]
pub enum RecvError {
    /// The channel is closed and drained.
    #[error("receive failed: channel closed")]
    Closed(Option<DynError>),
    /// The receiver's job was cancelled while waiting for a value.
    #[error("receive failed: {0}")]
    Cancelled(CancelCause),
}

/// Outcome of a non-suspending `poll`.
#[derive(Debug, Clone, Error)]
pub enum TryRecvError {
    /// No value is buffered and no sender is waiting.
    #[error("channel is empty")]
    Empty,
    /// The channel is closed and drained.
    #[error("channel is closed")]
    Closed(Option<DynError>),
}

/// Error registering a close handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CloseHandlerError {
    /// A handler was already registered.
    #[error("another close handler was already registered")]
    AlreadyRegistered,
    /// A handler was already registered and has been invoked.
    #[error("another close handler was already registered and invoked")]
    AlreadyInvoked,
}

/// A non-recoverable failure of the runtime machinery itself.
///
/// These are never delivered as resumption results; they go to the global
/// sink via [`crate::exception::handle_coroutine_exception`].
#[derive(Debug, Error)]
pub enum FatalError {
    /// An internal invariant was violated, either by a bug in this crate
    /// or by code driving its protocols out of contract.
    #[error("fatal exception in coroutine machinery ({scope}): {message}")]
    Internal {
        /// Which component detected the violation.
        scope: &'static str,
        /// Description of the violation (often a caught panic message).
        message: String,
    },
    /// A user-supplied completion/cancellation/close handler panicked.
    /// Handler failures must never propagate into the caller that
    /// happened to trigger the handler.
    #[error("exception in {handler} handler: {message}")]
    HandlerFailed {
        /// Which kind of handler failed.
        handler: &'static str,
        /// The captured panic message.
        message: String,
    },
    /// A failure was produced but nobody was left to receive it.
    #[error("undelivered failure")]
    LostFailure(#[source] DynError),
}

/// Extracts a readable message from a panic payload.
#[must_use]
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
