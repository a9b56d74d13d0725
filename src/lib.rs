//! Corocore: cancellable continuations, structured jobs, and
//! suspension-based channels.
//!
//! # Overview
//!
//! Corocore is the resumption core of a callback-style coroutine runtime.
//! A suspension point is a [`continuation::CancellableContinuation`]; the
//! races between suspend, resume, and cancel are arbitrated by lock-free
//! state machines, so the party that loses a race learns it from a failed
//! compare-exchange, never from blocking.
//!
//! # Core Guarantees
//!
//! - **Exactly-once delivery**: A continuation resumes its delegate at most
//!   once per suspension; a second resume is a caller bug and panics
//! - **Cancellation is a result**: A cancelled continuation delivers a
//!   cancellation outcome through the same path a value would take
//! - **Structured lifetimes**: A [`job::Job`] cannot reach a terminal state
//!   while attached children are pending
//! - **No lost failures**: Failures nobody is left to receive go to the
//!   global sink in [`exception`], not to `/dev/null`
//! - **Allocation-free steady state**: Dispatched continuations are claimed
//!   from and released back to a reusable host
//!
//! # Module Structure
//!
//! - [`continuation`]: The cancellable continuation and its state machines
//! - [`dispatch`]: Dispatchers, resume modes, reusable continuation hosts
//! - [`job`]: Hierarchical jobs with completion gating and handlers
//! - [`channel`]: Suspension-based SPSC ring and rendezvous channels
//! - [`context`]: The coroutine context carried by delegates
//! - [`state`]: Completion-state payloads shared by the machines
//! - [`error`]: Cancellation causes, failures, and channel errors
//! - [`exception`]: The global sink for fatal machinery failures
//! - [`lab`]: Deterministic dispatchers and delegates for testing

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod context;
pub mod continuation;
pub mod dispatch;
pub mod error;
pub mod exception;
pub mod job;
pub mod lab;
pub mod state;

pub use channel::{spsc_channel, MultiChannel, SpscReceiver, SpscSender};
pub use context::CoroutineContext;
pub use continuation::{CancellableContinuation, Continuation, Delegate, GetResult, ResumeToken};
pub use dispatch::{CoroutineDispatcher, DispatchedContinuation, ResumeMode};
pub use error::{CancelCause, DynError, Failure};
pub use job::{DisposableHandle, Job};
pub use state::IdempotentToken;
