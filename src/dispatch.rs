//! Dispatchers, resume modes, and the dispatched resumption task.
//!
//! A resumption travels from the completing party to the suspended party's
//! delegate either inline or through a [`CoroutineDispatcher`]. The
//! [`ResumeMode`] chosen at suspension decides both the routing and the
//! cancellation semantics of the delivery.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::{CoroutineContext, ThreadContextGuard};
use crate::continuation::{
    cancel_taken_state, deliver, CancellableContinuation, Continuation, Delegate, TakenState,
};
use crate::error::{panic_message, CancelCause, Failure, FatalError};
use crate::exception::handle_coroutine_exception;

/// A unit of work handed to a dispatcher.
pub type Runnable = Box<dyn FnOnce() + Send + 'static>;

/// Where and how a resumption is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Dispatch through the dispatcher; deliver the completion
    /// unconditionally, even if the job died meanwhile.
    AtomicDefault,
    /// Dispatch through the dispatcher; if the job died before delivery,
    /// substitute a cancellation outcome. An exceptional completion is
    /// still delivered as is.
    Cancellable,
    /// Run the resumption inline on the resuming thread, with scoped
    /// thread-context bookkeeping.
    Undispatched,
}

impl ResumeMode {
    /// Whether this mode routes through the dispatcher at all.
    #[must_use]
    pub fn is_dispatched(self) -> bool {
        !matches!(self, Self::Undispatched)
    }

    /// Whether a dead job substitutes cancellation at delivery time.
    #[must_use]
    pub fn is_cancellable(self) -> bool {
        matches!(self, Self::Cancellable)
    }
}

/// Schedules resumption tasks onto some execution resource.
pub trait CoroutineDispatcher: Send + Sync {
    /// Whether tasks for `ctx` must go through [`Self::dispatch`].
    /// Returning `false` lets the runtime run them inline.
    fn is_dispatch_needed(&self, _ctx: &CoroutineContext) -> bool {
        true
    }

    /// Enqueues a task for later execution.
    fn dispatch(&self, ctx: &CoroutineContext, task: Runnable);
}

// Reusable-slot states of a DispatchedContinuation.
const R_IDLE: u8 = 0;
const R_CLAIMED: u8 = 1;
const R_PUBLISHED: u8 = 2;

/// The dispatcher-aware host for a resumable suspension point.
///
/// Channels and similar primitives claim a [`CancellableContinuation`]
/// from the host for each suspension; after the resumption is delivered
/// the continuation is released back and rewound for the next claim, so
/// the steady state allocates nothing per suspension.
///
/// While a claimed continuation is outstanding, a parent-job cancellation
/// may be postponed into the host instead of delivered physically; it is
/// re-checked when the continuation next suspends or is reclaimed.
pub struct DispatchedContinuation<T: Send + 'static> {
    dispatcher: Arc<dyn CoroutineDispatcher>,
    delegate: Arc<dyn Continuation<T>>,
    reusable_state: AtomicU8,
    reusable: Mutex<Option<CancellableContinuation<T>>>,
    postponed: Mutex<Option<CancelCause>>,
}

impl<T: Send + 'static> DispatchedContinuation<T> {
    /// Creates a host delivering to `delegate` through `dispatcher`.
    #[must_use]
    pub fn new(
        dispatcher: Arc<dyn CoroutineDispatcher>,
        delegate: Arc<dyn Continuation<T>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            delegate,
            reusable_state: AtomicU8::new(R_IDLE),
            reusable: Mutex::new(None),
            postponed: Mutex::new(None),
        })
    }

    /// The dispatcher resumptions route through.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<dyn CoroutineDispatcher> {
        &self.dispatcher
    }

    /// The downstream context.
    #[must_use]
    pub fn context(&self) -> &CoroutineContext {
        self.delegate.context()
    }

    /// Claims a continuation for one suspension, reusing the released one
    /// when its completion can be rewound.
    pub fn claim(self: &Arc<Self>) -> CancellableContinuation<T> {
        let existing = self.reusable.lock().take();
        self.reusable_state.store(R_CLAIMED, Ordering::Release);
        if let Some(cont) = existing {
            if cont.reset_for_reuse() {
                return cont;
            }
        }
        CancellableContinuation::new(Delegate::Dispatched(Arc::clone(self)), ResumeMode::AtomicDefault)
    }

    /// Hands a continuation back after its resumption was delivered.
    pub fn release(&self, cont: CancellableContinuation<T>) {
        *self.reusable.lock() = Some(cont);
        self.reusable_state.store(R_PUBLISHED, Ordering::Release);
    }

    /// Records a parent cancellation to apply at the next claim, if a
    /// claimed continuation is currently outstanding.
    pub(crate) fn postpone_cancellation(&self, cause: CancelCause) -> bool {
        if self.reusable_state.load(Ordering::Acquire) != R_CLAIMED {
            return false;
        }
        *self.postponed.lock() = Some(cause);
        true
    }

    pub(crate) fn take_postponed_cancellation(&self) -> Option<CancelCause> {
        self.postponed.lock().take()
    }

    pub(crate) fn resume(&self, result: Result<T, Failure>) {
        self.delegate.resume(result);
    }
}

impl<T: Send + 'static> Drop for DispatchedContinuation<T> {
    fn drop(&mut self) {
        // The final release point: a still-parked reusable continuation
        // must not keep gating its parent job.
        if let Some(cont) = self.reusable.lock().take() {
            cont.detach_child();
        }
    }
}

/// One delivery of a completed continuation to its delegate.
///
/// Runs with the continuation's context installed on the thread, takes the
/// terminal state exactly once, applies the [`ResumeMode`] semantics, and
/// funnels any panic out of the delivery into the fatal sink rather than
/// the unlucky caller that executed the task.
pub struct DispatchedTask<T: Send + 'static> {
    cont: CancellableContinuation<T>,
    mode: ResumeMode,
}

impl<T: Send + 'static> DispatchedTask<T> {
    pub(crate) fn new(cont: CancellableContinuation<T>, mode: ResumeMode) -> Self {
        Self { cont, mode }
    }

    /// Executes the delivery.
    pub fn run(self) {
        let Self { cont, mode } = self;
        let ctx = cont.context().clone();
        let _guard = ThreadContextGuard::enter(&ctx);

        let delivery = catch_unwind(AssertUnwindSafe(|| match cont.take_state() {
            TakenState::Cancelled(cause) => {
                cont.delegate_resume(Err(Failure::Cancelled(cause)));
            }
            TakenState::Completed(state) => {
                if mode.is_cancellable() && !state.is_failure() {
                    if let Some(job) = ctx.job() {
                        if !job.is_active() {
                            let cause = job.cancellation_cause();
                            cancel_taken_state(state, &cause);
                            cont.delegate_resume(Err(Failure::Cancelled(cause)));
                            return;
                        }
                    }
                }
                cont.delegate_resume(deliver(state));
            }
        }));

        // Hand the continuation back for reuse even when delivery failed.
        let release = catch_unwind(AssertUnwindSafe(|| {
            if let Some(host) = cont.reusable_host() {
                host.release(cont.clone());
            }
        }));

        for failure in [delivery, release] {
            if let Err(payload) = failure {
                handle_coroutine_exception(
                    "dispatched-task",
                    &FatalError::Internal {
                        scope: "dispatched-task",
                        message: panic_message(payload.as_ref()),
                    },
                );
            }
        }
    }
}
