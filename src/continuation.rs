//! Cancellable single-shot continuations.
//!
//! A [`CancellableContinuation`] is the meeting point of three racing
//! parties: the code that suspended on it, the code that resumes it, and
//! the cancellation machinery (its own `cancel`, or a parent [`Job`]).
//! Two small atomic machines arbitrate every race:
//!
//! - the **decision** word (`Undecided -> Suspended | Resumed`): whoever
//!   transitions first decides whether the result is delivered inline by
//!   the suspending caller or dispatched through the delegate;
//! - the **completion** word (`Active -> CancelHandler ->
//!   {Cancelled | Completed}`): first terminal transition wins, and the
//!   loser learns it lost from the CAS, never from a lock.
//!
//! The payload behind the completion word lives in a mutex cell that is
//! only ever written by the transition winner, so the mutex is a borrow
//! checker formality rather than a synchronization point. A transient
//! `Busy` tag covers the write; observers spin through it.

use std::mem;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::CoroutineContext;
use crate::dispatch::{DispatchedContinuation, DispatchedTask, ResumeMode};
use crate::error::{CancelCause, DynError, Failure, FatalError};
use crate::exception::{handle_coroutine_exception, invoke_handler_safely};
use crate::state::{
    CancelHandler, CancelledContinuation, DispatchedState, IdempotentToken, OnCancellation,
};

// Decision word.
const D_UNDECIDED: u8 = 0;
const D_SUSPENDED: u8 = 1;
const D_RESUMED: u8 = 2;

// Completion word. `Busy` is a transient claim covering the payload write.
const T_ACTIVE: u8 = 0;
const T_HANDLER: u8 = 1;
const T_BUSY: u8 = 2;
const T_CANCELLED: u8 = 3;
const T_COMPLETED: u8 = 4;

/// The downstream party a continuation delivers its outcome to.
pub trait Continuation<T>: Send + Sync {
    /// The context the resumption runs under.
    fn context(&self) -> &CoroutineContext;
    /// Deliver the outcome. Called exactly once per suspension.
    fn resume(&self, result: Result<T, Failure>);
}

/// How a continuation reaches its downstream party.
pub enum Delegate<T: Send + 'static> {
    /// Resume the delegate directly, on the resuming thread.
    Plain(Arc<dyn Continuation<T>>),
    /// Resume through a dispatcher, with reuse support.
    Dispatched(Arc<DispatchedContinuation<T>>),
}

impl<T: Send + 'static> Delegate<T> {
    fn context(&self) -> &CoroutineContext {
        match self {
            Self::Plain(c) => c.context(),
            Self::Dispatched(d) => d.context(),
        }
    }
}

/// Proof that a [`CancellableContinuation::try_resume`] succeeded; spend it
/// with [`CancellableContinuation::complete_resume`].
#[derive(Debug)]
#[must_use = "a successful try_resume must be finished with complete_resume"]
pub struct ResumeToken {
    _priv: (),
}

/// Outcome of [`CancellableContinuation::get_result`].
#[derive(Debug)]
pub enum GetResult<T> {
    /// The continuation is parked; the outcome will arrive through the
    /// delegate.
    Suspended,
    /// Completed before suspending; the outcome is delivered inline.
    Done(Result<T, Failure>),
}

pub(crate) enum TakenState<T> {
    Completed(DispatchedState<T>),
    Cancelled(CancelCause),
}

struct Core<T: Send + 'static> {
    delegate: Delegate<T>,
    mode: ResumeMode,
    decision: AtomicU8,
    tag: AtomicU8,
    payload: Mutex<DispatchedState<T>>,
    parent_handle: Mutex<Option<crate::job::DisposableHandle>>,
}

/// A single-shot, cancellable suspension point. Cloning shares the same
/// underlying continuation.
pub struct CancellableContinuation<T: Send + 'static> {
    core: Arc<Core<T>>,
}

impl<T: Send + 'static> Clone for CancellableContinuation<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

struct ChildContinuation<T: Send + 'static> {
    cont: CancellableContinuation<T>,
}

impl<T: Send + 'static> crate::job::ChildNode for ChildContinuation<T> {
    fn parent_cancelled(&self, cause: CancelCause) {
        self.cont.parent_cancelled(cause);
    }
}

impl<T: Send + 'static> CancellableContinuation<T> {
    /// Creates an active continuation delivering to `delegate` in `mode`.
    #[must_use]
    pub fn new(delegate: Delegate<T>, mode: ResumeMode) -> Self {
        Self {
            core: Arc::new(Core {
                delegate,
                mode,
                decision: AtomicU8::new(D_UNDECIDED),
                tag: AtomicU8::new(T_ACTIVE),
                payload: Mutex::new(DispatchedState::active()),
                parent_handle: Mutex::new(None),
            }),
        }
    }

    /// The context of the downstream party.
    #[must_use]
    pub fn context(&self) -> &CoroutineContext {
        self.core.delegate.context()
    }

    /// The resume mode this continuation was created with.
    #[must_use]
    pub fn mode(&self) -> ResumeMode {
        self.core.mode
    }

    /// Not yet completed or cancelled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(
            self.core.tag.load(Ordering::Acquire),
            T_ACTIVE | T_HANDLER | T_BUSY
        )
    }

    /// Reached a terminal state (value, failure, or cancellation).
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(
            self.core.tag.load(Ordering::Acquire),
            T_CANCELLED | T_COMPLETED
        )
    }

    /// Terminally cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.core.tag.load(Ordering::Acquire) == T_CANCELLED
    }

    fn is_reusable(&self) -> bool {
        matches!(self.core.delegate, Delegate::Dispatched(_))
    }

    fn claim(&self, from: u8) -> bool {
        self.core
            .tag
            .compare_exchange(from, T_BUSY, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // ------------------------------------------------------------------
    // Suspension side
    // ------------------------------------------------------------------

    /// Finishes the suspension attempt.
    ///
    /// Call after arranging for a future resume (e.g. parking this
    /// continuation in a channel). Also performs parent attachment: if the
    /// context carries a job, this continuation becomes its child until
    /// completion. If a resume or cancellation already won the decision
    /// race, the outcome is consumed and returned inline.
    pub fn get_result(&self) -> GetResult<T> {
        self.setup_cancellation();
        self.check_postponed_cancellation();
        if self.try_suspend_decision() {
            return GetResult::Suspended;
        }
        match self.take_state() {
            TakenState::Cancelled(cause) => GetResult::Done(Err(Failure::Cancelled(cause))),
            TakenState::Completed(state) => {
                // In cancellable mode a dead job overrides a pending value,
                // but never an exception.
                if self.core.mode == ResumeMode::Cancellable && !state.is_failure() {
                    if let Some(job) = self.context().job() {
                        if !job.is_active() {
                            let cause = job.cancellation_cause();
                            cancel_taken_state(state, &cause);
                            return GetResult::Done(Err(Failure::Cancelled(cause)));
                        }
                    }
                }
                GetResult::Done(deliver(state))
            }
        }
    }

    fn setup_cancellation(&self) {
        let Some(job) = self.context().job().cloned() else {
            return;
        };
        if self.core.parent_handle.lock().is_some() {
            return;
        }
        job.start();
        // Attaching may reenter `parent_cancelled` if the job is already
        // cancelling, so the handle lock is not held across this call.
        let handle = job.attach_child(Arc::new(ChildContinuation { cont: self.clone() }));
        {
            let mut slot = self.core.parent_handle.lock();
            if slot.is_none() {
                *slot = Some(handle);
            } else {
                handle.dispose();
            }
        }
        if self.is_completed() && !self.is_reusable() {
            self.detach_child();
        }
    }

    fn check_postponed_cancellation(&self) {
        if self.core.mode != ResumeMode::AtomicDefault {
            return;
        }
        if let Delegate::Dispatched(dc) = &self.core.delegate {
            if let Some(cause) = dc.take_postponed_cancellation() {
                self.cancel(cause);
            }
        }
    }

    fn try_suspend_decision(&self) -> bool {
        loop {
            match self.core.decision.load(Ordering::Acquire) {
                D_UNDECIDED => {
                    if self
                        .core
                        .decision
                        .compare_exchange(
                            D_UNDECIDED,
                            D_SUSPENDED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return true;
                    }
                }
                D_RESUMED => return false,
                _ => panic!("continuation suspended twice without a reset"),
            }
        }
    }

    fn try_resume_decision(&self) -> bool {
        loop {
            match self.core.decision.load(Ordering::Acquire) {
                D_UNDECIDED => {
                    if self
                        .core
                        .decision
                        .compare_exchange(
                            D_UNDECIDED,
                            D_RESUMED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return true;
                    }
                }
                D_SUSPENDED => return false,
                _ => panic!("continuation resumed twice"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Resumption side
    // ------------------------------------------------------------------

    /// Resumes with a value.
    ///
    /// If the continuation was already cancelled, exactly one such late
    /// resume is absorbed and the value is dropped. A second resume in any
    /// form panics.
    pub fn resume(&self, value: T) {
        if let Some((state, cause)) = self.resume_impl(DispatchedState::success(value)) {
            cancel_taken_state(state, &cause);
        }
    }

    /// Resumes with a value plus a callback that runs only if the value is
    /// discarded because the continuation got (or was already) cancelled.
    pub fn resume_with(&self, value: T, on_cancellation: OnCancellation) {
        let update = DispatchedState::completed_with_cancellation(value, on_cancellation);
        if let Some((state, cause)) = self.resume_impl(update) {
            cancel_taken_state(state, &cause);
        }
    }

    /// Resumes with a failure.
    ///
    /// A failure that loses to cancellation is reported to the fatal sink
    /// as a lost failure; nobody is left to receive it.
    pub fn resume_with_exception(&self, error: DynError) {
        if let Some((state, _cause)) = self.resume_impl(DispatchedState::failure(error)) {
            if let DispatchedState::Failure(e) = state {
                handle_coroutine_exception("continuation", &FatalError::LostFailure(e));
            }
        }
    }

    /// Core resumption. `None` means the update won and was (or will be)
    /// delivered; `Some` hands the update back because cancellation won.
    fn resume_impl(
        &self,
        update: DispatchedState<T>,
    ) -> Option<(DispatchedState<T>, CancelCause)> {
        let mut update = Some(update);
        loop {
            match self.core.tag.load(Ordering::Acquire) {
                cur @ (T_ACTIVE | T_HANDLER) => {
                    if !self.claim(cur) {
                        continue;
                    }
                    let state = update.take().unwrap_or(DispatchedState::Undefined);
                    let prev = mem::replace(&mut *self.core.payload.lock(), state);
                    self.core.tag.store(T_COMPLETED, Ordering::Release);
                    // A parked cancellation handler is dropped unrun on a
                    // normal completion.
                    drop(prev);
                    self.detach_if_non_reusable();
                    self.dispatch_resume(self.core.mode);
                    return None;
                }
                T_CANCELLED => {
                    let payload = self.core.payload.lock();
                    if let DispatchedState::Cancelled(c) = &*payload {
                        if c.make_resumed() {
                            let cause = c.cause().clone();
                            drop(payload);
                            let state = update.take().unwrap_or(DispatchedState::Undefined);
                            return Some((state, cause));
                        }
                    }
                    drop(payload);
                    panic!("continuation resumed twice after cancellation");
                }
                T_COMPLETED => panic!("continuation resumed twice"),
                _ => std::hint::spin_loop(),
            }
        }
    }

    // ------------------------------------------------------------------
    // Cancellation side
    // ------------------------------------------------------------------

    /// Cancels the continuation. Returns `true` if this call performed the
    /// cancelling transition; an installed cancellation handler runs
    /// exactly once, under a panic guard.
    pub fn cancel(&self, cause: CancelCause) -> bool {
        loop {
            match self.core.tag.load(Ordering::Acquire) {
                cur @ (T_ACTIVE | T_HANDLER) => {
                    if !self.claim(cur) {
                        continue;
                    }
                    let handled = cur == T_HANDLER;
                    let marker = CancelledContinuation::new(cause.clone(), handled);
                    let prev = mem::replace(
                        &mut *self.core.payload.lock(),
                        DispatchedState::cancelled(marker),
                    );
                    self.core.tag.store(T_CANCELLED, Ordering::Release);
                    if let DispatchedState::CancelHandler(handler) = prev {
                        let cause = cause.clone();
                        invoke_handler_safely("cancellation", "continuation", move || {
                            handler(&cause);
                        });
                    }
                    self.detach_if_non_reusable();
                    self.dispatch_resume(ResumeMode::AtomicDefault);
                    return true;
                }
                T_CANCELLED | T_COMPLETED => return false,
                _ => std::hint::spin_loop(),
            }
        }
    }

    /// Reaction to the parent job cancelling. Reusable continuations in
    /// atomic mode may postpone the physical cancellation until the next
    /// claim; everyone else cancels right away.
    pub fn parent_cancelled(&self, cause: CancelCause) {
        if self.cancel_later(&cause) {
            return;
        }
        self.cancel(cause);
        self.detach_if_non_reusable();
    }

    fn cancel_later(&self, cause: &CancelCause) -> bool {
        if self.core.mode != ResumeMode::AtomicDefault {
            return false;
        }
        match &self.core.delegate {
            Delegate::Dispatched(dc) => dc.postpone_cancellation(cause.clone()),
            Delegate::Plain(_) => false,
        }
    }

    /// Installs the cancellation handler.
    ///
    /// At most one handler may ever be installed; a second installation
    /// panics. If the continuation is already cancelled the handler runs
    /// immediately with the cause; if it already completed normally the
    /// handler is dropped unrun.
    pub fn invoke_on_cancellation(&self, handler: CancelHandler) {
        let mut handler = Some(handler);
        loop {
            match self.core.tag.load(Ordering::Acquire) {
                T_ACTIVE => {
                    if !self.claim(T_ACTIVE) {
                        continue;
                    }
                    let h = handler.take().unwrap_or_else(|| Box::new(|_| {}));
                    *self.core.payload.lock() = DispatchedState::cancel_handler(h);
                    self.core.tag.store(T_HANDLER, Ordering::Release);
                    return;
                }
                T_HANDLER => panic!("at most one cancellation handler can be installed"),
                T_CANCELLED => {
                    let cause = {
                        let payload = self.core.payload.lock();
                        match &*payload {
                            DispatchedState::Cancelled(c) => {
                                if !c.make_handled() {
                                    drop(payload);
                                    panic!(
                                        "at most one cancellation handler can be installed"
                                    );
                                }
                                c.cause().clone()
                            }
                            _ => return,
                        }
                    };
                    if let Some(h) = handler.take() {
                        invoke_handler_safely("cancellation", "continuation", move || h(&cause));
                    }
                    return;
                }
                T_COMPLETED => return,
                _ => std::hint::spin_loop(),
            }
        }
    }

    // ------------------------------------------------------------------
    // Two-phase resumption (channel handoff)
    // ------------------------------------------------------------------

    /// First phase of a two-phase resume: irrevocably claims the
    /// continuation for `value` without delivering yet.
    ///
    /// On failure the value is handed back. With an idempotent token, a
    /// repeated claim by the same logical resume is accepted (the duplicate
    /// value is dropped).
    pub fn try_resume(
        &self,
        value: T,
        idempotent: Option<IdempotentToken>,
    ) -> Result<ResumeToken, T> {
        loop {
            match self.core.tag.load(Ordering::Acquire) {
                cur @ (T_ACTIVE | T_HANDLER) => {
                    if !self.claim(cur) {
                        continue;
                    }
                    let update = match idempotent {
                        None => DispatchedState::success(value),
                        Some(token) => DispatchedState::completed_idempotent(token, value),
                    };
                    let prev = mem::replace(&mut *self.core.payload.lock(), update);
                    self.core.tag.store(T_COMPLETED, Ordering::Release);
                    drop(prev);
                    self.detach_if_non_reusable();
                    return Ok(ResumeToken { _priv: () });
                }
                T_COMPLETED if idempotent.is_some() => {
                    let payload = self.core.payload.lock();
                    if let DispatchedState::CompletedIdempotent { token, .. } = &*payload {
                        if Some(*token) == idempotent {
                            return Ok(ResumeToken { _priv: () });
                        }
                    }
                    return Err(value);
                }
                T_CANCELLED | T_COMPLETED => return Err(value),
                _ => std::hint::spin_loop(),
            }
        }
    }

    /// Failure-carrying variant of [`CancellableContinuation::try_resume`].
    pub fn try_resume_with_exception(&self, error: DynError) -> Option<ResumeToken> {
        loop {
            match self.core.tag.load(Ordering::Acquire) {
                cur @ (T_ACTIVE | T_HANDLER) => {
                    if !self.claim(cur) {
                        continue;
                    }
                    let prev = mem::replace(
                        &mut *self.core.payload.lock(),
                        DispatchedState::failure(error),
                    );
                    self.core.tag.store(T_COMPLETED, Ordering::Release);
                    drop(prev);
                    self.detach_if_non_reusable();
                    return Some(ResumeToken { _priv: () });
                }
                T_CANCELLED | T_COMPLETED => return None,
                _ => std::hint::spin_loop(),
            }
        }
    }

    /// Second phase: actually delivers a claim made by `try_resume`.
    pub fn complete_resume(&self, token: ResumeToken) {
        let ResumeToken { _priv: () } = token;
        self.dispatch_resume(self.core.mode);
    }

    // ------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------

    fn dispatch_resume(&self, mode: ResumeMode) {
        if self.try_resume_decision() {
            // The suspending caller has not suspended yet; it will consume
            // the outcome inline in get_result.
            return;
        }
        self.dispatch(mode);
    }

    fn dispatch(&self, mode: ResumeMode) {
        if let Delegate::Dispatched(dc) = &self.core.delegate {
            if mode.is_dispatched() && dc.dispatcher().is_dispatch_needed(dc.context()) {
                let task = DispatchedTask::new(self.clone(), mode);
                dc.dispatcher()
                    .dispatch(dc.context(), Box::new(move || task.run()));
                return;
            }
        }
        DispatchedTask::new(self.clone(), mode).run();
    }

    pub(crate) fn delegate_resume(&self, result: Result<T, Failure>) {
        match &self.core.delegate {
            Delegate::Plain(c) => c.resume(result),
            Delegate::Dispatched(dc) => dc.resume(result),
        }
    }

    pub(crate) fn reusable_host(&self) -> Option<&Arc<DispatchedContinuation<T>>> {
        match &self.core.delegate {
            Delegate::Dispatched(dc) => Some(dc),
            Delegate::Plain(_) => None,
        }
    }

    /// Consumes the terminal state. Completion payloads can be taken once;
    /// cancellation markers stay behind so late arrivals still see them.
    pub(crate) fn take_state(&self) -> TakenState<T> {
        loop {
            match self.core.tag.load(Ordering::Acquire) {
                T_CANCELLED => {
                    let payload = self.core.payload.lock();
                    match &*payload {
                        DispatchedState::Cancelled(c) => {
                            return TakenState::Cancelled(c.cause().clone());
                        }
                        _ => panic!("cancelled continuation lost its marker"),
                    }
                }
                T_COMPLETED => {
                    let state =
                        mem::replace(&mut *self.core.payload.lock(), DispatchedState::undefined());
                    assert!(
                        state.is_not_undefined(),
                        "completion state taken twice"
                    );
                    return TakenState::Completed(state);
                }
                T_BUSY => std::hint::spin_loop(),
                _ => panic!("taking the state of a non-completed continuation"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Parent attachment and reuse
    // ------------------------------------------------------------------

    fn detach_if_non_reusable(&self) {
        if !self.is_reusable() {
            self.detach_child();
        }
    }

    /// Drops the parent attachment, letting the parent complete without
    /// waiting for this continuation.
    pub fn detach_child(&self) {
        if let Some(handle) = self.core.parent_handle.lock().take() {
            handle.dispose();
        }
    }

    /// Rewinds a terminal continuation back to `Active` for reuse.
    ///
    /// Returns `false` (and detaches from the parent) when the completion
    /// was idempotent, which cannot be replayed safely.
    pub(crate) fn reset_for_reuse(&self) -> bool {
        {
            let mut payload = self.core.payload.lock();
            if payload.is_completed_idempotent() {
                drop(payload);
                self.detach_child();
                return false;
            }
            *payload = DispatchedState::active();
        }
        self.core.tag.store(T_ACTIVE, Ordering::Release);
        self.core.decision.store(D_UNDECIDED, Ordering::Release);
        true
    }
}

impl<T: Send + 'static> core::fmt::Debug for CancellableContinuation<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let tag = match self.core.tag.load(Ordering::Acquire) {
            T_ACTIVE => "Active",
            T_HANDLER => "CancelHandler",
            T_BUSY => "Busy",
            T_CANCELLED => "Cancelled",
            _ => "Completed",
        };
        f.debug_struct("CancellableContinuation")
            .field("state", &tag)
            .finish()
    }
}

/// Maps a taken completion state to the delivered outcome.
pub(crate) fn deliver<T>(state: DispatchedState<T>) -> Result<T, Failure> {
    match state {
        DispatchedState::Success(v)
        | DispatchedState::CompletedIdempotent { value: v, .. }
        | DispatchedState::CompletedWithCancellation { value: v, .. } => Ok(v),
        DispatchedState::Failure(e) => Err(Failure::Error(e)),
        _ => panic!("delivering a non-terminal continuation state"),
    }
}

/// Disposes of a completion that lost to cancellation, running its
/// on-cancellation callback if it carried one.
pub(crate) fn cancel_taken_state<T>(state: DispatchedState<T>, cause: &CancelCause) {
    if let DispatchedState::CompletedWithCancellation {
        value,
        on_cancellation,
    } = state
    {
        drop(value);
        invoke_handler_safely("on-cancellation", "continuation", move || {
            on_cancellation(cause);
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AOrd};

    use super::*;
    use crate::error::CancelCause;
    use crate::job::Job;

    struct Recorder<T> {
        ctx: CoroutineContext,
        slot: Mutex<Option<Result<T, Failure>>>,
    }

    impl<T> Recorder<T> {
        fn new(ctx: CoroutineContext) -> Arc<Self> {
            Arc::new(Self {
                ctx,
                slot: Mutex::new(None),
            })
        }

        fn take(&self) -> Option<Result<T, Failure>> {
            self.slot.lock().take()
        }
    }

    impl<T: Send + Sync> Continuation<T> for Recorder<T> {
        fn context(&self) -> &CoroutineContext {
            &self.ctx
        }

        fn resume(&self, result: Result<T, Failure>) {
            let prev = self.slot.lock().replace(result);
            assert!(prev.is_none(), "delegate resumed twice");
        }
    }

    fn cont<T: Send + Sync + 'static>(
        mode: ResumeMode,
    ) -> (CancellableContinuation<T>, Arc<Recorder<T>>) {
        let rec = Recorder::new(CoroutineContext::new());
        let c = CancellableContinuation::new(Delegate::Plain(rec.clone()), mode);
        (c, rec)
    }

    #[test]
    fn resume_before_suspend_delivers_inline() {
        let (c, rec) = cont::<u32>(ResumeMode::AtomicDefault);
        c.resume(42);
        match c.get_result() {
            GetResult::Done(Ok(v)) => assert_eq!(v, 42),
            other => panic!("expected inline delivery, got {other:?}"),
        }
        // Nothing went through the delegate.
        assert!(rec.take().is_none());
    }

    #[test]
    fn resume_after_suspend_goes_through_delegate() {
        let (c, rec) = cont::<u32>(ResumeMode::AtomicDefault);
        assert!(matches!(c.get_result(), GetResult::Suspended));
        c.resume(7);
        assert!(matches!(rec.take(), Some(Ok(7))));
    }

    #[test]
    fn cancel_before_suspend_is_seen_inline() {
        let (c, rec) = cont::<u32>(ResumeMode::AtomicDefault);
        assert!(c.cancel(CancelCause::new("early")));
        match c.get_result() {
            GetResult::Done(Err(Failure::Cancelled(cause))) => {
                assert_eq!(cause.message(), "early");
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert!(rec.take().is_none());
    }

    #[test]
    fn cancel_after_suspend_resumes_delegate_with_cancellation() {
        let (c, rec) = cont::<u32>(ResumeMode::AtomicDefault);
        assert!(matches!(c.get_result(), GetResult::Suspended));
        assert!(c.cancel(CancelCause::new("stop")));
        match rec.take() {
            Some(Err(Failure::Cancelled(cause))) => assert_eq!(cause.message(), "stop"),
            other => panic!("expected cancellation, got {other:?}"),
        }
        // Exactly one late resume is absorbed.
        c.resume(1);
        assert!(rec.take().is_none());
    }

    #[test]
    #[should_panic(expected = "resumed twice")]
    fn double_resume_panics() {
        let (c, _rec) = cont::<u32>(ResumeMode::AtomicDefault);
        c.resume(1);
        c.resume(2);
    }

    #[test]
    #[should_panic(expected = "resumed twice")]
    fn second_late_resume_after_cancellation_panics() {
        let (c, _rec) = cont::<u32>(ResumeMode::AtomicDefault);
        c.cancel(CancelCause::new("gone"));
        c.resume(1); // absorbed
        c.resume(2); // fatal
    }

    #[test]
    fn cancel_handler_runs_once_on_cancel() {
        let (c, _rec) = cont::<u32>(ResumeMode::AtomicDefault);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        c.invoke_on_cancellation(Box::new(move |cause| {
            assert_eq!(cause.message(), "bye");
            f.fetch_add(1, AOrd::SeqCst);
        }));
        assert!(c.cancel(CancelCause::new("bye")));
        assert!(!c.cancel(CancelCause::new("again")));
        assert_eq!(fired.load(AOrd::SeqCst), 1);
    }

    #[test]
    fn handler_installed_after_cancellation_fires_immediately() {
        let (c, _rec) = cont::<u32>(ResumeMode::AtomicDefault);
        c.cancel(CancelCause::new("done"));
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        c.invoke_on_cancellation(Box::new(move |_| {
            f.fetch_add(1, AOrd::SeqCst);
        }));
        assert_eq!(fired.load(AOrd::SeqCst), 1);
    }

    #[test]
    fn handler_on_completed_continuation_is_dropped() {
        let (c, _rec) = cont::<u32>(ResumeMode::AtomicDefault);
        c.resume(5);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        c.invoke_on_cancellation(Box::new(move |_| {
            f.fetch_add(1, AOrd::SeqCst);
        }));
        assert_eq!(fired.load(AOrd::SeqCst), 0);
    }

    #[test]
    #[should_panic(expected = "one cancellation handler")]
    fn second_handler_panics() {
        let (c, _rec) = cont::<u32>(ResumeMode::AtomicDefault);
        c.invoke_on_cancellation(Box::new(|_| {}));
        c.invoke_on_cancellation(Box::new(|_| {}));
    }

    #[test]
    fn panicking_cancel_handler_is_contained() {
        let (c, rec) = cont::<u32>(ResumeMode::AtomicDefault);
        assert!(matches!(c.get_result(), GetResult::Suspended));
        c.invoke_on_cancellation(Box::new(|_| panic!("handler bug")));
        assert!(c.cancel(CancelCause::new("stop")));
        // Cancellation still completed and was delivered.
        assert!(matches!(rec.take(), Some(Err(Failure::Cancelled(_)))));
    }

    #[test]
    fn resume_with_runs_callback_only_when_value_is_discarded() {
        // Delivered: callback must not run.
        let (c, rec) = cont::<u32>(ResumeMode::AtomicDefault);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        c.resume_with(9, Box::new(move |_| {
            f.fetch_add(1, AOrd::SeqCst);
        }));
        assert!(matches!(c.get_result(), GetResult::Done(Ok(9))));
        assert_eq!(fired.load(AOrd::SeqCst), 0);
        drop(rec);

        // Lost to cancellation: callback runs with the cause.
        let (c, _rec) = cont::<u32>(ResumeMode::AtomicDefault);
        c.cancel(CancelCause::new("closed"));
        let f = Arc::clone(&fired);
        c.resume_with(9, Box::new(move |cause| {
            assert_eq!(cause.message(), "closed");
            f.fetch_add(1, AOrd::SeqCst);
        }));
        assert_eq!(fired.load(AOrd::SeqCst), 1);
    }

    #[test]
    fn two_phase_resume_claims_then_delivers() {
        let (c, rec) = cont::<u32>(ResumeMode::AtomicDefault);
        assert!(matches!(c.get_result(), GetResult::Suspended));
        let token = match c.try_resume(11, None) {
            Ok(t) => t,
            Err(_) => panic!("claim should succeed"),
        };
        // Claimed but not yet delivered.
        assert!(rec.take().is_none());
        // A competing claim loses and gets its value back.
        assert!(matches!(c.try_resume(12, None), Err(12)));
        assert!(!c.cancel(CancelCause::new("late")));
        c.complete_resume(token);
        assert!(matches!(rec.take(), Some(Ok(11))));
    }

    #[test]
    fn idempotent_try_resume_accepts_repeat_with_same_token() {
        let (c, _rec) = cont::<u32>(ResumeMode::AtomicDefault);
        let t = IdempotentToken(3);
        assert!(c.try_resume(5, Some(t)).is_ok());
        assert!(c.try_resume(5, Some(t)).is_ok());
        assert!(matches!(c.try_resume(5, Some(IdempotentToken(4))), Err(5)));
        assert!(matches!(c.try_resume(5, None), Err(5)));
    }

    #[test]
    fn try_resume_with_exception_claims_failure() {
        let (c, rec) = cont::<u32>(ResumeMode::AtomicDefault);
        assert!(matches!(c.get_result(), GetResult::Suspended));
        let err = crate::state::dyn_error(std::io::Error::other("refused"));
        let token = c.try_resume_with_exception(err).expect("claim");
        c.complete_resume(token);
        match rec.take() {
            Some(Err(Failure::Error(e))) => assert_eq!(e.to_string(), "refused"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn parent_job_cancellation_reaches_suspended_continuation() {
        let job = Job::new(None);
        let rec = Recorder::<u32>::new(CoroutineContext::new().with_job(job.clone()));
        let c = CancellableContinuation::new(Delegate::Plain(rec.clone()), ResumeMode::Cancellable);
        assert!(matches!(c.get_result(), GetResult::Suspended));

        job.cancel(Some(CancelCause::new("parent down")));
        match rec.take() {
            Some(Err(Failure::Cancelled(cause))) => assert_eq!(cause.message(), "parent down"),
            other => panic!("expected cancellation, got {other:?}"),
        }
        // The continuation detached, so the parent reaches its terminal
        // state.
        assert!(job.is_completed());
    }

    #[test]
    fn completion_detaches_from_parent() {
        let job = Job::new(None);
        let rec = Recorder::<u32>::new(CoroutineContext::new().with_job(job.clone()));
        let c = CancellableContinuation::new(Delegate::Plain(rec.clone()), ResumeMode::Cancellable);
        assert!(matches!(c.get_result(), GetResult::Suspended));
        c.resume(1);
        assert!(matches!(rec.take(), Some(Ok(1))));
        assert!(job.complete());
        assert!(job.is_completed());
    }

    #[test]
    fn suspending_under_dead_job_is_cancelled_inline() {
        let job = Job::new(None);
        job.cancel(Some(CancelCause::new("already dead")));
        let rec = Recorder::<u32>::new(CoroutineContext::new().with_job(job));
        let c = CancellableContinuation::new(Delegate::Plain(rec), ResumeMode::Cancellable);
        match c.get_result() {
            GetResult::Done(Err(Failure::Cancelled(cause))) => {
                assert_eq!(cause.message(), "already dead");
            }
            other => panic!("expected inline cancellation, got {other:?}"),
        }
    }
}
