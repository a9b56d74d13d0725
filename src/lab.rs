//! Deterministic test harness: hand-cranked dispatchers, recording
//! delegates, and blocking adapters for driving suspension-based
//! operations from plain threads.
//!
//! Everything here is also used by the crate's own test suites, but the
//! module is public: embedders testing code built on this runtime need
//! the same determinism.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::channel::{ReceiveStep, SendStep, SpscReceiver, SpscSender};
use crate::context::CoroutineContext;
use crate::continuation::Continuation;
use crate::dispatch::{CoroutineDispatcher, DispatchedContinuation, Runnable};
use crate::error::{Failure, RecvError, SendError};

/// A dispatcher that queues tasks until the test cranks them.
///
/// Nothing runs until [`ManualDispatcher::run_until_idle`] is called, so a
/// test can observe the exact moment a resumption crosses the dispatch
/// boundary.
pub struct ManualDispatcher {
    queue: Mutex<VecDeque<Runnable>>,
}

impl Default for ManualDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualDispatcher {
    /// An empty dispatcher with no queued tasks.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Number of tasks waiting to run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Runs queued tasks (including ones they enqueue) until none remain.
    /// Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            let Some(task) = self.queue.lock().pop_front() else {
                return ran;
            };
            task();
            ran += 1;
        }
    }
}

impl CoroutineDispatcher for ManualDispatcher {
    fn dispatch(&self, _ctx: &CoroutineContext, task: Runnable) {
        self.queue.lock().push_back(task);
    }
}

/// A dispatcher that declines dispatch entirely; resumptions run inline
/// on the resuming thread.
pub struct InlineDispatcher;

impl CoroutineDispatcher for InlineDispatcher {
    fn is_dispatch_needed(&self, _ctx: &CoroutineContext) -> bool {
        false
    }

    fn dispatch(&self, _ctx: &CoroutineContext, task: Runnable) {
        task();
    }
}

/// A delegate that records the single delivered outcome for inspection.
pub struct RecordingDelegate<T> {
    ctx: CoroutineContext,
    slot: Mutex<Option<Result<T, Failure>>>,
}

impl<T> RecordingDelegate<T> {
    /// An empty delegate resuming under `ctx`.
    #[must_use]
    pub fn new(ctx: CoroutineContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            slot: Mutex::new(None),
        })
    }

    /// Takes the recorded outcome, clearing the slot for the next one.
    pub fn take(&self) -> Option<Result<T, Failure>> {
        self.slot.lock().take()
    }
}

impl<T: Send> Continuation<T> for RecordingDelegate<T> {
    fn context(&self) -> &CoroutineContext {
        &self.ctx
    }

    fn resume(&self, result: Result<T, Failure>) {
        let prev = self.slot.lock().replace(result);
        assert!(prev.is_none(), "outcome overwritten before it was taken");
    }
}

/// A delegate a plain thread can block on until the outcome arrives.
pub struct ParkingDelegate<T> {
    ctx: CoroutineContext,
    slot: Mutex<Option<Result<T, Failure>>>,
    arrived: Condvar,
}

impl<T> ParkingDelegate<T> {
    /// An empty delegate resuming under `ctx`.
    #[must_use]
    pub fn new(ctx: CoroutineContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            slot: Mutex::new(None),
            arrived: Condvar::new(),
        })
    }

    /// Blocks the calling thread until an outcome is delivered.
    pub fn wait(&self) -> Result<T, Failure> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            self.arrived.wait(&mut slot);
        }
    }
}

impl<T: Send> Continuation<T> for ParkingDelegate<T> {
    fn context(&self) -> &CoroutineContext {
        &self.ctx
    }

    fn resume(&self, result: Result<T, Failure>) {
        let prev = self.slot.lock().replace(result);
        assert!(prev.is_none(), "outcome overwritten before it was taken");
        self.arrived.notify_one();
    }
}

/// Drives [`SpscSender::send`] to completion, blocking the calling thread
/// across suspensions.
pub fn send_blocking<E: Send + 'static>(
    tx: &mut SpscSender<E>,
    element: E,
) -> Result<(), SendError<E>> {
    let delegate = ParkingDelegate::new(CoroutineContext::new());
    let host = DispatchedContinuation::new(
        Arc::new(InlineDispatcher) as Arc<dyn CoroutineDispatcher>,
        delegate.clone() as Arc<dyn Continuation<()>>,
    );
    let mut element = element;
    loop {
        match tx.send(element, &host) {
            SendStep::Sent => return Ok(()),
            SendStep::Closed(e, cause) => return Err(SendError::Closed(e, cause)),
            SendStep::Cancelled(e, cause) => return Err(SendError::Cancelled(e, cause)),
            SendStep::Suspended(e) => {
                element = e;
                match delegate.wait() {
                    Ok(()) => {}
                    Err(Failure::Cancelled(cause)) => {
                        return Err(SendError::Cancelled(element, cause));
                    }
                    Err(Failure::Error(e)) => {
                        return Err(SendError::Closed(element, Some(e)));
                    }
                }
            }
        }
    }
}

/// Drives [`SpscReceiver::receive`] to completion, blocking the calling
/// thread across suspensions.
pub fn recv_blocking<E: Send + 'static>(rx: &mut SpscReceiver<E>) -> Result<E, RecvError> {
    let delegate = ParkingDelegate::new(CoroutineContext::new());
    let host = DispatchedContinuation::new(
        Arc::new(InlineDispatcher) as Arc<dyn CoroutineDispatcher>,
        delegate.clone() as Arc<dyn Continuation<()>>,
    );
    loop {
        match rx.receive(&host) {
            ReceiveStep::Value(e) => return Ok(e),
            ReceiveStep::Closed(cause) => return Err(RecvError::Closed(cause)),
            ReceiveStep::Cancelled(cause) => return Err(RecvError::Cancelled(cause)),
            ReceiveStep::Suspended => match delegate.wait() {
                Ok(()) => {}
                Err(Failure::Cancelled(cause)) => return Err(RecvError::Cancelled(cause)),
                Err(Failure::Error(cause)) => return Err(RecvError::Closed(Some(cause))),
            },
        }
    }
}
