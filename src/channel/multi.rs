//! Rendezvous channel for any number of senders and receivers.
//!
//! At any moment the waiter queue is homogeneous: either senders waiting
//! for receivers or receivers waiting for senders (plus, after close, a
//! pinned close marker at the back). Handoff is two-phase: a party first
//! claims the opposite waiter's continuation (`try_resume`), then unlinks
//! the node, and only after releasing the queue lock completes the
//! resumption, so user code never runs under the channel's lock.
//!
//! Nodes live in a generation-checked arena; a queue entry whose
//! generation no longer matches is a lazily skipped tombstone. Parked
//! waiters deregister themselves through their cancellation handler, so a
//! cancelled party never receives an element.
//!
//! Closing appends the marker, then unlinks the contiguous run of parked
//! receivers walking right to left from the marker, and resumes them in
//! their original enqueue order only after the queue is consistent again.
//! Queued senders survive a plain close (their elements remain
//! receivable); `cancel` additionally fails them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{CloseHandler, MultiReceiveStep, MultiSendStep, OnClose, ValueOrClosed};
use crate::continuation::{CancellableContinuation, GetResult};
use crate::dispatch::DispatchedContinuation;
use crate::error::{
    CancelCause, CloseHandlerError, ClosedForSend, DynError, Failure, FatalError, TryRecvError,
    TrySendError,
};
use crate::exception::handle_coroutine_exception;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Handle {
    index: u32,
    gen: u32,
}

enum Waiter<E: Send + 'static> {
    Send {
        element: Option<E>,
        cont: CancellableContinuation<()>,
    },
    Receive {
        cont: CancellableContinuation<ValueOrClosed<E>>,
    },
    Closed,
}

struct NodeSlot<E: Send + 'static> {
    gen: u32,
    waiter: Option<Waiter<E>>,
}

/// What the head of the queue currently is, with the continuation cloned
/// out so the caller can claim it while still holding the queue lock.
enum Front<E: Send + 'static> {
    Empty,
    Sender(Handle, CancellableContinuation<()>),
    Receiver(Handle, CancellableContinuation<ValueOrClosed<E>>),
    Closed,
}

struct WaiterList<E: Send + 'static> {
    slots: Vec<NodeSlot<E>>,
    free: Vec<u32>,
    queue: VecDeque<Handle>,
}

impl<E: Send + 'static> WaiterList<E> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            queue: VecDeque::new(),
        }
    }

    fn insert_back(&mut self, waiter: Waiter<E>) -> Handle {
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(NodeSlot {
                    gen: 0,
                    waiter: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.waiter = Some(waiter);
        let handle = Handle {
            index,
            gen: slot.gen,
        };
        self.queue.push_back(handle);
        handle
    }

    /// Unlinks by handle. Stale handles (already removed and possibly
    /// reused) are a no-op thanks to the generation check.
    fn remove(&mut self, handle: Handle) -> Option<Waiter<E>> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.gen != handle.gen {
            return None;
        }
        let waiter = slot.waiter.take()?;
        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(handle.index);
        Some(waiter)
    }

    fn is_live(&self, handle: Handle) -> bool {
        self.slots
            .get(handle.index as usize)
            .is_some_and(|s| s.gen == handle.gen && s.waiter.is_some())
    }

    fn front(&mut self) -> Front<E> {
        loop {
            let Some(&handle) = self.queue.front() else {
                return Front::Empty;
            };
            if !self.is_live(handle) {
                self.queue.pop_front();
                continue;
            }
            let Some(waiter) = self.slots[handle.index as usize].waiter.as_ref() else {
                // is_live just said otherwise; impossible
                self.queue.pop_front();
                continue;
            };
            return match waiter {
                Waiter::Send { cont, .. } => Front::Sender(handle, cont.clone()),
                Waiter::Receive { cont } => Front::Receiver(handle, cont.clone()),
                Waiter::Closed => Front::Closed,
            };
        }
    }

    /// Unlinks the contiguous run of parked receivers, walking right to
    /// left from the back (past the close marker), and returns them in
    /// their original enqueue order.
    fn drain_receivers(&mut self) -> Vec<CancellableContinuation<ValueOrClosed<E>>> {
        let mut collected = Vec::new();
        let handles: Vec<Handle> = self.queue.iter().rev().copied().collect();
        for handle in handles {
            if !self.is_live(handle) {
                continue;
            }
            match self.slots[handle.index as usize].waiter.as_ref() {
                Some(Waiter::Closed) => continue,
                Some(Waiter::Receive { .. }) => {
                    if let Some(Waiter::Receive { cont }) = self.remove(handle) {
                        collected.push(cont);
                    }
                }
                _ => break,
            }
        }
        collected.reverse();
        collected
    }

    /// Same traversal for queued senders; used by `cancel`.
    fn drain_senders(&mut self) -> Vec<(Option<E>, CancellableContinuation<()>)> {
        let mut collected = Vec::new();
        let handles: Vec<Handle> = self.queue.iter().rev().copied().collect();
        for handle in handles {
            if !self.is_live(handle) {
                continue;
            }
            match self.slots[handle.index as usize].waiter.as_ref() {
                Some(Waiter::Closed) => continue,
                Some(Waiter::Send { .. }) => {
                    if let Some(Waiter::Send { element, cont }) = self.remove(handle) {
                        collected.push((element, cont));
                    }
                }
                _ => break,
            }
        }
        collected.reverse();
        collected
    }
}

struct MultiCore<E: Send + 'static> {
    list: Mutex<WaiterList<E>>,
    closed: AtomicBool,
    close_cause: Mutex<Option<DynError>>,
    on_close: OnClose,
}

/// A rendezvous channel: every element is handed directly from a sender to
/// a receiver; there is no buffer. Cloning shares the same channel.
pub struct MultiChannel<E: Send + 'static> {
    core: Arc<MultiCore<E>>,
}

impl<E: Send + 'static> Clone for MultiChannel<E> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<E: Send + 'static> Default for MultiChannel<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Send + 'static> MultiChannel<E> {
    /// Creates an open channel.
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Arc::new(MultiCore {
                list: Mutex::new(WaiterList::new()),
                closed: AtomicBool::new(false),
                close_cause: Mutex::new(None),
                on_close: OnClose::new(),
            }),
        }
    }

    fn stored_close_cause(&self) -> Option<DynError> {
        self.core.close_cause.lock().clone()
    }

    /// Hands the element to a waiting receiver without suspending.
    /// `Full` here means "no receiver is waiting".
    pub fn offer(&self, element: E) -> Result<(), TrySendError<E>> {
        let mut element = element;
        loop {
            let mut list = self.core.list.lock();
            match list.front() {
                Front::Empty | Front::Sender(..) => return Err(TrySendError::Full(element)),
                Front::Closed => {
                    drop(list);
                    return Err(TrySendError::Closed(element, self.stored_close_cause()));
                }
                Front::Receiver(handle, cont) => {
                    match cont.try_resume(ValueOrClosed::Value(element), None) {
                        Ok(token) => {
                            list.remove(handle);
                            drop(list);
                            cont.complete_resume(token);
                            return Ok(());
                        }
                        Err(ValueOrClosed::Value(e)) => {
                            // Dead receiver (lost a cancellation race whose
                            // handler has not unlinked it yet); skip it.
                            element = e;
                            list.remove(handle);
                        }
                        Err(ValueOrClosed::Closed(_)) => {
                            unreachable!("offer never claims with a close marker")
                        }
                    }
                }
            }
        }
    }

    /// Takes an element from a waiting sender without suspending.
    pub fn poll(&self) -> Result<E, TryRecvError> {
        loop {
            let mut list = self.core.list.lock();
            match list.front() {
                Front::Empty | Front::Receiver(..) => return Err(TryRecvError::Empty),
                Front::Closed => {
                    drop(list);
                    return Err(TryRecvError::Closed(self.stored_close_cause()));
                }
                Front::Sender(handle, cont) => match cont.try_resume((), None) {
                    Ok(token) => {
                        let Some(Waiter::Send { element, .. }) = list.remove(handle) else {
                            panic!("claimed sender vanished from the queue")
                        };
                        let Some(element) = element else {
                            panic!("queued sender without an element")
                        };
                        drop(list);
                        cont.complete_resume(token);
                        return Ok(element);
                    }
                    Err(()) => {
                        list.remove(handle);
                    }
                },
            }
        }
    }

    /// Sends, parking the sender (with its element) when no receiver is
    /// ready. After [`MultiSendStep::Suspended`] the element belongs to
    /// the channel; the final outcome arrives through the delegate.
    pub fn send(
        &self,
        element: E,
        waiter: &Arc<DispatchedContinuation<()>>,
    ) -> MultiSendStep<E> {
        let mut element = element;
        loop {
            match self.offer(element) {
                Ok(()) => return MultiSendStep::Sent,
                Err(TrySendError::Closed(e, cause)) => return MultiSendStep::Closed(e, cause),
                Err(TrySendError::Full(e)) => {
                    let cont = waiter.claim();
                    let mut pending = Some(e);
                    let enqueued = {
                        let mut list = self.core.list.lock();
                        match list.front() {
                            Front::Receiver(..) => None,
                            Front::Closed => {
                                drop(list);
                                waiter.release(cont);
                                let Some(e) = pending.take() else {
                                    unreachable!("element consumed twice")
                                };
                                return MultiSendStep::Closed(e, self.stored_close_cause());
                            }
                            Front::Empty | Front::Sender(..) => {
                                let Some(e) = pending.take() else {
                                    unreachable!("element consumed twice")
                                };
                                Some(list.insert_back(Waiter::Send {
                                    element: Some(e),
                                    cont: cont.clone(),
                                }))
                            }
                        }
                    };
                    let Some(handle) = enqueued else {
                        // A receiver appeared; hand the claim back and retry
                        // the direct handoff.
                        waiter.release(cont);
                        let Some(e) = pending.take() else {
                            unreachable!("element consumed twice")
                        };
                        element = e;
                        continue;
                    };
                    let chan = self.clone();
                    cont.invoke_on_cancellation(Box::new(move |_| {
                        chan.remove_node(handle);
                    }));
                    match cont.get_result() {
                        GetResult::Suspended => return MultiSendStep::Suspended,
                        GetResult::Done(result) => {
                            // Completed before suspending; no dispatched task
                            // will run, so hand the claim back here.
                            waiter.release(cont);
                            return match result {
                                Ok(()) => MultiSendStep::Sent,
                                Err(Failure::Cancelled(cause)) => {
                                    MultiSendStep::Cancelled(cause)
                                }
                                Err(Failure::Error(e)) => MultiSendStep::Failed(e),
                            };
                        }
                    }
                }
            }
        }
    }

    /// Receives, parking the receiver when no sender is ready.
    pub fn receive(
        &self,
        waiter: &Arc<DispatchedContinuation<ValueOrClosed<E>>>,
    ) -> MultiReceiveStep<E> {
        loop {
            match self.poll() {
                Ok(e) => return MultiReceiveStep::Ready(ValueOrClosed::Value(e)),
                Err(TryRecvError::Closed(cause)) => {
                    return MultiReceiveStep::Ready(ValueOrClosed::Closed(cause));
                }
                Err(TryRecvError::Empty) => {}
            }
            let cont = waiter.claim();
            let enqueued = {
                let mut list = self.core.list.lock();
                match list.front() {
                    Front::Sender(..) | Front::Closed => None,
                    Front::Empty | Front::Receiver(..) => {
                        Some(list.insert_back(Waiter::Receive { cont: cont.clone() }))
                    }
                }
            };
            let Some(handle) = enqueued else {
                // A sender (or the close marker) appeared; hand the claim
                // back and retry the fast path.
                waiter.release(cont);
                continue;
            };
            let chan = self.clone();
            cont.invoke_on_cancellation(Box::new(move |_| {
                chan.remove_node(handle);
            }));
            match cont.get_result() {
                GetResult::Suspended => return MultiReceiveStep::Suspended,
                GetResult::Done(result) => {
                    waiter.release(cont);
                    return match result {
                        Ok(value_or_closed) => MultiReceiveStep::Ready(value_or_closed),
                        Err(Failure::Cancelled(cause)) => MultiReceiveStep::Cancelled(cause),
                        Err(Failure::Error(e)) => {
                            // Parked receivers are only ever resumed with a
                            // value or the close marker.
                            handle_coroutine_exception(
                                "multi-channel",
                                &FatalError::Internal {
                                    scope: "multi-channel",
                                    message: format!("receive waiter resumed with error: {e}"),
                                },
                            );
                            MultiReceiveStep::Cancelled(CancelCause::new(
                                "receive waiter failed",
                            ))
                        }
                    };
                }
            }
        }
    }

    fn remove_node(&self, handle: Handle) {
        let removed = self.core.list.lock().remove(handle);
        drop(removed);
    }

    /// Closes the channel for send. Parked receivers are resumed with the
    /// closed marker in their enqueue order; queued senders stay
    /// receivable. Returns `true` for the first close only.
    pub fn close(&self, cause: Option<DynError>) -> bool {
        let receivers = {
            let mut list = self.core.list.lock();
            if self.core.closed.swap(true, Ordering::AcqRel) {
                return false;
            }
            *self.core.close_cause.lock() = cause.clone();
            list.insert_back(Waiter::Closed);
            list.drain_receivers()
        };
        for cont in receivers {
            cont.resume(ValueOrClosed::Closed(cause.clone()));
        }
        self.core.on_close.invoke(cause.as_ref());
        true
    }

    /// Closes the channel and additionally fails every queued sender with
    /// a closed-for-send error. Idempotent on the close itself; the sender
    /// drain runs on every call.
    pub fn cancel(&self, cause: Option<DynError>) -> bool {
        let was_first = self.close(cause);
        let senders = self.core.list.lock().drain_senders();
        if !senders.is_empty() {
            let error: DynError = Arc::new(ClosedForSend {
                cause: self.stored_close_cause(),
            });
            for (element, cont) in senders {
                drop(element);
                cont.resume_with_exception(error.clone());
            }
        }
        was_first
    }

    /// `true` once the channel is closed for new elements.
    #[must_use]
    pub fn is_closed_for_send(&self) -> bool {
        self.core.closed.load(Ordering::Acquire)
    }

    /// `true` once the channel is closed and no queued sender remains.
    #[must_use]
    pub fn is_closed_for_receive(&self) -> bool {
        self.core.closed.load(Ordering::Acquire)
            && matches!(self.core.list.lock().front(), Front::Closed)
    }

    /// `true` when no element is immediately receivable.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !matches!(self.core.list.lock().front(), Front::Sender(..))
    }

    /// Registers the close handler (at most one per channel). If the
    /// channel already closed, the handler fires immediately with the
    /// original cause.
    pub fn invoke_on_close(&self, handler: CloseHandler) -> Result<(), CloseHandlerError> {
        self.core.on_close.register(handler)?;
        if self.core.closed.load(Ordering::Acquire) {
            let cause = self.stored_close_cause();
            self.core.on_close.invoke(cause.as_ref());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::context::CoroutineContext;
    use crate::dispatch::CoroutineDispatcher;
    use crate::lab::{ManualDispatcher, RecordingDelegate};

    fn sender_host(
        dispatcher: &Arc<ManualDispatcher>,
    ) -> (Arc<DispatchedContinuation<()>>, Arc<RecordingDelegate<()>>) {
        let delegate = RecordingDelegate::new(CoroutineContext::new());
        let host = DispatchedContinuation::new(
            Arc::clone(dispatcher) as Arc<dyn CoroutineDispatcher>,
            delegate.clone() as Arc<dyn crate::continuation::Continuation<()>>,
        );
        (host, delegate)
    }

    fn receiver_host(
        dispatcher: &Arc<ManualDispatcher>,
    ) -> (
        Arc<DispatchedContinuation<ValueOrClosed<u32>>>,
        Arc<RecordingDelegate<ValueOrClosed<u32>>>,
    ) {
        let delegate = RecordingDelegate::new(CoroutineContext::new());
        let host = DispatchedContinuation::new(
            Arc::clone(dispatcher) as Arc<dyn CoroutineDispatcher>,
            delegate.clone()
                as Arc<dyn crate::continuation::Continuation<ValueOrClosed<u32>>>,
        );
        (host, delegate)
    }

    #[test]
    fn offer_without_receiver_reports_full() {
        let chan = MultiChannel::<u32>::new();
        assert!(matches!(chan.offer(1), Err(TrySendError::Full(1))));
        assert!(matches!(chan.poll(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn parked_receiver_gets_the_offered_element() {
        let dispatcher = Arc::new(ManualDispatcher::new());
        let (host, delegate) = receiver_host(&dispatcher);
        let chan = MultiChannel::<u32>::new();

        assert!(matches!(chan.receive(&host), MultiReceiveStep::Suspended));
        chan.offer(5).expect("receiver waiting");
        dispatcher.run_until_idle();
        match delegate.take() {
            Some(Ok(ValueOrClosed::Value(5))) => {}
            other => panic!("expected the element, got {other:?}"),
        }
    }

    #[test]
    fn parked_sender_hands_off_to_poll() {
        let dispatcher = Arc::new(ManualDispatcher::new());
        let (host, delegate) = sender_host(&dispatcher);
        let chan = MultiChannel::<u32>::new();

        assert!(matches!(chan.send(7, &host), MultiSendStep::Suspended));
        assert!(!chan.is_empty());
        assert_eq!(chan.poll().expect("queued sender"), 7);
        dispatcher.run_until_idle();
        assert!(matches!(delegate.take(), Some(Ok(()))));
        assert!(chan.is_empty());
    }

    #[test]
    fn queued_senders_drain_in_fifo_order() {
        let dispatcher = Arc::new(ManualDispatcher::new());
        let chan = MultiChannel::<u32>::new();
        let hosts: Vec<_> = (0..3).map(|_| sender_host(&dispatcher)).collect();
        for (i, (host, _)) in hosts.iter().enumerate() {
            assert!(matches!(
                chan.send(i as u32, host),
                MultiSendStep::Suspended
            ));
        }
        for i in 0..3_u32 {
            assert_eq!(chan.poll().expect("queued"), i);
        }
        dispatcher.run_until_idle();
        for (_, delegate) in &hosts {
            assert!(matches!(delegate.take(), Some(Ok(()))));
        }
    }

    #[test]
    fn close_resumes_parked_receivers_in_enqueue_order() {
        let dispatcher = Arc::new(ManualDispatcher::new());
        let chan = MultiChannel::<u32>::new();
        let order = Arc::new(Mutex::new(Vec::<usize>::new()));

        struct Ordered {
            ctx: CoroutineContext,
            order: Arc<Mutex<Vec<usize>>>,
            id: usize,
        }
        impl crate::continuation::Continuation<ValueOrClosed<u32>> for Ordered {
            fn context(&self) -> &CoroutineContext {
                &self.ctx
            }
            fn resume(&self, result: Result<ValueOrClosed<u32>, Failure>) {
                assert!(matches!(result, Ok(ValueOrClosed::Closed(None))));
                self.order.lock().push(self.id);
            }
        }

        let hosts: Vec<_> = (0..3)
            .map(|id| {
                DispatchedContinuation::new(
                    Arc::clone(&dispatcher) as Arc<dyn CoroutineDispatcher>,
                    Arc::new(Ordered {
                        ctx: CoroutineContext::new(),
                        order: Arc::clone(&order),
                        id,
                    })
                        as Arc<dyn crate::continuation::Continuation<ValueOrClosed<u32>>>,
                )
            })
            .collect();
        for host in &hosts {
            assert!(matches!(chan.receive(host), MultiReceiveStep::Suspended));
        }

        assert!(chan.close(None));
        dispatcher.run_until_idle();
        assert_eq!(order.lock().clone(), vec![0, 1, 2]);
    }

    #[test]
    fn queued_senders_survive_close_but_not_cancel() {
        let dispatcher = Arc::new(ManualDispatcher::new());
        let chan = MultiChannel::<u32>::new();
        let (h1, d1) = sender_host(&dispatcher);
        let (h2, d2) = sender_host(&dispatcher);
        assert!(matches!(chan.send(1, &h1), MultiSendStep::Suspended));
        assert!(matches!(chan.send(2, &h2), MultiSendStep::Suspended));

        assert!(chan.close(None));
        assert!(chan.is_closed_for_send());
        assert!(!chan.is_closed_for_receive());
        // The first queued element is still receivable after close.
        assert_eq!(chan.poll().expect("queued element"), 1);
        dispatcher.run_until_idle();
        assert!(matches!(d1.take(), Some(Ok(()))));

        // Cancel fails the remaining queued sender.
        assert!(!chan.cancel(None));
        dispatcher.run_until_idle();
        match d2.take() {
            Some(Err(Failure::Error(e))) => {
                assert_eq!(e.to_string(), "channel is closed for send");
            }
            other => panic!("expected closed-for-send, got {other:?}"),
        }
        assert!(chan.is_closed_for_receive());
        assert!(matches!(chan.poll(), Err(TryRecvError::Closed(None))));
    }

    #[test]
    fn send_after_close_fails_with_the_original_cause() {
        let chan = MultiChannel::<u32>::new();
        let cause: DynError = Arc::new(std::io::Error::other("shutdown"));
        assert!(chan.close(Some(cause)));
        match chan.offer(1) {
            Err(TrySendError::Closed(1, Some(c))) => assert_eq!(c.to_string(), "shutdown"),
            other => panic!("expected closed, got {other:?}"),
        }
    }

    #[test]
    fn dead_receiver_is_skipped_by_a_later_offer() {
        use crate::continuation::Delegate;
        use crate::dispatch::ResumeMode;

        let dispatcher = Arc::new(ManualDispatcher::new());
        let chan = MultiChannel::<u32>::new();

        // A receiver cancelled after parking, but whose node is still
        // queued because its cancellation handler has not unlinked it yet.
        let dead_delegate = RecordingDelegate::new(CoroutineContext::new());
        let dead = CancellableContinuation::<ValueOrClosed<u32>>::new(
            Delegate::Plain(dead_delegate.clone()
                as Arc<dyn crate::continuation::Continuation<ValueOrClosed<u32>>>),
            ResumeMode::AtomicDefault,
        );
        assert!(matches!(dead.get_result(), GetResult::Suspended));
        assert!(dead.cancel(CancelCause::new("receiver gone")));
        chan.core
            .list
            .lock()
            .insert_back(Waiter::Receive { cont: dead });

        let (live_host, live_delegate) = receiver_host(&dispatcher);
        assert!(matches!(
            chan.receive(&live_host),
            MultiReceiveStep::Suspended
        ));

        // The offer skips the dead node and lands on the live receiver.
        chan.offer(6).expect("a live receiver remains");
        dispatcher.run_until_idle();
        assert!(matches!(
            live_delegate.take(),
            Some(Ok(ValueOrClosed::Value(6)))
        ));
    }

    #[test]
    fn close_handler_fires_exactly_once() {
        let chan = MultiChannel::<u32>::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        chan.invoke_on_close(Box::new(move |cause| {
            assert!(cause.is_none());
            f.fetch_add(1, Ordering::SeqCst);
        }))
        .expect("registration");
        assert!(chan.close(None));
        assert!(!chan.close(None));
        assert!(!chan.cancel(None));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
