//! Lock-free bounded single-producer single-consumer channel.
//!
//! The buffer is a power-of-two ring of slots, each guarded by its own tag
//! word (`Empty -> Writing -> Full -> Reading -> Empty`). The producer and
//! consumer indices are monotonic and single-writer; the per-slot tag CAS
//! is what makes the close protocol safe against the opposite side.
//!
//! Closing enqueues a `Closed` marker through the same slot protocol as a
//! regular element but advances neither index: the marker stays pinned in
//! its slot, so every element buffered before the close is still received
//! in FIFO order, every later send fails, and a drained consumer observes
//! `Closed` no matter how often it polls.
//!
//! Suspension uses one parked continuation per side. A side that finds no
//! progress stashes its claimed continuation and then re-checks the ring:
//! if the opposite side made progress in the gap (or the channel closed),
//! the stashed waiter is woken immediately, so no wakeup is ever lost.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use super::{CloseHandler, OnClose, ReceiveStep, SendStep, ValueOrClosed};
use crate::continuation::{CancellableContinuation, GetResult};
use crate::dispatch::DispatchedContinuation;
use crate::error::{
    CancelCause, CloseHandlerError, DynError, Failure, FatalError, TryRecvError, TrySendError,
};
use crate::exception::handle_coroutine_exception;

const SLOT_EMPTY: u8 = 0;
const SLOT_WRITING: u8 = 1;
const SLOT_FULL: u8 = 2;
const SLOT_READING: u8 = 3;
const SLOT_CLOSED: u8 = 4;

enum SlotValue<E> {
    Value(E),
    Closed(Option<DynError>),
}

struct Slot<E> {
    tag: AtomicU8,
    cell: Mutex<Option<SlotValue<E>>>,
}

struct Ring<E> {
    buffer: Box<[Slot<E>]>,
    mask: u64,
    producer: CachePadded<AtomicU64>,
    consumer: CachePadded<AtomicU64>,
    parked_producer: Mutex<Option<CancellableContinuation<()>>>,
    parked_consumer: Mutex<Option<CancellableContinuation<()>>>,
    closed: AtomicBool,
    close_cause: Mutex<Option<DynError>>,
    on_close: OnClose,
}

impl<E: Send + 'static> Ring<E> {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two();
        let buffer = (0..capacity)
            .map(|_| Slot {
                tag: AtomicU8::new(SLOT_EMPTY),
                cell: Mutex::new(None),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buffer,
            mask: capacity as u64 - 1,
            producer: CachePadded::new(AtomicU64::new(0)),
            consumer: CachePadded::new(AtomicU64::new(0)),
            parked_producer: Mutex::new(None),
            parked_consumer: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_cause: Mutex::new(None),
            on_close: OnClose::new(),
        }
    }

    fn slot_at(&self, index: u64) -> &Slot<E> {
        &self.buffer[(index & self.mask) as usize]
    }

    /// Publishes one item at the producer index. The index advances only
    /// for regular values; the close marker stays pinned in its slot.
    fn offer_internal(&self, item: SlotValue<E>) -> Result<(), SlotValue<E>> {
        let pidx = self.producer.load(Ordering::Acquire);
        let slot = self.slot_at(pidx);
        if slot
            .tag
            .compare_exchange(SLOT_EMPTY, SLOT_WRITING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(item);
        }
        let closing = matches!(item, SlotValue::Closed(_));
        *slot.cell.lock() = Some(item);
        if closing {
            slot.tag.store(SLOT_CLOSED, Ordering::Release);
        } else {
            slot.tag.store(SLOT_FULL, Ordering::Release);
            self.producer.store(pidx + 1, Ordering::Release);
        }
        Ok(())
    }

    /// Takes one item at the consumer index.
    /// `None` = empty, `Some(Err)` = pinned close marker.
    fn poll_internal(&self) -> Option<Result<E, Option<DynError>>> {
        let cidx = self.consumer.load(Ordering::Acquire);
        let slot = self.slot_at(cidx);
        match slot.tag.compare_exchange(
            SLOT_FULL,
            SLOT_READING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                let taken = slot.cell.lock().take();
                slot.tag.store(SLOT_EMPTY, Ordering::Release);
                self.consumer.store(cidx + 1, Ordering::Release);
                match taken {
                    Some(SlotValue::Value(e)) => Some(Ok(e)),
                    _ => panic!("spsc slot protocol violated: full slot without a value"),
                }
            }
            Err(cur) if cur == SLOT_CLOSED => Some(Err(self.close_cause.lock().clone())),
            Err(_) => None,
        }
    }

    fn wake_consumer(&self) {
        if let Some(cont) = self.parked_consumer.lock().take() {
            cont.resume(());
        }
    }

    fn wake_producer(&self) {
        if let Some(cont) = self.parked_producer.lock().take() {
            cont.resume(());
        }
    }

    fn has_space_or_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
            || self.slot_at(self.producer.load(Ordering::Acquire)).tag.load(Ordering::Acquire)
                == SLOT_EMPTY
    }

    fn has_data_or_closed(&self) -> bool {
        matches!(
            self.slot_at(self.consumer.load(Ordering::Acquire)).tag.load(Ordering::Acquire),
            SLOT_FULL | SLOT_CLOSED
        )
    }

    /// Idempotent close. The first caller enqueues the marker (spinning
    /// for a slot while the consumer drains a full buffer) and fires the
    /// close handler.
    fn close(&self, cause: Option<DynError>) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.close_cause.lock() = cause.clone();
        loop {
            match self.offer_internal(SlotValue::Closed(cause.clone())) {
                Ok(()) => break,
                Err(_) => {
                    self.wake_consumer();
                    std::thread::yield_now();
                }
            }
        }
        self.wake_consumer();
        self.wake_producer();
        self.on_close.invoke(cause.as_ref());
        true
    }

    fn register_on_close(&self, handler: CloseHandler) -> Result<(), CloseHandlerError> {
        self.on_close.register(handler)?;
        // A close that raced ahead of the registration fires it now.
        if self.closed.load(Ordering::Acquire) {
            let cause = self.close_cause.lock().clone();
            self.on_close.invoke(cause.as_ref());
        }
        Ok(())
    }
}

/// Creates a bounded SPSC channel. `capacity` is rounded up to the next
/// power of two.
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn spsc_channel<E: Send + 'static>(capacity: usize) -> (SpscSender<E>, SpscReceiver<E>) {
    assert!(capacity > 0, "spsc channel capacity must be at least 1");
    let ring = Arc::new(Ring::new(capacity));
    (
        SpscSender {
            ring: Arc::clone(&ring),
        },
        SpscReceiver { ring },
    )
}

/// The producing end. Exactly one producer: the mutating operations take
/// `&mut self` and the type is not cloneable.
pub struct SpscSender<E: Send + 'static> {
    ring: Arc<Ring<E>>,
}

impl<E: Send + 'static> SpscSender<E> {
    /// Publishes without suspending. Fails with `Full` (element returned,
    /// nothing mutated) or `Closed`.
    pub fn offer(&mut self, element: E) -> Result<(), TrySendError<E>> {
        if self.ring.closed.load(Ordering::Acquire) {
            let cause = self.ring.close_cause.lock().clone();
            return Err(TrySendError::Closed(element, cause));
        }
        match self.ring.offer_internal(SlotValue::Value(element)) {
            Ok(()) => {
                self.ring.wake_consumer();
                Ok(())
            }
            Err(SlotValue::Value(e)) => Err(TrySendError::Full(e)),
            Err(SlotValue::Closed(_)) => unreachable!("offer never carries the close marker"),
        }
    }

    /// Sends, parking the producer's continuation when the buffer is full.
    ///
    /// On [`SendStep::Suspended`] the element is handed back; retry the
    /// send with it after the continuation resumes through its delegate.
    pub fn send(&mut self, element: E, waiter: &Arc<DispatchedContinuation<()>>) -> SendStep<E> {
        let mut element = element;
        loop {
            match self.offer(element) {
                Ok(()) => return SendStep::Sent,
                Err(TrySendError::Closed(e, cause)) => return SendStep::Closed(e, cause),
                Err(TrySendError::Full(e)) => {
                    element = e;
                    let cont = waiter.claim();
                    *self.ring.parked_producer.lock() = Some(cont.clone());
                    // Re-check after parking so a consumer that freed space
                    // (or a close) in the gap cannot strand us.
                    if self.ring.has_space_or_closed() {
                        self.ring.wake_producer();
                    }
                    match cont.get_result() {
                        GetResult::Suspended => return SendStep::Suspended(element),
                        GetResult::Done(Ok(())) => {
                            waiter.release(cont);
                        }
                        GetResult::Done(Err(Failure::Cancelled(cause))) => {
                            return SendStep::Cancelled(element, cause);
                        }
                        GetResult::Done(Err(Failure::Error(e))) => {
                            // Parked channel waiters are only ever resumed
                            // with unit or cancellation.
                            handle_coroutine_exception(
                                "spsc",
                                &FatalError::Internal {
                                    scope: "spsc",
                                    message: format!("send waiter resumed with error: {e}"),
                                },
                            );
                            return SendStep::Cancelled(
                                element,
                                CancelCause::new("send waiter failed"),
                            );
                        }
                    }
                }
            }
        }
    }

    /// Closes the channel. Elements already buffered remain receivable;
    /// later sends fail. Returns `true` for the first close only.
    pub fn close(&mut self, cause: Option<DynError>) -> bool {
        self.ring.close(cause)
    }

    /// `true` once the channel is closed for new elements.
    #[must_use]
    pub fn is_closed_for_send(&self) -> bool {
        self.ring.closed.load(Ordering::Acquire)
    }

    /// Registers the close handler (at most one per channel). If the
    /// channel already closed, the handler fires immediately with the
    /// original cause.
    pub fn invoke_on_close(&self, handler: CloseHandler) -> Result<(), CloseHandlerError> {
        self.ring.register_on_close(handler)
    }
}

/// The consuming end. Exactly one consumer.
pub struct SpscReceiver<E: Send + 'static> {
    ring: Arc<Ring<E>>,
}

impl<E: Send + 'static> SpscReceiver<E> {
    /// Takes a buffered element without suspending.
    pub fn poll(&mut self) -> Result<E, TryRecvError> {
        match self.ring.poll_internal() {
            Some(Ok(e)) => {
                self.ring.wake_producer();
                Ok(e)
            }
            Some(Err(cause)) => Err(TryRecvError::Closed(cause)),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Receives, parking the consumer's continuation when the buffer is
    /// empty. After [`ReceiveStep::Suspended`], retry once the
    /// continuation resumes through its delegate.
    pub fn receive(&mut self, waiter: &Arc<DispatchedContinuation<()>>) -> ReceiveStep<E> {
        loop {
            match self.poll() {
                Ok(e) => return ReceiveStep::Value(e),
                Err(TryRecvError::Closed(cause)) => return ReceiveStep::Closed(cause),
                Err(TryRecvError::Empty) => {
                    let cont = waiter.claim();
                    *self.ring.parked_consumer.lock() = Some(cont.clone());
                    // Same stash-then-recheck dance as the producer side.
                    if self.ring.has_data_or_closed() {
                        self.ring.wake_consumer();
                    }
                    match cont.get_result() {
                        GetResult::Suspended => return ReceiveStep::Suspended,
                        GetResult::Done(Ok(())) => {
                            waiter.release(cont);
                        }
                        GetResult::Done(Err(Failure::Cancelled(cause))) => {
                            return ReceiveStep::Cancelled(cause);
                        }
                        GetResult::Done(Err(Failure::Error(e))) => {
                            handle_coroutine_exception(
                                "spsc",
                                &FatalError::Internal {
                                    scope: "spsc",
                                    message: format!("receive waiter resumed with error: {e}"),
                                },
                            );
                            return ReceiveStep::Cancelled(CancelCause::new(
                                "receive waiter failed",
                            ));
                        }
                    }
                }
            }
        }
    }

    /// Like [`SpscReceiver::receive`], but folds the closed outcome into a
    /// [`ValueOrClosed`] marker instead of a dedicated step.
    pub fn receive_or_closed(
        &mut self,
        waiter: &Arc<DispatchedContinuation<()>>,
    ) -> super::MultiReceiveStep<E> {
        match self.receive(waiter) {
            ReceiveStep::Value(e) => super::MultiReceiveStep::Ready(ValueOrClosed::Value(e)),
            ReceiveStep::Closed(cause) => {
                super::MultiReceiveStep::Ready(ValueOrClosed::Closed(cause))
            }
            ReceiveStep::Suspended => super::MultiReceiveStep::Suspended,
            ReceiveStep::Cancelled(cause) => super::MultiReceiveStep::Cancelled(cause),
        }
    }

    /// Cancels the channel from the consumer side: a close that also tells
    /// the producer to stop.
    pub fn cancel(&mut self, cause: Option<DynError>) -> bool {
        self.ring.close(cause)
    }

    /// `true` when no buffered element is currently receivable.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.ring.has_data_or_closed()
            || self
                .ring
                .slot_at(self.ring.consumer.load(Ordering::Acquire))
                .tag
                .load(Ordering::Acquire)
                == SLOT_CLOSED
    }

    /// `true` once the channel is closed and fully drained.
    #[must_use]
    pub fn is_closed_for_receive(&self) -> bool {
        self.ring
            .slot_at(self.ring.consumer.load(Ordering::Acquire))
            .tag
            .load(Ordering::Acquire)
            == SLOT_CLOSED
    }

    /// Consumer-side counterpart of [`SpscSender::invoke_on_close`].
    pub fn invoke_on_close(&self, handler: CloseHandler) -> Result<(), CloseHandlerError> {
        self.ring.register_on_close(handler)
    }
}
