//! Structured cancellation: the [`Job`] lifecycle machine.
//!
//! A job moves monotonically through
//! `New -> Active -> (Completing -> Completed | Cancelling -> Cancelled)`.
//! Cancellation is first-caller-wins and idempotent; completion waits for
//! every attached child to detach before the terminal transition fires.
//! Completion handlers run outside the internal locks, under a panic guard.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::error::CancelCause;
use crate::exception::invoke_handler_safely;

// ============================================================================
// States
// ============================================================================

const NEW: u8 = 0;
const ACTIVE: u8 = 1;
const COMPLETING: u8 = 2;
const CANCELLING: u8 = 3;
const CANCELLED: u8 = 4;
const COMPLETED: u8 = 5;

/// A handler invoked when the job reaches a terminal state (or, if
/// registered with `on_cancelling`, as soon as cancellation begins).
/// Receives the cancellation cause, or `None` on normal completion.
pub type CompletionHandler = Box<dyn FnOnce(Option<&CancelCause>) + Send + 'static>;

/// A party whose lifecycle is subordinate to a job.
///
/// Attached via [`Job::attach_child`]; notified when the parent starts
/// cancelling. The parent does not complete until the child's attachment
/// handle is disposed.
pub trait ChildNode: Send + Sync {
    /// The parent began cancelling with `cause`.
    fn parent_cancelled(&self, cause: CancelCause);
}

// ============================================================================
// Disposable handles
// ============================================================================

struct Disposer {
    done: AtomicBool,
    action: Box<dyn Fn() + Send + Sync>,
}

/// An idempotent deregistration handle.
///
/// Returned by [`Job::attach_child`] and [`Job::invoke_on_completion`].
/// Disposing detaches the registration; disposing twice (or disposing a
/// no-op handle) does nothing.
#[derive(Clone)]
pub struct DisposableHandle {
    inner: Option<Arc<Disposer>>,
}

impl DisposableHandle {
    /// A handle with nothing behind it.
    #[must_use]
    pub fn noop() -> Self {
        Self { inner: None }
    }

    fn from_action(action: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Some(Arc::new(Disposer {
                done: AtomicBool::new(false),
                action: Box::new(action),
            })),
        }
    }

    /// Runs the deregistration action, at most once across all clones.
    pub fn dispose(&self) {
        if let Some(d) = &self.inner {
            if !d.done.swap(true, Ordering::AcqRel) {
                (d.action)();
            }
        }
    }
}

impl core::fmt::Debug for DisposableHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DisposableHandle")
            .field("noop", &self.inner.is_none())
            .finish()
    }
}

// ============================================================================
// Core
// ============================================================================

struct ChildEntry {
    id: u64,
    child: Arc<dyn ChildNode>,
}

struct HandlerEntry {
    id: u64,
    on_cancelling: bool,
    // Taken on invocation so dispose/drain races cannot double-fire.
    handler: Option<CompletionHandler>,
}

struct JobCore {
    state: AtomicU8,
    cause: Mutex<Option<CancelCause>>,
    children: Mutex<SmallVec<[ChildEntry; 4]>>,
    handlers: Mutex<SmallVec<[HandlerEntry; 2]>>,
    next_id: AtomicU64,
    parent_handle: Mutex<Option<DisposableHandle>>,
}

/// A cancellable unit of work with parent-child structure.
///
/// Cloning shares the same underlying job.
#[derive(Clone)]
pub struct Job {
    core: Arc<JobCore>,
}

impl Job {
    fn with_state(state: u8, parent: Option<&Job>) -> Self {
        let job = Self {
            core: Arc::new(JobCore {
                state: AtomicU8::new(state),
                cause: Mutex::new(None),
                children: Mutex::new(SmallVec::new()),
                handlers: Mutex::new(SmallVec::new()),
                next_id: AtomicU64::new(1),
                parent_handle: Mutex::new(None),
            }),
        };
        if let Some(parent) = parent {
            let handle = parent.attach_child(Arc::new(job.clone()));
            *job.core.parent_handle.lock() = Some(handle);
        }
        job
    }

    /// Creates an active job, optionally attached to a parent.
    ///
    /// Attaching to an already-cancelling parent cancels the new job
    /// immediately.
    #[must_use]
    pub fn new(parent: Option<&Job>) -> Self {
        Self::with_state(ACTIVE, parent)
    }

    /// Creates a job in the `New` state; it reports inactive until
    /// [`Job::start`] is called.
    #[must_use]
    pub fn new_lazy(parent: Option<&Job>) -> Self {
        Self::with_state(NEW, parent)
    }

    /// Moves `New -> Active`. Returns `true` if this call performed the
    /// transition.
    pub fn start(&self) -> bool {
        self.core
            .state
            .compare_exchange(NEW, ACTIVE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `true` while the job can still accept work (Active or Completing).
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.core.state.load(Ordering::Acquire), ACTIVE | COMPLETING)
    }

    /// `true` once the job reached a terminal state.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self.core.state.load(Ordering::Acquire), CANCELLED | COMPLETED)
    }

    /// `true` once cancellation has begun (terminal or not).
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.core.state.load(Ordering::Acquire), CANCELLING | CANCELLED)
    }

    /// Returns `Ok` while active, or the cancellation cause otherwise.
    pub fn ensure_active(&self) -> Result<(), CancelCause> {
        if self.is_active() {
            Ok(())
        } else {
            Err(self.cancellation_cause())
        }
    }

    /// The cause to deliver to parties cancelled on behalf of this job.
    ///
    /// Falls back to a state-derived message when no explicit cause was
    /// recorded.
    #[must_use]
    pub fn cancellation_cause(&self) -> CancelCause {
        if let Some(cause) = self.core.cause.lock().clone() {
            return cause;
        }
        match self.core.state.load(Ordering::Acquire) {
            COMPLETED => CancelCause::new("job has completed normally"),
            CANCELLING | CANCELLED => CancelCause::new("job was cancelled"),
            _ => CancelCause::new("job is being cancelled"),
        }
    }

    /// Begins cancellation. First caller wins and returns `true`; the
    /// cause recorded then is the one every child and handler observes.
    ///
    /// The job does not reach `Cancelled` until all children detach.
    pub fn cancel(&self, cause: Option<CancelCause>) -> bool {
        let cause = cause.unwrap_or_else(|| CancelCause::new("job was cancelled"));
        loop {
            let s = self.core.state.load(Ordering::Acquire);
            match s {
                CANCELLING | CANCELLED | COMPLETED => return false,
                _ => {
                    if self
                        .core
                        .state
                        .compare_exchange(s, CANCELLING, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        break;
                    }
                }
            }
        }
        // Only the CAS winner reaches here, so this write is unique.
        *self.core.cause.lock() = Some(cause.clone());

        // Fire on-cancelling handlers outside the lock.
        let cancelling: Vec<CompletionHandler> = {
            let mut handlers = self.core.handlers.lock();
            handlers
                .iter_mut()
                .filter(|h| h.on_cancelling)
                .filter_map(|h| h.handler.take())
                .collect()
        };
        for handler in cancelling {
            let cause = cause.clone();
            invoke_handler_safely("on-cancelling", "job", move || handler(Some(&cause)));
        }

        // Snapshot children under the lock, notify outside it. A child
        // attached concurrently either saw the Cancelling state itself or
        // landed in this snapshot.
        let children: Vec<Arc<dyn ChildNode>> = {
            let children = self.core.children.lock();
            children.iter().map(|c| Arc::clone(&c.child)).collect()
        };
        let cause = self.cancellation_cause();
        for child in children {
            child.parent_cancelled(cause.clone());
        }

        self.try_finalize();
        true
    }

    /// Declares the job's own work done. The terminal `Completed` state is
    /// reached once all children detach. Returns `true` if this call moved
    /// the job out of the active states.
    pub fn complete(&self) -> bool {
        loop {
            let s = self.core.state.load(Ordering::Acquire);
            match s {
                NEW | ACTIVE => {
                    if self
                        .core
                        .state
                        .compare_exchange(s, COMPLETING, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.try_finalize();
                        return true;
                    }
                }
                _ => return false,
            }
        }
    }

    /// Attaches a child whose completion gates this job's completion.
    ///
    /// If the job is already cancelling, the child is notified immediately
    /// and a no-op handle is returned. The returned handle detaches the
    /// child; the final detach lets a completing or cancelling job reach
    /// its terminal state.
    pub fn attach_child(&self, child: Arc<dyn ChildNode>) -> DisposableHandle {
        let id = self.core.next_id.fetch_add(1, Ordering::Relaxed);
        {
            // State is checked while holding the children lock: a
            // concurrent cancel snapshots children only after taking this
            // lock, so it either sees our entry or we see Cancelling here.
            let mut children = self.core.children.lock();
            match self.core.state.load(Ordering::Acquire) {
                CANCELLING | CANCELLED => {
                    drop(children);
                    child.parent_cancelled(self.cancellation_cause());
                    return DisposableHandle::noop();
                }
                COMPLETED => return DisposableHandle::noop(),
                _ => children.push(ChildEntry { id, child }),
            }
        }
        let core = Arc::downgrade(&self.core);
        DisposableHandle::from_action(move || {
            if let Some(core) = core.upgrade() {
                core.children.lock().retain(|c| c.id != id);
                Job { core }.try_finalize();
            }
        })
    }

    /// Registers a completion handler.
    ///
    /// With `on_cancelling`, the handler additionally fires as soon as
    /// cancellation begins (instead of waiting for the terminal state).
    /// If the triggering transition already happened, the handler fires
    /// inline right away when `invoke_immediately` is set, otherwise it is
    /// discarded. Each handler fires at most once.
    pub fn invoke_on_completion(
        &self,
        on_cancelling: bool,
        invoke_immediately: bool,
        handler: CompletionHandler,
    ) -> DisposableHandle {
        let id = self.core.next_id.fetch_add(1, Ordering::Relaxed);
        {
            // Same lock-across-check discipline as attach_child, against
            // the handlers lock that cancel/finalize drain under.
            let mut handlers = self.core.handlers.lock();
            let s = self.core.state.load(Ordering::Acquire);
            match s {
                CANCELLED => {
                    drop(handlers);
                    if invoke_immediately {
                        let cause = self.cancellation_cause();
                        invoke_handler_safely("completion", "job", move || handler(Some(&cause)));
                    }
                    return DisposableHandle::noop();
                }
                COMPLETED => {
                    drop(handlers);
                    if invoke_immediately {
                        invoke_handler_safely("completion", "job", move || handler(None));
                    }
                    return DisposableHandle::noop();
                }
                CANCELLING if on_cancelling => {
                    drop(handlers);
                    if invoke_immediately {
                        let cause = self.cancellation_cause();
                        invoke_handler_safely("on-cancelling", "job", move || {
                            handler(Some(&cause));
                        });
                    }
                    return DisposableHandle::noop();
                }
                _ => handlers.push(HandlerEntry {
                    id,
                    on_cancelling,
                    handler: Some(handler),
                }),
            }
        }
        let core = Arc::downgrade(&self.core);
        DisposableHandle::from_action(move || {
            if let Some(core) = core.upgrade() {
                core.handlers.lock().retain(|h| h.id != id);
            }
        })
    }

    /// Attempts the terminal transition; a no-op unless the job is in
    /// Completing or Cancelling with no children left.
    fn try_finalize(&self) {
        loop {
            let s = self.core.state.load(Ordering::Acquire);
            let terminal = match s {
                COMPLETING => COMPLETED,
                CANCELLING => CANCELLED,
                _ => return,
            };
            {
                // Hold the children lock across the emptiness check and
                // the CAS so an attach cannot slip in between.
                let children = self.core.children.lock();
                if !children.is_empty() {
                    return;
                }
                if self
                    .core
                    .state
                    .compare_exchange(s, terminal, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
            }

            let cause = if terminal == CANCELLED {
                Some(self.cancellation_cause())
            } else {
                None
            };
            let drained: Vec<CompletionHandler> = {
                let mut handlers = self.core.handlers.lock();
                handlers.iter_mut().filter_map(|h| h.handler.take()).collect()
            };
            for handler in drained {
                let cause = cause.clone();
                invoke_handler_safely("completion", "job", move || handler(cause.as_ref()));
            }
            if let Some(parent) = self.core.parent_handle.lock().take() {
                parent.dispose();
            }
            return;
        }
    }
}

impl ChildNode for Job {
    fn parent_cancelled(&self, cause: CancelCause) {
        self.cancel(Some(cause));
    }
}

impl core::fmt::Debug for Job {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self.core.state.load(Ordering::Acquire) {
            NEW => "New",
            ACTIVE => "Active",
            COMPLETING => "Completing",
            CANCELLING => "Cancelling",
            CANCELLED => "Cancelled",
            _ => "Completed",
        };
        f.debug_struct("Job").field("state", &s).finish()
    }
}
