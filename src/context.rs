//! Coroutine context elements and scoped thread-context bookkeeping.

use std::cell::RefCell;
use std::sync::Arc;

use crate::job::Job;

/// The ambient context a continuation resumes under.
///
/// Carries the structured-cancellation [`Job`] (if any) and a diagnostic
/// name. Cheap to clone; both elements are shared.
#[derive(Clone, Default)]
pub struct CoroutineContext {
    job: Option<Job>,
    name: Option<Arc<str>>,
}

impl CoroutineContext {
    /// An empty context: no job, no name.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns this context with the given job installed.
    #[must_use]
    pub fn with_job(mut self, job: Job) -> Self {
        self.job = Some(job);
        self
    }

    /// Returns this context with a diagnostic name installed.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into().into());
        self
    }

    /// The job governing cancellation, if any.
    #[must_use]
    pub fn job(&self) -> Option<&Job> {
        self.job.as_ref()
    }

    /// The diagnostic name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl core::fmt::Debug for CoroutineContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CoroutineContext")
            .field("name", &self.name)
            .field("has_job", &self.job.is_some())
            .finish()
    }
}

thread_local! {
    static CURRENT_NAME: RefCell<Option<Arc<str>>> = const { RefCell::new(None) };
}

/// Scoped save/restore of the per-thread coroutine name.
///
/// Running a dispatched task installs the task's context name for the
/// duration of the resumption and restores the previous one on exit, so
/// nested undispatched resumptions unwind correctly.
#[must_use = "dropping the guard restores the previous context"]
pub struct ThreadContextGuard {
    prev: Option<Arc<str>>,
}

impl ThreadContextGuard {
    /// Installs `ctx`'s name on the current thread, returning a guard that
    /// restores the previous name on drop.
    pub fn enter(ctx: &CoroutineContext) -> Self {
        let next = ctx.name.clone();
        let prev = CURRENT_NAME.with(|c| c.replace(next));
        Self { prev }
    }
}

impl Drop for ThreadContextGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT_NAME.with(|c| {
            *c.borrow_mut() = prev;
        });
    }
}

/// The coroutine name currently installed on this thread, if any.
#[must_use]
pub fn current_coroutine_name() -> Option<Arc<str>> {
    CURRENT_NAME.with(|c| c.borrow().clone())
}
