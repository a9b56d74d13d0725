//! Process-wide sink for fatal machinery failures.
//!
//! Failures that cannot be delivered to any awaiting party (broken protocol
//! invariants, panicking completion handlers, lost exceptions) must never
//! vanish. They are always logged, and additionally forwarded to every
//! registered handler. Handlers run under a panic guard: a panicking
//! handler is itself reported here, never propagated into whichever
//! unlucky caller happened to trip the failure.

use std::panic::{catch_unwind, AssertUnwindSafe};

use parking_lot::RwLock;

use crate::error::{panic_message, FatalError};

/// A registered sink callback. Receives the scope label of the component
/// that detected the failure plus the failure itself.
pub type ExceptionHandler = Box<dyn Fn(&str, &FatalError) + Send + Sync + 'static>;

static HANDLERS: RwLock<Vec<ExceptionHandler>> = RwLock::new(Vec::new());

/// Registers a process-wide handler for fatal coroutine failures.
///
/// Handlers are invoked in registration order, after the failure has been
/// logged. Registration is additive; there is no unregister for individual
/// handlers, only [`clear_exception_handlers`].
pub fn register_exception_handler(handler: ExceptionHandler) {
    HANDLERS.write().push(handler);
}

/// Removes all registered handlers. Intended for test isolation.
pub fn clear_exception_handlers() {
    HANDLERS.write().clear();
}

/// Runs a user-supplied handler under a panic guard.
///
/// A panicking handler is reported to the sink as a
/// [`FatalError::HandlerFailed`] and never unwinds into the caller.
pub(crate) fn invoke_handler_safely(kind: &'static str, scope: &'static str, f: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        handle_coroutine_exception(
            scope,
            &FatalError::HandlerFailed {
                handler: kind,
                message: panic_message(payload.as_ref()),
            },
        );
    }
}

/// Reports a fatal machinery failure.
///
/// Always logs; then fans out to registered handlers under a panic guard.
pub fn handle_coroutine_exception(scope: &str, error: &FatalError) {
    tracing::error!(scope, error = %error, "fatal coroutine machinery failure");
    let handlers = HANDLERS.read();
    for handler in handlers.iter() {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(scope, error))) {
            tracing::error!(
                scope,
                panic = %panic_message(payload.as_ref()),
                "exception handler panicked while reporting a fatal failure"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    // The registry is process-global, so the tests here share one handler
    // list and must run serially.
    static TEST_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

    #[test]
    fn handlers_receive_failures_in_order() {
        let _guard = TEST_LOCK.lock();
        clear_exception_handlers();

        let seen = Arc::new(AtomicUsize::new(0));
        let s1 = Arc::clone(&seen);
        register_exception_handler(Box::new(move |scope, _| {
            assert_eq!(scope, "test");
            s1.fetch_add(1, Ordering::SeqCst);
        }));
        let s2 = Arc::clone(&seen);
        register_exception_handler(Box::new(move |_, _| {
            s2.fetch_add(10, Ordering::SeqCst);
        }));

        handle_coroutine_exception(
            "test",
            &FatalError::Internal {
                scope: "test",
                message: "synthetic".into(),
            },
        );
        assert_eq!(seen.load(Ordering::SeqCst), 11);
        clear_exception_handlers();
    }

    #[test]
    fn panicking_handler_does_not_starve_later_handlers() {
        let _guard = TEST_LOCK.lock();
        clear_exception_handlers();

        let seen = Arc::new(AtomicUsize::new(0));
        register_exception_handler(Box::new(|_, _| panic!("bad handler")));
        let s = Arc::clone(&seen);
        register_exception_handler(Box::new(move |_, _| {
            s.fetch_add(1, Ordering::SeqCst);
        }));

        handle_coroutine_exception(
            "test",
            &FatalError::HandlerFailed {
                handler: "completion",
                message: "synthetic".into(),
            },
        );
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        clear_exception_handlers();
    }
}
