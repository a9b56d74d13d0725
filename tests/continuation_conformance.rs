//! Conformance: exactly-once resumption.
//!
//! For any continuation, exactly one of resume, resume-with-exception, or
//! cancellation determines the terminal outcome, under every interleaving.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use corocore::continuation::Continuation;
use corocore::lab::RecordingDelegate;
use corocore::{
    CancelCause, CancellableContinuation, CoroutineContext, Delegate, Failure, GetResult,
    ResumeMode,
};

fn plain<T: Send + 'static>(
    mode: ResumeMode,
) -> (CancellableContinuation<T>, Arc<RecordingDelegate<T>>) {
    let delegate = RecordingDelegate::new(CoroutineContext::new());
    let cont = CancellableContinuation::new(
        Delegate::Plain(delegate.clone() as Arc<dyn Continuation<T>>),
        mode,
    );
    (cont, delegate)
}

#[test]
fn resume_is_the_unique_terminal_transition() {
    let (cont, delegate) = plain::<u32>(ResumeMode::AtomicDefault);
    assert!(matches!(cont.get_result(), GetResult::Suspended));
    cont.resume(1);
    assert!(matches!(delegate.take(), Some(Ok(1))));

    // Everything after the winner is rejected.
    assert!(!cont.cancel(CancelCause::new("late")));
    assert!(matches!(cont.try_resume(2, None), Err(2)));
    assert!(cont.try_resume_with_exception(Arc::new(std::io::Error::other("late"))).is_none());
    assert!(delegate.take().is_none());
}

#[test]
fn cancellation_is_the_unique_terminal_transition() {
    let (cont, delegate) = plain::<u32>(ResumeMode::AtomicDefault);
    assert!(matches!(cont.get_result(), GetResult::Suspended));
    assert!(cont.cancel(CancelCause::new("stop")));
    match delegate.take() {
        Some(Err(Failure::Cancelled(cause))) => assert_eq!(cause.message(), "stop"),
        other => panic!("expected cancellation, got {other:?}"),
    }

    // One losing resume is absorbed without a second delivery.
    cont.resume(3);
    assert!(delegate.take().is_none());
    assert!(!cont.cancel(CancelCause::new("again")));
}

#[test]
#[should_panic(expected = "resumed twice")]
fn a_second_losing_resume_is_a_detected_error() {
    let (cont, _delegate) = plain::<u32>(ResumeMode::AtomicDefault);
    cont.cancel(CancelCause::new("gone"));
    cont.resume(1);
    cont.resume(2);
}

#[test]
fn racing_resume_and_cancel_produce_exactly_one_winner() {
    for _ in 0..500 {
        let (cont, delegate) = plain::<u32>(ResumeMode::AtomicDefault);
        assert!(matches!(cont.get_result(), GetResult::Suspended));

        let resumed = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicUsize::new(0));

        let c1 = cont.clone();
        let r = Arc::clone(&resumed);
        let resumer = thread::spawn(move || {
            if let Ok(token) = c1.try_resume(7, None) {
                r.fetch_add(1, Ordering::SeqCst);
                c1.complete_resume(token);
            }
        });
        let c2 = cont.clone();
        let k = Arc::clone(&cancelled);
        let canceller = thread::spawn(move || {
            if c2.cancel(CancelCause::new("raced")) {
                k.fetch_add(1, Ordering::SeqCst);
            }
        });
        resumer.join().expect("resumer");
        canceller.join().expect("canceller");

        let resumed = resumed.load(Ordering::SeqCst);
        let cancelled = cancelled.load(Ordering::SeqCst);
        assert_eq!(resumed + cancelled, 1, "exactly one terminal transition");
        match delegate.take() {
            Some(Ok(7)) => assert_eq!(resumed, 1),
            Some(Err(Failure::Cancelled(_))) => assert_eq!(cancelled, 1),
            other => panic!("winner did not deliver: {other:?}"),
        }
    }
}

#[test]
fn racing_value_and_exception_produce_exactly_one_winner() {
    for _ in 0..500 {
        let (cont, delegate) = plain::<u32>(ResumeMode::AtomicDefault);
        assert!(matches!(cont.get_result(), GetResult::Suspended));

        let c1 = cont.clone();
        let t1 = thread::spawn(move || {
            if let Ok(token) = c1.try_resume(1, None) {
                c1.complete_resume(token);
                true
            } else {
                false
            }
        });
        let c2 = cont.clone();
        let t2 = thread::spawn(move || {
            if let Some(token) =
                c2.try_resume_with_exception(Arc::new(std::io::Error::other("boom")))
            {
                c2.complete_resume(token);
                true
            } else {
                false
            }
        });
        let value_won = t1.join().expect("value thread");
        let error_won = t2.join().expect("error thread");
        assert!(value_won ^ error_won);
        match delegate.take() {
            Some(Ok(1)) => assert!(value_won),
            Some(Err(Failure::Error(e))) => {
                assert!(error_won);
                assert_eq!(e.to_string(), "boom");
            }
            other => panic!("winner did not deliver: {other:?}"),
        }
    }
}

#[test]
fn cancellation_handler_is_installed_at_most_once() {
    let (cont, _delegate) = plain::<u32>(ResumeMode::AtomicDefault);
    let fired = Arc::new(AtomicUsize::new(0));
    let f = Arc::clone(&fired);
    cont.invoke_on_cancellation(Box::new(move |cause| {
        assert_eq!(cause.message(), "bye");
        f.fetch_add(1, Ordering::SeqCst);
    }));
    assert!(cont.cancel(CancelCause::new("bye")));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn handler_installed_after_cancellation_fires_immediately_once() {
    let (cont, _delegate) = plain::<u32>(ResumeMode::AtomicDefault);
    assert!(cont.cancel(CancelCause::new("done")));
    let fired = Arc::new(AtomicUsize::new(0));
    let f = Arc::clone(&fired);
    cont.invoke_on_cancellation(Box::new(move |_| {
        f.fetch_add(1, Ordering::SeqCst);
    }));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
#[should_panic(expected = "one cancellation handler")]
fn a_second_handler_installation_is_a_detected_error() {
    let (cont, _delegate) = plain::<u32>(ResumeMode::AtomicDefault);
    cont.invoke_on_cancellation(Box::new(|_| {}));
    cont.invoke_on_cancellation(Box::new(|_| {}));
}

#[test]
fn a_failure_losing_to_cancellation_reaches_the_fatal_sink() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    corocore::exception::clear_exception_handlers();
    let seen = Arc::new(AtomicUsize::new(0));
    let s = Arc::clone(&seen);
    corocore::exception::register_exception_handler(Box::new(move |scope, error| {
        assert_eq!(scope, "continuation");
        assert!(matches!(error, corocore::error::FatalError::LostFailure(_)));
        s.fetch_add(1, Ordering::SeqCst);
    }));

    let (cont, delegate) = plain::<u32>(ResumeMode::AtomicDefault);
    assert!(matches!(cont.get_result(), GetResult::Suspended));
    assert!(cont.cancel(CancelCause::new("first")));
    assert!(matches!(delegate.take(), Some(Err(Failure::Cancelled(_)))));

    // The failure lost the race; nobody is awaiting it anymore.
    cont.resume_with_exception(Arc::new(std::io::Error::other("nobody listening")));
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    corocore::exception::clear_exception_handlers();
}

#[test]
fn idempotent_token_makes_a_repeat_claim_the_same_resume() {
    use corocore::IdempotentToken;

    let (cont, delegate) = plain::<u32>(ResumeMode::AtomicDefault);
    assert!(matches!(cont.get_result(), GetResult::Suspended));
    let token = IdempotentToken(41);
    let first = cont.try_resume(5, Some(token)).expect("first claim");
    // The same logical resume may repeat; a different identity may not.
    let repeat = cont.try_resume(5, Some(token)).expect("repeat accepted");
    assert!(matches!(cont.try_resume(5, Some(IdempotentToken(42))), Err(5)));
    cont.complete_resume(first);
    assert!(matches!(delegate.take(), Some(Ok(5))));
    // The repeat token is spent without a second delivery.
    drop(repeat);
}
