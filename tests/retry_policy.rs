//! `with_retry`'s backoff/retry-mode behavior, exercised without any real
//! I/O by injecting a no-op sleep and a closure that fails a fixed number
//! of times before succeeding.

use std::cell::Cell;
use std::time::Duration;

use stack_init::error::{RemoteError, RetryMode};
use stack_init::retry::{with_retry, RetryPolicy};

#[test]
fn terminal_failure_stops_after_one_attempt() {
    let calls = Cell::new(0);
    let policy = RetryPolicy { max_tries: 5, max_sleep: 0.0 };

    let result: Result<(), RemoteError> = with_retry(&policy, |_| {}, |_i| {
        calls.set(calls.get() + 1);
        Err(RemoteError::new(RetryMode::Terminal, "not found"))
    });

    assert!(result.is_err());
    assert_eq!(calls.get(), 1);
}

#[test]
fn retriable_failure_is_retried_up_to_max_tries() {
    let calls = Cell::new(0);
    let policy = RetryPolicy { max_tries: 3, max_sleep: 0.0 };

    let result: Result<(), RemoteError> = with_retry(&policy, |_| {}, |_i| {
        calls.set(calls.get() + 1);
        Err(RemoteError::new(RetryMode::Retriable, "connection reset"))
    });

    assert!(result.is_err());
    assert_eq!(calls.get(), 3);
}

#[test]
fn retriable_forever_extends_the_schedule_past_max_tries() {
    let calls = Cell::new(0);
    let policy = RetryPolicy { max_tries: 2, max_sleep: 0.0 };

    // Fails RETRIABLE_FOREVER four times (more than max_tries), then succeeds;
    // a fixed-length schedule would have given up after 2 attempts.
    let result = with_retry(&policy, |_: Duration| {}, |_i| {
        let n = calls.get() + 1;
        calls.set(n);
        if n <= 4 {
            Err(RemoteError::new(RetryMode::RetriableForever, "throttled"))
        } else {
            Ok(n)
        }
    });

    assert_eq!(result.unwrap(), 5);
    assert_eq!(calls.get(), 5);
}

#[test]
fn success_on_first_attempt_never_sleeps() {
    let slept = Cell::new(false);
    let policy = RetryPolicy::default();

    let result: Result<i32, RemoteError> =
        with_retry(&policy, |_| slept.set(true), |_i| Ok(42));

    assert_eq!(result.unwrap(), 42);
    assert!(!slept.get());
}
