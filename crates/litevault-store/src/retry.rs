//! Bounded retry for busy/locked database operations.
//!
//! SQLite reports `SQLITE_BUSY`/`SQLITE_LOCKED` while another writer holds
//! the lock. Every retry loop in the store (prepare, step, transaction begin)
//! goes through [`run`] with the same [`RetryPolicy`], so the backoff budget
//! is configured in exactly one place and the loop itself is testable without
//! a contended database.

use std::time::Duration;

/// Attempt budget and inter-attempt wait for busy retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 200,
            wait: Duration::from_millis(50),
        }
    }
}

/// Wait hook between attempts. Real callers sleep; tests count invocations.
pub type WaitFn<'a> = dyn Fn(Duration) + Send + Sync + 'a;

/// Thread-blocking sleep, the default wait for production stores.
pub fn blocking_wait(d: Duration) {
    std::thread::sleep(d);
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is exhausted. `is_retryable` classifies errors; the final
/// error is returned unchanged so callers keep the engine's diagnostics.
pub fn run<T, E>(
    policy: &RetryPolicy,
    wait: &WaitFn<'_>,
    is_retryable: impl Fn(&E) -> bool,
    mut op: impl FnMut() -> Result<T, E>,
) -> Result<T, E> {
    let mut attempts = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_retryable(&err) && attempts < policy.max_attempts => {
                attempts += 1;
                if attempts > 2 {
                    tracing::debug!(attempts, "database busy, retrying");
                }
                wait(policy.wait);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy(n: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts: n,
            wait: Duration::from_millis(1),
        }
    }

    #[test]
    fn succeeds_first_try_without_waiting() {
        let waits = AtomicUsize::new(0);
        let result: Result<i32, ()> = run(
            &policy(3),
            &|_| {
                waits.fetch_add(1, Ordering::SeqCst);
            },
            |_| true,
            || Ok(42),
        );
        assert_eq!(result.unwrap(), 42);
        assert_eq!(waits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn retries_until_success() {
        let calls = AtomicUsize::new(0);
        let result: Result<&str, &str> = run(
            &policy(10),
            &|_| {},
            |_| true,
            || {
                if calls.fetch_add(1, Ordering::SeqCst) < 4 {
                    Err("busy")
                } else {
                    Ok("done")
                }
            },
        );
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn gives_up_after_budget() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), &str> = run(
            &policy(3),
            &|_| {},
            |_| true,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("busy")
            },
        );
        assert_eq!(result.unwrap_err(), "busy");
        // initial attempt plus three retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn non_retryable_error_returns_immediately() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), &str> = run(
            &policy(100),
            &|_| {},
            |e| *e == "busy",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("corrupt")
            },
        );
        assert_eq!(result.unwrap_err(), "corrupt");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
