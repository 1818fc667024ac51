//! Bounded retries for transient storage failures.
use std::time::Duration;

use rand::{thread_rng, Rng};

use crate::Result;

/// How transient failures are retried.
///
/// Only errors for which [`Error::is_transient`](crate::Error::is_transient) returns `true` are
/// retried. Waits double after every attempt, capped at `max_backoff`, with random jitter added so
/// replicas hitting the same busy database don't retry in lockstep.
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. `1` disables retries.
    ///
    /// Defaults to [`RetryPolicy::DEFAULT_MAX_ATTEMPTS`].
    pub max_attempts: u32,
    /// Wait before the second attempt.
    ///
    /// Defaults to [`RetryPolicy::DEFAULT_INITIAL_BACKOFF`].
    pub initial_backoff: Duration,
    /// Upper bound for a single wait (before jitter).
    ///
    /// Defaults to [`RetryPolicy::DEFAULT_MAX_BACKOFF`].
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Default value for [`RetryPolicy::max_attempts`].
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    /// Default value for [`RetryPolicy::initial_backoff`].
    pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(10);
    /// Default value for [`RetryPolicy::max_backoff`].
    pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(200);

    /// Create a new `RetryPolicy` using default configuration.
    pub fn new() -> RetryPolicy {
        RetryPolicy::default()
    }

    /// A policy that makes a single attempt.
    pub fn no_retry() -> RetryPolicy {
        RetryPolicy::default().with_max_attempts(1)
    }

    /// Update the number of attempts. Values below 1 are treated as 1.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> RetryPolicy {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[allow(missing_docs)]
    pub fn with_initial_backoff(mut self, initial_backoff: Duration) -> RetryPolicy {
        self.initial_backoff = initial_backoff;
        self
    }

    #[allow(missing_docs)]
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> RetryPolicy {
        self.max_backoff = max_backoff;
        self
    }

    /// Wait after the `attempt`-th failure (1-based), before jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << (attempt - 1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `operation` until it succeeds, fails permanently, or attempts run out. The last error
    /// is returned.
    pub(crate) fn run<T>(&self, what: &str, mut operation: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match operation() {
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let backoff = self.backoff(attempt);
                    let wait = jitter(backoff, backoff / 2);
                    log::warn!(target: "abkit",
                               attempt,
                               wait:debug = wait;
                               "{what} failed, retrying: {err}");
                    std::thread::sleep(wait);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> RetryPolicy {
        RetryPolicy {
            max_attempts: RetryPolicy::DEFAULT_MAX_ATTEMPTS,
            initial_backoff: RetryPolicy::DEFAULT_INITIAL_BACKOFF,
            max_backoff: RetryPolicy::DEFAULT_MAX_BACKOFF,
        }
    }
}

/// Apply a random jitter to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    interval + thread_rng().gen_range(Duration::ZERO..jitter)
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, time::Duration};

    use super::RetryPolicy;
    use crate::Error;

    fn fast() -> RetryPolicy {
        RetryPolicy::new()
            .with_initial_backoff(Duration::from_millis(1))
            .with_max_backoff(Duration::from_millis(2))
    }

    #[test]
    fn retries_transient_errors_until_success() {
        let calls = Cell::new(0);
        let result = fast().run("write", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(Error::StorageUnavailable("busy".into()))
            } else {
                Ok(calls.get())
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let result: crate::Result<()> = fast().with_max_attempts(4).run("write", || {
            calls.set(calls.get() + 1);
            Err(Error::StorageUnavailable("busy".into()))
        });
        assert!(matches!(result, Err(Error::StorageUnavailable(_))));
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: crate::Result<()> = fast().run("write", || {
            calls.set(calls.get() + 1);
            Err(Error::Storage("corrupt row".into()))
        });
        assert!(matches!(result, Err(Error::Storage(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new()
            .with_initial_backoff(Duration::from_millis(10))
            .with_max_backoff(Duration::from_millis(35));
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(35));
        assert_eq!(policy.backoff(40), Duration::from_millis(35));
    }

    #[test]
    fn max_attempts_is_at_least_one() {
        assert_eq!(RetryPolicy::new().with_max_attempts(0).max_attempts, 1);
        assert_eq!(RetryPolicy::no_retry().max_attempts, 1);
    }
}
