use crate::cancel::CancelToken;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::fmt::Display;
use std::time::Duration;

/// Errors that can tell whether trying again might succeed.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

/// Bounded exponential backoff for operations against external services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

/// Caps an [`ExponentialBackoff`] at a number of attempts and waits on the
/// cancel token instead of leaving the wait to `backoff::retry`.
struct BoundedBackoff<'a> {
    schedule: ExponentialBackoff,
    cancel: &'a CancelToken,
    retries: u32,
    remaining: u32,
}

impl Backoff for BoundedBackoff<'_> {
    fn reset(&mut self) {
        self.schedule.reset();
        self.remaining = self.retries;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.remaining == 0 || self.cancel.is_cancelled() {
            return None;
        }
        self.remaining -= 1;
        let delay = self.schedule.next_backoff()?;
        tracing::debug!(?delay, "Backing off");
        // The wait already happened here; the retry loop sleeps for zero.
        self.cancel.sleep(delay).then_some(Duration::ZERO)
    }
}

impl RetryPolicy {
    /// A policy that performs a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    fn schedule(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let mut schedule = self.schedule();
        for _ in 1..attempt.min(64) {
            schedule.next_backoff();
        }
        schedule.next_backoff().unwrap_or(self.max_backoff)
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Only errors reporting [`Retryable::is_transient`] are retried. A
    /// cancellation during backoff returns the last error immediately.
    pub fn run<T, E, F>(&self, what: &str, cancel: &CancelToken, mut op: F) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;
        let bounded = BoundedBackoff {
            schedule: self.schedule(),
            cancel,
            retries: max_attempts - 1,
            remaining: max_attempts - 1,
        };

        let result = backoff::retry(bounded, || {
            attempt += 1;
            op(attempt).map_err(|e| {
                if !e.is_transient() {
                    return backoff::Error::permanent(e);
                }
                if attempt < max_attempts {
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        "{what} failed transiently: {e}; retrying"
                    );
                }
                backoff::Error::transient(e)
            })
        });
        result.map_err(|e| match e {
            backoff::Error::Permanent(e) => e,
            backoff::Error::Transient { err, .. } => err,
        })
    }
}
