//! Bounded retry with exponential backoff
//!
//! Restores retry exactly one thing: committing the invalidation of newer checkpoints after
//! the run has already accepted the restored state. Everything else a restore does is
//! reported to the caller untouched.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Configuration for retrying failed operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: usize,

    /// Delay before the first retry, in milliseconds
    pub initial_backoff_ms: u64,

    /// Multiplier for the delay after each retry
    pub backoff_factor: f64,

    /// Upper bound on a single delay, in milliseconds
    pub max_backoff_ms: u64,

    /// Scale each delay by a random factor in [0.5, 1.5]
    pub jitter: bool,
}

impl RetryPolicy {
    /// Create a new retry policy with the given max attempts
    ///
    /// # Example
    ///
    /// ```rust
    /// use run_checkpoint::RetryPolicy;
    ///
    /// let policy = RetryPolicy::new(3);
    /// assert_eq!(policy.max_attempts, 3);
    /// ```
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff_ms: 100,
            backoff_factor: 2.0,
            max_backoff_ms: 5_000,
            jitter: true,
        }
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after the given failed attempt (0-indexed)
    ///
    /// `initial_backoff * backoff_factor ^ attempt`, capped at `max_backoff`, with
    /// optional jitter.
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        let base = self.initial_backoff_ms as f64 * self.backoff_factor.powi(attempt as i32);
        let capped = base.min(self.max_backoff_ms as f64);

        let delay = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..=1.5);
            capped * factor
        } else {
            capped
        };

        Duration::from_millis(delay.max(0.0) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Run `operation` until it succeeds, `is_retryable` rejects the error, or attempts run out.
///
/// Returns the last error together with the number of attempts made.
pub async fn with_retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> std::result::Result<T, (E, usize)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                attempt += 1;
                if attempt >= policy.max_attempts || !is_retryable(&error) {
                    return Err((error, attempt));
                }

                let delay = policy.calculate_delay(attempt - 1);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    ?delay,
                    error = %error,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_delay_backoff_without_jitter() {
        let policy = RetryPolicy::new(5)
            .with_initial_backoff(Duration::from_millis(100))
            .with_backoff_factor(2.0)
            .with_max_backoff(Duration::from_millis(300))
            .with_jitter(false);

        assert_eq!(policy.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(3).with_initial_backoff(Duration::from_millis(100));
        for _ in 0..50 {
            let delay = policy.calculate_delay(0);
            assert!(delay >= Duration::from_millis(50) && delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        assert_eq!(RetryPolicy::new(0).max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let policy = RetryPolicy::new(3).with_jitter(false);

        let result: std::result::Result<&str, (String, usize)> = with_retry(
            &policy,
            |_| true,
            move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("flaky".to_string())
                } else {
                    Ok("done")
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let policy = RetryPolicy::new(2).with_jitter(false);

        let result: std::result::Result<(), (String, usize)> = with_retry(
            &policy,
            |_| true,
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("down".to_string())
            },
        )
        .await;

        let (error, attempts) = result.unwrap_err();
        assert_eq!(error, "down");
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_returned_at_once() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: std::result::Result<(), (String, usize)> = with_retry(
            &RetryPolicy::new(5),
            |_| false,
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("fatal".to_string())
            },
        )
        .await;

        assert_eq!(result.unwrap_err().1, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
