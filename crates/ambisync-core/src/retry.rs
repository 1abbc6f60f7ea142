//! Retry with exponential backoff for remote API calls.
//!
//! Only [`RemoteError::is_transient`] failures are retried: dropped
//! connections, throttling and server errors. Anything the remote rejects
//! outright (bad credentials, unknown device) fails immediately.
//!
//! Retries are a within-request courtesy. They never span passes; a device
//! whose request still fails is simply picked up again on the next pass.
//!
//! ```
//! use ambisync_core::{RemoteError, RetryConfig, with_retry};
//!
//! # async fn example() -> Result<(), RemoteError> {
//! let config = RetryConfig::for_remote();
//! let pages = with_retry(&config, "fetch_page", || async {
//!     Ok::<_, RemoteError>(vec![1, 2, 3])
//! })
//! .await?;
//! assert_eq!(pages.len(), 3);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::RemoteError;

/// Backoff policy for one remote request.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt; zero disables retrying.
    pub max_retries: u32,
    /// Wait before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single wait.
    pub max_delay: Duration,
    /// Growth factor applied to the wait after each retry.
    pub backoff_multiplier: f64,
    /// Stretch each wait by a random 0-25%.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Default settings with a custom retry count.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// No retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Settings for a rate-limited HTTP API.
    ///
    /// The first retry waits longer than the API's one-request-per-second
    /// budget so a throttled request is not immediately throttled again.
    pub fn for_remote() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1_500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Retries after the first attempt.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Wait before the first retry.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Cap on a single wait.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Growth factor between waits.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Toggle random stretching of waits.
    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Delay before retry number `attempt` (zero-based).
    fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = (self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent))
            .min(self.max_delay.as_secs_f64());

        if self.jitter {
            // Up to 25% extra so concurrent clients spread out
            Duration::from_secs_f64(secs * rand::rng().random_range(1.0..=1.25))
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Run a remote operation, retrying transient failures.
///
/// Returns the first success, the first non-transient error, or the last
/// transient error once retries are exhausted.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, RemoteError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut retry = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if retry > 0 {
                    debug!(operation = operation_name, retries = retry, "Request recovered");
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && retry < config.max_retries => {
                let wait = config.backoff(retry);
                retry += 1;
                warn!(
                    operation = operation_name,
                    attempt = retry,
                    of = config.max_retries + 1,
                    error = %e,
                    "Transient remote failure, retrying in {:?}",
                    wait
                );
                sleep(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter(max_retries: u32) -> RetryConfig {
        RetryConfig::new(max_retries)
            .initial_delay(Duration::from_millis(1))
            .jitter(false)
    }

    #[test]
    fn test_retry_config_presets() {
        assert_eq!(RetryConfig::default().max_retries, 3);
        assert_eq!(RetryConfig::none().max_retries, 0);
        assert!(RetryConfig::for_remote().initial_delay > Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_grows_then_caps() {
        let config = RetryConfig::new(5)
            .initial_delay(Duration::from_millis(250))
            .max_delay(Duration::from_millis(800))
            .jitter(false);

        let waits: Vec<Duration> = (0..4).map(|retry| config.backoff(retry)).collect();
        assert_eq!(
            waits,
            [250, 500, 800, 800].map(Duration::from_millis).to_vec()
        );
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = RetryConfig::new(1).initial_delay(Duration::from_secs(1));
        for _ in 0..20 {
            let delay = config.backoff(0);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1_250));
        }
    }

    #[tokio::test]
    async fn test_first_attempt_succeeds() {
        let result = with_retry(&no_jitter(3), "test", || async {
            Ok::<_, RemoteError>(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_recovers_after_throttling() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = with_retry(&no_jitter(3), "test", || {
            let calls = Arc::clone(&counter);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RemoteError::RateLimited)
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<i32, _> = with_retry(&no_jitter(2), "test", || {
            let calls = Arc::clone(&counter);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::Status {
                    status: 503,
                    message: "unavailable".to_string(),
                })
            }
        })
        .await;

        assert!(matches!(
            result,
            Err(RemoteError::Status { status: 503, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<i32, _> = with_retry(&no_jitter(3), "test", || {
            let calls = Arc::clone(&counter);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::Status {
                    status: 401,
                    message: "bad key".to_string(),
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_between_attempts() {
        let config = RetryConfig::new(2)
            .initial_delay(Duration::from_secs(1))
            .jitter(false);

        let started = tokio::time::Instant::now();
        let result: Result<(), _> = with_retry(&config, "test", || async {
            Err(RemoteError::RateLimited)
        })
        .await;

        assert!(result.is_err());
        // 1s + 2s
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }
}
