//! Backoff retries for one provider.
//!
//! The fallback chain wraps each rate-limited attempt in [`with_retry_if`]
//! before it gives up on a provider and moves to the next one.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, the first one included. Zero behaves like one.
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Random extra delay as a fraction of the computed delay (0.0..=1.0)
    pub jitter: f64,
}

impl RetryConfig {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// 3 attempts, waiting 1s then 2s (+ up to 10%), never more than 5s.
    pub fn provider_call() -> Self {
        Self::new(3, Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_jitter(0.1)
    }

    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay before retry number `retry` (1 = first retry), without jitter.
    fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let factor = self.backoff_multiplier.powi(retry.saturating_sub(1) as i32);
        let delay_ms = self.initial_delay.as_millis() as f64 * factor;
        Duration::from_millis(delay_ms.min(u64::MAX as f64) as u64).min(self.max_delay)
    }

    fn jittered_backoff(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        if delay.is_zero() || self.jitter <= 0.0 {
            return delay;
        }

        delay
            .mul_f64(1.0 + fastrand::f64() * self.jitter)
            .min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::provider_call()
    }
}

/// Run `operation` until it succeeds, `should_retry` rejects its error or the
/// attempts run out. The last error is returned.
pub async fn with_retry_if<T, E, F, Fut, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = %operation_name, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !should_retry(&error) {
            debug!(operation = %operation_name, attempt, error = %error, "Error is not retryable");
            return Err(error);
        }
        if attempt >= max_attempts {
            warn!(
                operation = %operation_name,
                attempts = max_attempts,
                error = %error,
                "All attempts failed"
            );
            return Err(error);
        }

        let delay = config.jittered_backoff(attempt);
        warn!(
            operation = %operation_name,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Attempt failed, retrying"
        );
        sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, ProviderError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Operation failing with `kind` for the first `failures` calls.
    fn flaky(
        calls: &Arc<AtomicU32>,
        failures: u32,
        kind: ErrorKind,
    ) -> impl FnMut() -> std::future::Ready<Result<u32, ProviderError>> {
        let calls = Arc::clone(calls);
        move || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(if attempt < failures {
                Err(ProviderError::new(kind, format!("failure {}", attempt + 1)))
            } else {
                Ok(attempt + 1)
            })
        }
    }

    // ==================== Backoff ====================

    #[test]
    fn test_provider_call_preset() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(2), Duration::from_secs(2));
        assert_eq!(config.max_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let config = RetryConfig::new(10, Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(350))
            .with_backoff_multiplier(3.0);

        assert_eq!(config.backoff(0), Duration::ZERO);
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(300));
        assert_eq!(config.backoff(3), Duration::from_millis(350));
        assert_eq!(config.backoff(60), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_bounds() {
        let config = RetryConfig::new(5, Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(10))
            .with_jitter(0.5);
        for _ in 0..100 {
            let delay = config.jittered_backoff(2);
            assert!(delay >= Duration::from_millis(200) && delay <= Duration::from_millis(300));
        }

        let capped = RetryConfig::new(5, Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(1))
            .with_jitter(1.0);
        for _ in 0..100 {
            assert!(capped.jittered_backoff(3) <= Duration::from_secs(1));
        }
    }

    #[test]
    fn test_jitter_is_clamped() {
        assert_eq!(RetryConfig::no_retry().with_jitter(7.0).jitter, 1.0);
        assert_eq!(RetryConfig::no_retry().with_jitter(-1.0).jitter, 0.0);
    }

    // ==================== with_retry_if ====================

    #[tokio::test]
    async fn test_transient_errors_are_retried_until_success() {
        let config = RetryConfig::new(3, Duration::from_millis(5));
        let calls = Arc::new(AtomicU32::new(0));

        let result = with_retry_if(
            &config,
            "translate",
            flaky(&calls, 2, ErrorKind::Server),
            ProviderError::is_retryable,
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_auth_errors_fail_immediately() {
        let config = RetryConfig::new(3, Duration::from_millis(5));
        let calls = Arc::new(AtomicU32::new(0));

        let err = with_retry_if(
            &config,
            "translate",
            flaky(&calls, 10, ErrorKind::Auth),
            ProviderError::is_retryable,
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Auth);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_last_error_is_returned_when_exhausted() {
        let config = RetryConfig::new(3, Duration::from_millis(5));
        let calls = Arc::new(AtomicU32::new(0));

        let err = with_retry_if(
            &config,
            "translate",
            flaky(&calls, 10, ErrorKind::RateLimit),
            ProviderError::is_retryable,
        )
        .await
        .unwrap_err();

        assert_eq!(err.message, "failure 3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let config = RetryConfig::new(0, Duration::from_millis(5));
        let calls = Arc::new(AtomicU32::new(0));

        let operation = flaky(&calls, 0, ErrorKind::Api);

        let result = with_retry_if(&config, "translate", operation, |_| true).await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backoff_sleeps_between_attempts() {
        let config = RetryConfig::new(3, Duration::from_millis(50));
        let calls = Arc::new(AtomicU32::new(0));
        let start = std::time::Instant::now();

        let operation = flaky(&calls, 10, ErrorKind::Timeout);
        let _ = with_retry_if(&config, "translate", operation, |_| true).await;

        // 50ms + 100ms
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(150), "got {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(600), "got {:?}", elapsed);
    }
}
