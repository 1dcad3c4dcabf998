use std::time::Duration;
use tokio::time::sleep;

// ============================================================================
// Retry Strategies
// ============================================================================
//
// Retry loops for operations that may fail transiently, such as reaching a
// broker that is still starting up.
//
// - multiplier > 1.0 gives exponential backoff capped at max_delay
// - multiplier = 1.0 gives a fixed interval (the startup budget)
//
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor applied to the delay after each failure
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Same delay between every attempt
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: interval,
            max_delay: interval,
            multiplier: 1.0,
        }
    }

    /// Budget for reaching a broker at startup: 120 attempts, 250ms apart
    pub fn startup() -> Self {
        Self::fixed(120, Duration::from_millis(250))
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_millis(((delay.as_millis() as f64) * self.multiplier) as u64)
            .min(self.max_delay)
    }
}

/// Result of a retry operation
#[derive(Debug)]
pub enum RetryResult<T, E> {
    Success(T),
    /// Every attempt failed; carries the last error
    Failed(E),
    /// An error that retrying cannot fix
    PermanentFailure(E),
}

/// Check if an error is transient (should retry) or permanent (should not retry)
pub trait IsTransient {
    fn is_transient(&self) -> bool;
}

/// Retry every error until the attempts run out
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation_name: &str,
    config: RetryConfig,
    operation: F,
) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    run(operation_name, config, operation, |_| true).await
}

/// Retry transient errors; give up at once on a permanent one
pub async fn retry_on_transient<F, Fut, T, E>(
    operation_name: &str,
    config: RetryConfig,
    operation: F,
) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + IsTransient,
{
    run(operation_name, config, operation, |e: &E| e.is_transient()).await
}

async fn run<F, Fut, T, E, C>(
    operation_name: &str,
    config: RetryConfig,
    mut operation: F,
    retryable: C,
) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    C: Fn(&E) -> bool,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(
                        operation = operation_name,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return RetryResult::Success(result);
            }
            Err(error) => {
                if !retryable(&error) {
                    tracing::error!(
                        operation = operation_name,
                        error = %error,
                        "Permanent failure detected, not retrying"
                    );
                    return RetryResult::PermanentFailure(error);
                }

                if attempt >= config.max_attempts {
                    tracing::error!(
                        operation = operation_name,
                        attempt = attempt,
                        error = %error,
                        "Operation failed after all retries"
                    );
                    return RetryResult::Failed(error);
                }

                tracing::warn!(
                    operation = operation_name,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "Attempt failed, retrying after delay"
                );

                sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError {
        transient: bool,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "transient={}", self.transient)
        }
    }

    impl IsTransient for TestError {
        fn is_transient(&self) -> bool {
            self.transient
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_eventually() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
        };

        let result = retry_with_backoff("flaky", config, |_attempt| {
            let counter = counter_clone.clone();
            async move {
                let count = counter.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err("temporary failure")
                } else {
                    Ok("success")
                }
            }
        })
        .await;

        assert!(matches!(result, RetryResult::Success("success")));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_fails_after_max_attempts() {
        let config = RetryConfig::fixed(2, Duration::from_millis(10));

        let result = retry_with_backoff("broken", config, |_attempt| async {
            Err::<(), _>("persistent failure")
        })
        .await;

        assert!(matches!(result, RetryResult::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_budget_is_fixed_interval() {
        let config = RetryConfig::startup();
        assert_eq!(config.max_attempts, 120);
        assert_eq!(config.next_delay(config.initial_delay), Duration::from_millis(250));

        let started = tokio::time::Instant::now();
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();

        let result = retry_on_transient("broker", config, |_attempt| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TestError { transient: true }) }
        })
        .await;

        assert!(matches!(result, RetryResult::Failed(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 120);
        // 119 sleeps between 120 attempts
        assert_eq!(started.elapsed(), Duration::from_millis(250 * 119));
    }

    #[tokio::test]
    async fn test_permanent_error_stops_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();

        let result = retry_on_transient("broker", RetryConfig::startup(), |_attempt| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TestError { transient: false }) }
        })
        .await;

        assert!(matches!(result, RetryResult::PermanentFailure(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig::default();
        assert_eq!(config.next_delay(Duration::from_millis(100)), Duration::from_millis(200));
        assert_eq!(config.next_delay(Duration::from_secs(8)), Duration::from_secs(10));
    }
}
