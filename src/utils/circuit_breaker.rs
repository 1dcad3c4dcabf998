use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

// ============================================================================
// Circuit Breaker
// ============================================================================
//
// Guards the publish path. While the broker keeps failing, publishes fail
// fast instead of each waiting out its own timeout.
//
// States:
// - Closed: Normal operation, requests pass through
// - Open: Too many failures, requests blocked immediately
// - HalfOpen: Testing if the broker recovered, requests allowed
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding: 0 closed, 1 half-open, 2 open
    pub fn as_gauge(self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

type TransitionObserver = Arc<dyn Fn(CircuitState) + Send + Sync>;

#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    state: Arc<Mutex<CircuitBreakerState>>,
    config: CircuitBreakerConfig,
    observer: Option<TransitionObserver>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening circuit
    pub failure_threshold: u32,
    /// Time to wait before attempting recovery
    pub timeout: Duration,
    /// Number of successes needed to close circuit from half-open
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 3,
        }
    }
}

struct CircuitBreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(CircuitBreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
            })),
            config,
            observer: None,
        }
    }

    /// Called with the new state on every transition
    pub fn with_observer(mut self, observer: impl Fn(CircuitState) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Execute an operation with circuit breaker protection
    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        {
            let mut state = self.state.lock().await;

            if state.state == CircuitState::Open {
                let recovered = state
                    .last_failure_time
                    .map_or(true, |last_failure| last_failure.elapsed() >= self.config.timeout);

                if !recovered {
                    return Err(CircuitBreakerError::CircuitOpen);
                }
                state.success_count = 0;
                self.transition(&mut state, CircuitState::HalfOpen);
            }
        }

        match operation.await {
            Ok(result) => {
                self.record_success().await;
                Ok(result)
            }
            Err(err) => {
                self.record_failure().await;
                Err(CircuitBreakerError::OperationFailed(err))
            }
        }
    }

    fn transition(&self, state: &mut CircuitBreakerState, next: CircuitState) {
        if state.state == next {
            return;
        }
        match next {
            CircuitState::Open => tracing::warn!(
                breaker = %self.name,
                failures = state.failure_count,
                "🔴 Circuit breaker opened"
            ),
            CircuitState::HalfOpen => tracing::info!(breaker = %self.name, "Circuit breaker half-open"),
            CircuitState::Closed => tracing::info!(breaker = %self.name, "🟢 Circuit breaker closed"),
        }
        state.state = next;
        if let Some(observer) = &self.observer {
            observer(next);
        }
    }

    async fn record_success(&self) {
        let mut state = self.state.lock().await;

        match state.state {
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.last_failure_time = None;
                    self.transition(&mut state, CircuitState::Closed);
                }
            }
            CircuitState::Closed => state.failure_count = 0,
            // A call admitted before another one opened the circuit
            CircuitState::Open => {}
        }
    }

    async fn record_failure(&self) {
        let mut state = self.state.lock().await;

        state.failure_count += 1;
        state.last_failure_time = Some(Instant::now());

        match state.state {
            CircuitState::Closed if state.failure_count >= self.config.failure_threshold => {
                self.transition(&mut state, CircuitState::Open);
            }
            CircuitState::HalfOpen => {
                state.success_count = 0;
                self.transition(&mut state, CircuitState::Open);
            }
            _ => {}
        }
    }

    pub async fn get_state(&self) -> CircuitState {
        self.state.lock().await.state
    }
}

#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    CircuitOpen,
    OperationFailed(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::CircuitOpen => write!(f, "Circuit breaker is open"),
            CircuitBreakerError::OperationFailed(e) => write!(f, "Operation failed: {}", e),
        }
    }
}

impl<E: std::error::Error> std::error::Error for CircuitBreakerError<E> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn breaker(failure_threshold: u32, timeout: Duration, success_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold,
                timeout,
                success_threshold,
            },
        )
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_after_failures() {
        let cb = breaker(3, Duration::from_secs(1), 2);

        for _ in 0..3 {
            let result = cb.call(async { Err::<(), _>("error") }).await;
            assert!(result.is_err());
        }

        assert_eq!(cb.get_state().await, CircuitState::Open);

        let result = cb.call(async { Ok::<_, &str>(()) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_half_open_after_timeout() {
        let cb = breaker(2, Duration::from_millis(100), 1);

        for _ in 0..2 {
            let _ = cb.call(async { Err::<(), _>("error") }).await;
        }
        assert_eq!(cb.get_state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;

        let result = cb.call(async { Ok::<_, &str>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(cb.get_state().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_every_transition() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let cb = breaker(1, Duration::from_millis(100), 1)
            .with_observer(move |state| sink.lock().unwrap().push(state));

        let _ = cb.call(async { Err::<(), _>("error") }).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        let _ = cb.call(async { Err::<(), _>("still down") }).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        let _ = cb.call(async { Ok::<_, &str>(()) }).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                CircuitState::Open,
                CircuitState::HalfOpen,
                CircuitState::Open,
                CircuitState::HalfOpen,
                CircuitState::Closed,
            ]
        );
    }
}
