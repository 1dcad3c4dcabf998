use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::health::{ComponentHealth, HealthRegistry, HealthStatus};
use crate::messaging::{EventSink, SendGuarantee, Substrate, TransportError};
use crate::metrics::Metrics;
use crate::models::{DomainEvent, StarAdded};
use crate::utils::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};

// ============================================================================
// Publisher
// ============================================================================
//
// Called by the write path after its own commit. Publishing is a best-effort
// notification: a failure is logged and reported, and never undoes the write
// that triggered it. There is no outbox, so an event whose publish fails is
// not retried later.
//
// Every send runs through a circuit breaker and a timeout.
//
// ============================================================================

const COMPONENT: &str = "publisher";

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub timeout: Duration,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublishAck {
    pub substrate: Substrate,
    /// `LocalSendOnly` on the push/pull socket: the message may still be lost
    pub guarantee: SendGuarantee,
    pub message_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0} transport is failing, publish rejected by circuit breaker")]
    CircuitOpen(Substrate),

    #[error(transparent)]
    Transport(TransportError),
}

impl PublishError {
    fn outcome(&self) -> &'static str {
        match self {
            PublishError::Serialize(_) => "serialize_error",
            PublishError::Timeout(_) => "timeout",
            PublishError::CircuitOpen(_) => "circuit_open",
            PublishError::Transport(_) => "failed",
        }
    }
}

pub struct Publisher {
    sink: Arc<dyn EventSink>,
    config: PublisherConfig,
    breaker: CircuitBreaker,
    metrics: Option<Arc<Metrics>>,
    health: Option<Arc<HealthRegistry>>,
}

impl Publisher {
    pub fn new(sink: Arc<dyn EventSink>, config: PublisherConfig) -> Self {
        let breaker = CircuitBreaker::new(
            format!("publish-{}", sink.substrate()),
            config.circuit_breaker.clone(),
        );
        Self {
            sink,
            config,
            breaker,
            metrics: None,
            health: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        let gauge = metrics.clone();
        self.breaker = self
            .breaker
            .with_observer(move |state| gauge.update_circuit_breaker_state(state));
        self.metrics = Some(metrics);
        self
    }

    pub fn with_health(mut self, health: Arc<HealthRegistry>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn substrate(&self) -> Substrate {
        self.sink.substrate()
    }

    pub async fn circuit_state(&self) -> CircuitState {
        self.breaker.get_state().await
    }

    /// Serialize and send one event, keyed by game id
    pub async fn publish(&self, event: &StarAdded) -> Result<PublishAck, PublishError> {
        let substrate = self.substrate();
        let started = Instant::now();

        let result = self.send(event).await;
        let elapsed = started.elapsed().as_secs_f64();

        match &result {
            Ok(ack) => {
                tracing::info!(
                    substrate = %substrate,
                    game_id = event.id,
                    stars = event.star_count,
                    guarantee = ?ack.guarantee,
                    message_id = ?ack.message_id,
                    "📤 Published {}",
                    event.event_type()
                );
                self.observe("ok", elapsed, HealthStatus::Healthy);
            }
            Err(e) => {
                tracing::error!(
                    substrate = %substrate,
                    game_id = event.id,
                    error = %e,
                    "❌ Failed to publish {}",
                    event.event_type()
                );
                let status = match e {
                    PublishError::CircuitOpen(_) => HealthStatus::Unhealthy(e.to_string()),
                    _ => HealthStatus::Degraded(e.to_string()),
                };
                self.observe(e.outcome(), elapsed, status);
            }
        }
        result
    }

    /// Publish for callers that must not fail: errors are logged and dropped
    pub async fn notify(&self, event: &StarAdded) -> Option<PublishAck> {
        match self.publish(event).await {
            Ok(ack) => Some(ack),
            Err(e) => {
                tracing::warn!(
                    game_id = event.id,
                    error = %e,
                    "Event notification dropped, write already committed"
                );
                None
            }
        }
    }

    async fn send(&self, event: &StarAdded) -> Result<PublishAck, PublishError> {
        let payload = event.to_payload()?;
        let key = event.aggregate_id().to_string();
        let timeout = self.config.timeout;

        let sent = self
            .breaker
            .call(async {
                match tokio::time::timeout(timeout, self.sink.send(&key, &payload)).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout(timeout)),
                }
            })
            .await;

        match sent {
            Ok(receipt) => Ok(PublishAck {
                substrate: self.substrate(),
                guarantee: receipt.guarantee,
                message_id: receipt.message_id,
            }),
            Err(CircuitBreakerError::CircuitOpen) => Err(PublishError::CircuitOpen(self.substrate())),
            Err(CircuitBreakerError::OperationFailed(TransportError::Timeout(after))) => {
                Err(PublishError::Timeout(after))
            }
            Err(CircuitBreakerError::OperationFailed(e)) => Err(PublishError::Transport(e)),
        }
    }

    fn observe(&self, outcome: &str, elapsed_secs: f64, status: HealthStatus) {
        if let Some(metrics) = &self.metrics {
            metrics.record_publish(self.substrate().as_str(), outcome, elapsed_secs);
        }
        if let Some(health) = &self.health {
            health.report(
                ComponentHealth::new(COMPONENT, status)
                    .with_details(format!("substrate={}", self.substrate())),
            );
        }
    }
}
