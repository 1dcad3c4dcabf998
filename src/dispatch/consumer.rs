use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use super::dlq::{DeadLetter, DeadLetterReason, DeadLetterSink};
use super::processor::EventProcessor;
use crate::health::{ComponentHealth, HealthRegistry, HealthStatus};
use crate::messaging::{
    Disposition, EventSource, MessageEnvelope, Substrate, TransportResult,
};
use crate::metrics::Metrics;
use crate::models::StarAdded;

// ============================================================================
// Consumer Loop
// ============================================================================
//
// pull -> deserialize -> process -> finalize, until shutdown.
//
// Per delivery:
// - payload does not parse      -> dead letter (Malformed), discard
// - processor succeeds          -> ack
// - processor fails             -> leave for redelivery
//   - delivery_count reached max_deliveries -> dead letter, discard
//   - substrate cannot redeliver            -> dead letter (NoRedelivery)
//
// Shutdown stops new pulls; a delivery already being processed is finished
// and finalized first.
//
// ============================================================================

const COMPONENT: &str = "consumer";

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub name: String,
    /// Dead-letter a message once it has been delivered this many times.
    /// 0 keeps redelivering forever.
    pub max_deliveries: u32,
    /// Pause after a transport error before pulling again
    pub error_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            name: "email-service".to_string(),
            max_deliveries: 5,
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// What one step of the loop did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing arrived within the pull window
    Idle,
    Acked,
    /// Processing failed; the substrate will deliver the message again
    Redelivering { delivery_count: Option<u32> },
    DeadLettered(DeadLetterReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub acked: u64,
    pub redelivering: u64,
    pub dead_lettered: u64,
    pub transport_errors: u64,
}

#[derive(Default)]
struct StatsCounters {
    received: AtomicU64,
    acked: AtomicU64,
    redelivering: AtomicU64,
    dead_lettered: AtomicU64,
    transport_errors: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            redelivering: self.redelivering.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }
}

pub struct ConsumerLoop {
    source: Arc<dyn EventSource>,
    processor: Arc<dyn EventProcessor>,
    dead_letters: Arc<dyn DeadLetterSink>,
    config: ConsumerConfig,
    metrics: Option<Arc<Metrics>>,
    health: Option<Arc<HealthRegistry>>,
    stats: StatsCounters,
}

impl ConsumerLoop {
    pub fn new(
        source: Arc<dyn EventSource>,
        processor: Arc<dyn EventProcessor>,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            source,
            processor,
            dead_letters,
            config,
            metrics: None,
            health: None,
            stats: StatsCounters::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_health(mut self, health: Arc<HealthRegistry>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats.snapshot()
    }

    fn substrate(&self) -> Substrate {
        self.source.substrate()
    }

    /// Pull once and handle whatever arrived
    pub async fn step(&self) -> TransportResult<StepOutcome> {
        match self.source.pull().await? {
            Some(envelope) => self.handle(envelope).await,
            None => Ok(StepOutcome::Idle),
        }
    }

    /// Run until `shutdown` turns true or its sender is dropped
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> ConsumerStats {
        tracing::info!(
            consumer = %self.config.name,
            substrate = %self.substrate(),
            max_deliveries = self.config.max_deliveries,
            "📧 Consumer loop started"
        );
        self.report_health(HealthStatus::Healthy);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pulled = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                pulled = self.source.pull() => pulled,
            };

            let result = match pulled {
                Ok(Some(envelope)) => self.handle(envelope).await.map(Some),
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            };

            match result {
                Ok(Some(_)) => self.report_health(HealthStatus::Healthy),
                Ok(None) => {}
                Err(e) => {
                    self.stats.transport_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        consumer = %self.config.name,
                        error = %e,
                        backoff_ms = self.config.error_backoff.as_millis() as u64,
                        "❌ Transport error in consumer loop"
                    );
                    self.report_health(HealthStatus::Degraded(e.to_string()));

                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        if let Err(e) = self.source.close().await {
            tracing::warn!(consumer = %self.config.name, error = %e, "Source did not close cleanly");
        }

        let stats = self.stats();
        tracing::info!(
            consumer = %self.config.name,
            received = stats.received,
            acked = stats.acked,
            dead_lettered = stats.dead_lettered,
            "📧 Consumer loop stopped"
        );
        stats
    }

    /// Process one delivery and finalize it
    pub async fn handle(&self, envelope: MessageEnvelope) -> TransportResult<StepOutcome> {
        let substrate = self.substrate();
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            substrate = %substrate,
            tag = %envelope.tag,
            delivery_count = ?envelope.delivery_count,
            "📥 Received message"
        );

        if envelope.is_redelivery() {
            tracing::info!(
                tag = %envelope.tag,
                delivery_count = ?envelope.delivery_count,
                "🔁 Redelivered message"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_redelivery(substrate.as_str());
            }
        }

        let event = match StarAdded::from_payload(&envelope.payload) {
            Ok(event) => event,
            Err(e) => return self.reject_malformed(&envelope, e.to_string()).await,
        };

        let started = Instant::now();
        let processed = self.processor.process(&event).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_processing(substrate.as_str(), started.elapsed().as_secs_f64());
        }

        match processed {
            Ok(()) => {
                self.source.ack(&envelope.tag).await?;
                self.stats.acked.fetch_add(1, Ordering::Relaxed);
                self.record_outcome("acked");

                tracing::info!(
                    game_id = event.id,
                    tag = %envelope.tag,
                    processor = self.processor.name(),
                    "✅ Message processed and acknowledged"
                );
                Ok(StepOutcome::Acked)
            }
            Err(e) => self.on_processing_failure(&envelope, &event, e).await,
        }
    }

    async fn reject_malformed(
        &self,
        envelope: &MessageEnvelope,
        error: String,
    ) -> TransportResult<StepOutcome> {
        tracing::warn!(
            tag = %envelope.tag,
            error = %error,
            "❌ Failed to parse message, dead-lettering"
        );

        let letter =
            DeadLetter::from_envelope(self.substrate(), envelope, DeadLetterReason::Malformed, error);
        // Retrying cannot fix the payload, so it goes even if the sink is down
        if let Err(e) = self.dead_letters.store(&letter).await {
            tracing::error!(
                tag = %envelope.tag,
                error = %e,
                payload = %letter.payload_text(),
                "Dead-letter sink failed, discarding malformed message"
            );
        }

        self.source.nack(&envelope.tag, Disposition::Discard).await?;
        self.dead_lettered(DeadLetterReason::Malformed);
        Ok(StepOutcome::DeadLettered(DeadLetterReason::Malformed))
    }

    async fn on_processing_failure(
        &self,
        envelope: &MessageEnvelope,
        event: &StarAdded,
        error: anyhow::Error,
    ) -> TransportResult<StepOutcome> {
        let substrate = self.substrate();

        tracing::warn!(
            game_id = event.id,
            tag = %envelope.tag,
            delivery_count = ?envelope.delivery_count,
            error = %error,
            "⚠️ Processing failed"
        );

        if !substrate.supports_redelivery() {
            let letter = DeadLetter::from_envelope(
                substrate,
                envelope,
                DeadLetterReason::NoRedelivery,
                error.to_string(),
            );
            if let Err(e) = self.dead_letters.store(&letter).await {
                tracing::error!(
                    tag = %envelope.tag,
                    error = %e,
                    payload = %letter.payload_text(),
                    "Dead-letter sink failed, message is lost"
                );
            }
            self.source.nack(&envelope.tag, Disposition::Discard).await?;
            self.dead_lettered(DeadLetterReason::NoRedelivery);
            return Ok(StepOutcome::DeadLettered(DeadLetterReason::NoRedelivery));
        }

        if self.deliveries_exhausted(envelope) {
            let letter = DeadLetter::from_envelope(
                substrate,
                envelope,
                DeadLetterReason::MaxDeliveriesExceeded,
                error.to_string(),
            );
            match self.dead_letters.store(&letter).await {
                Ok(()) => {
                    self.source.nack(&envelope.tag, Disposition::Discard).await?;
                    self.dead_lettered(DeadLetterReason::MaxDeliveriesExceeded);
                    return Ok(StepOutcome::DeadLettered(DeadLetterReason::MaxDeliveriesExceeded));
                }
                // Keep the message on the substrate rather than lose it
                Err(e) => tracing::error!(
                    tag = %envelope.tag,
                    error = %e,
                    "Dead-letter sink failed, leaving message for redelivery"
                ),
            }
        }

        self.source.nack(&envelope.tag, Disposition::Redeliver).await?;
        self.stats.redelivering.fetch_add(1, Ordering::Relaxed);
        self.record_outcome("redelivering");
        Ok(StepOutcome::Redelivering {
            delivery_count: envelope.delivery_count,
        })
    }

    fn deliveries_exhausted(&self, envelope: &MessageEnvelope) -> bool {
        self.config.max_deliveries > 0
            && envelope
                .delivery_count
                .is_some_and(|count| count >= self.config.max_deliveries)
    }

    fn dead_lettered(&self, reason: DeadLetterReason) {
        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.record_outcome("dead_lettered");
        if let Some(metrics) = &self.metrics {
            metrics.record_dead_letter(reason.as_str());
        }
    }

    fn record_outcome(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_consumed(self.substrate().as_str(), outcome);
        }
    }

    fn report_health(&self, status: HealthStatus) {
        if let Some(health) = &self.health {
            health.report(
                ComponentHealth::new(COMPONENT, status)
                    .with_details(format!("substrate={}", self.substrate())),
            );
        }
    }
}
