// Private module declaration
mod server;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};

// Re-export for public API
pub use server::start_metrics_server;

use crate::utils::CircuitState;

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Provides metrics for:
// - Publishing (outcome, latency) per substrate
// - Consumption outcomes, processing latency and redeliveries
// - Dead letters by reason
// - Bootstrap connect attempts
// - Publisher circuit breaker state
//
// All metrics are registered with Prometheus and can be scraped via /metrics
// ============================================================================

const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0];

/// Central metrics registry for the dispatcher
pub struct Metrics {
    registry: Registry,

    // Publish Metrics
    pub events_published: IntCounterVec,
    pub publish_duration: HistogramVec,

    // Consumer Metrics
    pub messages_consumed: IntCounterVec,
    pub processing_duration: HistogramVec,
    pub redeliveries: IntCounterVec,

    // DLQ Metrics
    pub dead_letters: IntCounterVec,

    // Bootstrap Metrics
    pub bootstrap_attempts: IntCounterVec,

    // Circuit Breaker Metrics
    pub circuit_breaker_state: IntGauge,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let events_published = IntCounterVec::new(
            Opts::new("events_published_total", "Events handed to the transport"),
            &["substrate", "outcome"],
        )?;
        registry.register(Box::new(events_published.clone()))?;

        let publish_duration = HistogramVec::new(
            HistogramOpts::new("publish_duration_seconds", "Time spent publishing one event")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["substrate"],
        )?;
        registry.register(Box::new(publish_duration.clone()))?;

        let messages_consumed = IntCounterVec::new(
            Opts::new("messages_consumed_total", "Deliveries handled by the consumer loop"),
            &["substrate", "outcome"],
        )?;
        registry.register(Box::new(messages_consumed.clone()))?;

        let processing_duration = HistogramVec::new(
            HistogramOpts::new("processing_duration_seconds", "Event processor latency")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["substrate"],
        )?;
        registry.register(Box::new(processing_duration.clone()))?;

        let redeliveries = IntCounterVec::new(
            Opts::new("redeliveries_total", "Deliveries received more than once"),
            &["substrate"],
        )?;
        registry.register(Box::new(redeliveries.clone()))?;

        let dead_letters = IntCounterVec::new(
            Opts::new("dead_letters_total", "Messages routed to the dead-letter sink"),
            &["reason"],
        )?;
        registry.register(Box::new(dead_letters.clone()))?;

        let bootstrap_attempts = IntCounterVec::new(
            Opts::new("bootstrap_attempts_total", "Broker connect attempts at startup"),
            &["substrate", "outcome"],
        )?;
        registry.register(Box::new(bootstrap_attempts.clone()))?;

        let circuit_breaker_state = IntGauge::new(
            "circuit_breaker_state",
            "Publisher circuit breaker state (0=Closed, 1=HalfOpen, 2=Open)",
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        Ok(Self {
            registry,
            events_published,
            publish_duration,
            messages_consumed,
            processing_duration,
            redeliveries,
            dead_letters,
            bootstrap_attempts,
            circuit_breaker_state,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_publish(&self, substrate: &str, outcome: &str, duration_secs: f64) {
        self.events_published.with_label_values(&[substrate, outcome]).inc();
        self.publish_duration.with_label_values(&[substrate]).observe(duration_secs);
    }

    pub fn record_consumed(&self, substrate: &str, outcome: &str) {
        self.messages_consumed.with_label_values(&[substrate, outcome]).inc();
    }

    pub fn record_processing(&self, substrate: &str, duration_secs: f64) {
        self.processing_duration.with_label_values(&[substrate]).observe(duration_secs);
    }

    pub fn record_redelivery(&self, substrate: &str) {
        self.redeliveries.with_label_values(&[substrate]).inc();
    }

    pub fn record_dead_letter(&self, reason: &str) {
        self.dead_letters.with_label_values(&[reason]).inc();
    }

    pub fn record_bootstrap_attempt(&self, substrate: &str, success: bool) {
        let outcome = if success { "connected" } else { "failed" };
        self.bootstrap_attempts.with_label_values(&[substrate, outcome]).inc();
    }

    pub fn update_circuit_breaker_state(&self, state: CircuitState) {
        self.circuit_breaker_state.set(state.as_gauge());
    }
}
