use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::models::{DomainEvent, StarAdded};

// ============================================================================
// Event Processors
// ============================================================================
//
// The transport delivers at least once, so a processor can see the same
// event more than once. Processors must either be naturally idempotent or be
// wrapped in IdempotentProcessor, which records handled events by their
// idempotency key and skips repeats.
//
// ============================================================================

#[async_trait]
pub trait EventProcessor: Send + Sync {
    fn name(&self) -> &str;

    /// Handle one delivery. An error leaves the message for redelivery.
    async fn process(&self, event: &StarAdded) -> anyhow::Result<()>;
}

#[async_trait]
impl<P: EventProcessor + ?Sized> EventProcessor for Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn process(&self, event: &StarAdded) -> anyhow::Result<()> {
        (**self).process(event).await
    }
}

/// Sends the "your game got a star" email (simulated)
pub struct EmailNotifier {
    send_delay: Duration,
}

impl Default for EmailNotifier {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl EmailNotifier {
    pub fn new(send_delay: Duration) -> Self {
        Self { send_delay }
    }
}

#[async_trait]
impl EventProcessor for EmailNotifier {
    fn name(&self) -> &str {
        "email_notifier"
    }

    async fn process(&self, event: &StarAdded) -> anyhow::Result<()> {
        tracing::info!(
            game_id = event.id,
            stars = event.star_count,
            "📧 Processing email notification"
        );

        tokio::time::sleep(self.send_delay).await;

        tracing::info!(
            game_id = event.id,
            title = %event.title,
            "✅ Email sent successfully for game: {}",
            event.title
        );
        Ok(())
    }
}

/// Prepares the physical reward for a starred game (simulated). Reads its own
/// bound queue, so it sees every event the email notifier sees.
pub struct FulfilmentProcessor {
    work_delay: Duration,
}

impl Default for FulfilmentProcessor {
    fn default() -> Self {
        Self::new(Duration::from_millis(150))
    }
}

impl FulfilmentProcessor {
    pub fn new(work_delay: Duration) -> Self {
        Self { work_delay }
    }
}

#[async_trait]
impl EventProcessor for FulfilmentProcessor {
    fn name(&self) -> &str {
        "fulfilment"
    }

    async fn process(&self, event: &StarAdded) -> anyhow::Result<()> {
        tracing::info!(
            game_id = event.id,
            stars = event.star_count,
            "📦 Processing fulfillment"
        );

        tokio::time::sleep(self.work_delay).await;

        tracing::info!(game_id = event.id, "✅ Fulfillment processed");
        Ok(())
    }
}

// ============================================================================
// Processed-event stores
// ============================================================================

#[async_trait]
pub trait ProcessedStore: Send + Sync {
    async fn is_processed(&self, key: &str, processor: &str) -> anyhow::Result<bool>;

    async fn mark_processed(&self, key: &str, event_type: &str, processor: &str) -> anyhow::Result<()>;
}

/// Per-process memory of handled events; forgotten on restart
#[derive(Clone, Default)]
pub struct InMemoryProcessedStore {
    keys: Arc<Mutex<HashSet<(String, String)>>>,
}

impl InMemoryProcessedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.lock().map(|keys| keys.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ProcessedStore for InMemoryProcessedStore {
    async fn is_processed(&self, key: &str, processor: &str) -> anyhow::Result<bool> {
        let keys = self
            .keys
            .lock()
            .map_err(|_| anyhow::anyhow!("processed-key set lock poisoned"))?;
        Ok(keys.contains(&(key.to_string(), processor.to_string())))
    }

    async fn mark_processed(&self, key: &str, _event_type: &str, processor: &str) -> anyhow::Result<()> {
        self.keys
            .lock()
            .map_err(|_| anyhow::anyhow!("processed-key set lock poisoned"))?
            .insert((key.to_string(), processor.to_string()));
        Ok(())
    }
}

/// Handled events in the `processed_events` table, shared by every worker
#[derive(Clone)]
pub struct PgProcessedStore {
    pool: PgPool,
}

impl PgProcessedStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processed_events (
                idempotency_key TEXT NOT NULL,
                processor TEXT NOT NULL,
                event_type TEXT NOT NULL,
                processed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (idempotency_key, processor)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ProcessedStore for PgProcessedStore {
    async fn is_processed(&self, key: &str, processor: &str) -> anyhow::Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM processed_events WHERE idempotency_key = $1 AND processor = $2)",
        )
        .bind(key)
        .bind(processor)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn mark_processed(&self, key: &str, event_type: &str, processor: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_events (idempotency_key, processor, event_type)
            VALUES ($1, $2, $3)
            ON CONFLICT (idempotency_key, processor) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(processor)
        .bind(event_type)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Skips events whose idempotency key was already handled by `inner`
pub struct IdempotentProcessor<P> {
    inner: P,
    store: Arc<dyn ProcessedStore>,
}

impl<P: EventProcessor> IdempotentProcessor<P> {
    pub fn new(inner: P, store: Arc<dyn ProcessedStore>) -> Self {
        Self { inner, store }
    }
}

#[async_trait]
impl<P: EventProcessor> EventProcessor for IdempotentProcessor<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn process(&self, event: &StarAdded) -> anyhow::Result<()> {
        let key = event.idempotency_key();
        let processor = self.inner.name();

        if self.store.is_processed(&key, processor).await? {
            tracing::info!(
                idempotency_key = %key,
                processor = processor,
                "⏭️ Event already processed, skipping"
            );
            return Ok(());
        }

        self.inner.process(event).await?;

        // The side effect already happened; failing here would only repeat it
        if let Err(e) = self
            .store
            .mark_processed(&key, event.event_type(), processor)
            .await
        {
            tracing::warn!(
                idempotency_key = %key,
                error = %e,
                "Failed to record processed event"
            );
        }
        Ok(())
    }
}
