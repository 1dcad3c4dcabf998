use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::messaging::{MessageEnvelope, Substrate};

// ============================================================================
// Dead Letters
// ============================================================================
//
// Messages the consumer loop gives up on:
// - Malformed: the payload does not parse; retrying cannot help
// - MaxDeliveriesExceeded: processing kept failing across redeliveries
// - NoRedelivery: processing failed on a substrate that cannot redeliver;
//   recorded here instead of vanishing
//
// Sinks keep the raw payload so an operator can inspect or replay it.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeadLetterReason {
    Malformed,
    MaxDeliveriesExceeded,
    NoRedelivery,
}

impl DeadLetterReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DeadLetterReason::Malformed => "malformed",
            DeadLetterReason::MaxDeliveriesExceeded => "max_deliveries_exceeded",
            DeadLetterReason::NoRedelivery => "no_redelivery",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeadLetterReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "malformed" => Ok(DeadLetterReason::Malformed),
            "max_deliveries_exceeded" => Ok(DeadLetterReason::MaxDeliveriesExceeded),
            "no_redelivery" => Ok(DeadLetterReason::NoRedelivery),
            other => Err(anyhow::anyhow!("unknown dead-letter reason '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: Uuid,
    pub substrate: Substrate,
    pub delivery_tag: String,
    pub reason: DeadLetterReason,
    pub error_message: String,
    pub payload: Vec<u8>,
    pub delivery_count: Option<u32>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn from_envelope(
        substrate: Substrate,
        envelope: &MessageEnvelope,
        reason: DeadLetterReason,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            substrate,
            delivery_tag: envelope.tag.to_string(),
            reason,
            error_message: error_message.into(),
            payload: envelope.payload.clone(),
            delivery_count: envelope.delivery_count,
            dead_lettered_at: Utc::now(),
        }
    }

    /// Payload as text for logs; lossy on invalid UTF-8
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn store(&self, letter: &DeadLetter) -> anyhow::Result<()>;
}

/// Records dead letters in the log only
pub struct LogDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LogDeadLetterSink {
    async fn store(&self, letter: &DeadLetter) -> anyhow::Result<()> {
        tracing::error!(
            dead_letter_id = %letter.id,
            substrate = %letter.substrate,
            tag = %letter.delivery_tag,
            reason = %letter.reason,
            delivery_count = ?letter.delivery_count,
            error = %letter.error_message,
            payload = %letter.payload_text(),
            "💀 Dead-lettered message"
        );
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryDeadLetterSink {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().map(|letters| letters.clone()).unwrap_or_default()
    }

    /// Make every store fail, as if the backing store were down
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn store(&self, letter: &DeadLetter) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("dead-letter store unavailable");
        }
        self.letters
            .lock()
            .map_err(|_| anyhow::anyhow!("dead-letter list lock poisoned"))?
            .push(letter.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DlqStats {
    pub total_messages: i64,
    pub by_reason: HashMap<String, i64>,
}

/// Dead letters in the `dead_letters` table
#[derive(Clone)]
pub struct PgDeadLetterSink {
    pool: PgPool,
}

impl PgDeadLetterSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dead_letters (
                id UUID PRIMARY KEY,
                substrate TEXT NOT NULL,
                delivery_tag TEXT NOT NULL,
                reason TEXT NOT NULL,
                error_message TEXT NOT NULL,
                payload BYTEA NOT NULL,
                delivery_count INTEGER,
                dead_lettered_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent first
    pub async fn list(&self, limit: i64) -> anyhow::Result<Vec<DeadLetter>> {
        let rows: Vec<(Uuid, String, String, String, String, Vec<u8>, Option<i32>, DateTime<Utc>)> =
            sqlx::query_as(
                r#"
                SELECT id, substrate, delivery_tag, reason, error_message,
                       payload, delivery_count, dead_lettered_at
                FROM dead_letters
                ORDER BY dead_lettered_at DESC
                LIMIT $1
                "#,
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(
                |(id, substrate, delivery_tag, reason, error_message, payload, delivery_count, dead_lettered_at)|
                 -> anyhow::Result<DeadLetter> {
                    Ok(DeadLetter {
                        id,
                        substrate: substrate.parse()?,
                        delivery_tag,
                        reason: reason.parse()?,
                        error_message,
                        payload,
                        delivery_count: delivery_count.map(|count| count.max(0) as u32),
                        dead_lettered_at,
                    })
                },
            )
            .collect()
    }

    pub async fn stats(&self) -> anyhow::Result<DlqStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT reason, COUNT(*) FROM dead_letters GROUP BY reason")
                .fetch_all(&self.pool)
                .await?;

        Ok(DlqStats {
            total_messages: rows.iter().map(|(_, count)| count).sum(),
            by_reason: rows.into_iter().collect(),
        })
    }
}

#[async_trait]
impl DeadLetterSink for PgDeadLetterSink {
    async fn store(&self, letter: &DeadLetter) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dead_letters (
                id, substrate, delivery_tag, reason, error_message,
                payload, delivery_count, dead_lettered_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(letter.id)
        .bind(letter.substrate.as_str())
        .bind(&letter.delivery_tag)
        .bind(letter.reason.as_str())
        .bind(&letter.error_message)
        .bind(&letter.payload)
        .bind(letter.delivery_count.map(|count| count as i32))
        .bind(letter.dead_lettered_at)
        .execute(&self.pool)
        .await?;

        tracing::warn!(
            dead_letter_id = %letter.id,
            reason = %letter.reason,
            tag = %letter.delivery_tag,
            "💀 Stored dead letter"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::DeliveryTag;

    fn envelope() -> MessageEnvelope {
        MessageEnvelope::new(DeliveryTag::Table { msg_id: 42 }, b"not json".to_vec())
            .with_delivery_count(3)
    }

    #[test]
    fn test_dead_letter_keeps_delivery_metadata() {
        let letter = DeadLetter::from_envelope(
            Substrate::PollingTable,
            &envelope(),
            DeadLetterReason::Malformed,
            "expected value at line 1",
        );

        assert_eq!(letter.delivery_tag, "table:42");
        assert_eq!(letter.delivery_count, Some(3));
        assert_eq!(letter.payload_text(), "not json");
        assert_eq!(letter.id.get_version_num(), 7);
    }

    #[test]
    fn test_reason_round_trips_through_its_column_value() {
        for reason in [
            DeadLetterReason::Malformed,
            DeadLetterReason::MaxDeliveriesExceeded,
            DeadLetterReason::NoRedelivery,
        ] {
            assert_eq!(reason.as_str().parse::<DeadLetterReason>().unwrap(), reason);
        }
        assert!("exploded".parse::<DeadLetterReason>().is_err());
    }

    #[tokio::test]
    async fn test_in_memory_sink_records_and_can_fail() {
        let sink = InMemoryDeadLetterSink::new();
        let letter = DeadLetter::from_envelope(
            Substrate::PushPull,
            &envelope(),
            DeadLetterReason::NoRedelivery,
            "processor failed",
        );

        sink.store(&letter).await.unwrap();
        sink.set_failing(true);
        assert!(sink.store(&letter).await.is_err());

        let letters = sink.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, DeadLetterReason::NoRedelivery);
    }

    #[tokio::test]
    async fn test_log_sink_never_fails() {
        let letter = DeadLetter::from_envelope(
            Substrate::Broadcast,
            &envelope(),
            DeadLetterReason::MaxDeliveriesExceeded,
            "smtp down",
        );
        assert!(LogDeadLetterSink.store(&letter).await.is_ok());
    }
}
