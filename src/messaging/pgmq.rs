use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use super::{
    DeliveryTag, Disposition, EventSink, EventSource, MessageEnvelope, Position, SendReceipt,
    Substrate, TopologyDescriptor, TransportError, TransportResult,
};

// ============================================================================
// Polling table on PostgreSQL + pgmq
// ============================================================================
//
// - pgmq.send inserts a row; the queue table is the durable store
// - pgmq.read leases one row for the visibility timeout and bumps read_ct
// - pgmq.archive moves a processed row to the archive table
// - pgmq.delete drops a row without keeping it
// - a row that is neither archived nor deleted becomes readable again once
//   its lease ends
//
// ============================================================================

#[derive(Debug, Clone)]
pub struct PgmqSettings {
    pub database_url: String,
    pub queue: String,
    pub visibility_timeout: Duration,
    /// Sleep between reads of an empty queue
    pub poll_interval: Duration,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// When set, a redelivery nack makes the row visible again after this
    /// delay instead of at the end of its lease
    pub retry_delay: Option<Duration>,
}

impl PgmqSettings {
    pub fn new(database_url: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            queue: queue.into(),
            visibility_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(3),
            retry_delay: None,
        }
    }

    pub fn topology(&self) -> TopologyDescriptor {
        TopologyDescriptor::new(Substrate::PollingTable, &self.queue)
    }
}

/// Hide the password of a connection URL before it is logged
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((credentials, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };
    match credentials.split_once(':') {
        Some((user, _password)) => format!("{}://{}:***@{}", scheme, user, host),
        None => url.to_string(),
    }
}

#[derive(Clone)]
pub struct PgmqQueue {
    pool: PgPool,
    settings: Arc<PgmqSettings>,
    provisioned: Arc<OnceCell<()>>,
}

impl PgmqQueue {
    pub async fn connect(settings: PgmqSettings) -> TransportResult<Self> {
        let endpoint = redact_url(&settings.database_url);

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect(&settings.database_url)
            .await
            .map_err(|e| match e {
                sqlx::Error::Configuration(reason) => TransportError::InvalidEndpoint {
                    endpoint: endpoint.clone(),
                    reason: reason.to_string(),
                },
                other => TransportError::Connection(other.to_string()),
            })?;

        tracing::info!(database = %endpoint, queue = %settings.queue, "Connected to PostgreSQL");

        Ok(Self {
            pool,
            settings: Arc::new(settings),
            provisioned: Arc::new(OnceCell::new()),
        })
    }

    /// The pool is shared with the Postgres-backed stores
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn provision(&self, topology: &TopologyDescriptor) -> TransportResult<()> {
        self.provisioned
            .get_or_try_init(|| async {
                sqlx::query("CREATE EXTENSION IF NOT EXISTS pgmq")
                    .execute(&self.pool)
                    .await
                    .map_err(|e| TransportError::Topology(format!("pgmq extension: {}", e)))?;

                sqlx::query("SELECT pgmq.create($1)")
                    .bind(&topology.target)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| {
                        TransportError::Topology(format!("creating queue {}: {}", topology.target, e))
                    })?;

                tracing::info!(queue = %topology.target, "Queue ready");
                Ok(())
            })
            .await?;
        Ok(())
    }

    fn msg_id(tag: &DeliveryTag) -> TransportResult<i64> {
        match tag {
            DeliveryTag::Table { msg_id } => Ok(*msg_id),
            other => Err(TransportError::ForeignTag(other.clone())),
        }
    }

    async fn read_one(&self) -> TransportResult<Option<MessageEnvelope>> {
        let row: Option<(i64, i32, DateTime<Utc>, DateTime<Utc>, String)> = sqlx::query_as(
            "SELECT msg_id, read_ct, enqueued_at, vt, message::text FROM pgmq.read($1, $2, 1)",
        )
        .bind(&self.settings.queue)
        .bind(vt_seconds(self.settings.visibility_timeout)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TransportError::Receive(e.to_string()))?;

        Ok(row.map(|(msg_id, read_ct, enqueued_at, vt, message)| {
            MessageEnvelope::new(DeliveryTag::Table { msg_id }, message.into_bytes())
                .with_delivery_count(read_ct.max(0) as u32)
                .with_enqueued_at(enqueued_at)
                .with_position(Position::VisibilityDeadline(vt))
        }))
    }
}

#[async_trait]
impl EventSink for PgmqQueue {
    fn substrate(&self) -> Substrate {
        Substrate::PollingTable
    }

    async fn send(&self, _key: &str, payload: &[u8]) -> TransportResult<SendReceipt> {
        let message = std::str::from_utf8(payload)
            .map_err(|e| TransportError::Publish(format!("payload is not UTF-8: {}", e)))?;

        let msg_id: i64 = sqlx::query_scalar("SELECT pgmq.send($1, $2::jsonb)")
            .bind(&self.settings.queue)
            .bind(message)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;

        Ok(SendReceipt::accepted(msg_id.to_string()))
    }
}

#[async_trait]
impl EventSource for PgmqQueue {
    fn substrate(&self) -> Substrate {
        Substrate::PollingTable
    }

    async fn pull(&self) -> TransportResult<Option<MessageEnvelope>> {
        if let Some(envelope) = self.read_one().await? {
            return Ok(Some(envelope));
        }
        tokio::time::sleep(self.settings.poll_interval).await;
        Ok(None)
    }

    async fn ack(&self, tag: &DeliveryTag) -> TransportResult<()> {
        let msg_id = Self::msg_id(tag)?;
        let archived: bool = sqlx::query_scalar("SELECT pgmq.archive($1::text, $2::bigint)")
            .bind(&self.settings.queue)
            .bind(msg_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| TransportError::Finalize(e.to_string()))?;

        if !archived {
            tracing::debug!(msg_id, "Message already archived");
        }
        Ok(())
    }

    async fn nack(&self, tag: &DeliveryTag, disposition: Disposition) -> TransportResult<()> {
        let msg_id = Self::msg_id(tag)?;
        match disposition {
            Disposition::Discard => {
                let deleted: bool = sqlx::query_scalar("SELECT pgmq.delete($1::text, $2::bigint)")
                    .bind(&self.settings.queue)
                    .bind(msg_id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| TransportError::Finalize(e.to_string()))?;

                if !deleted {
                    tracing::debug!(msg_id, "Message already removed");
                }
                Ok(())
            }
            Disposition::Redeliver => {
                // Without a retry delay the lease simply runs out
                let Some(delay) = self.settings.retry_delay else {
                    return Ok(());
                };
                sqlx::query("SELECT msg_id FROM pgmq.set_vt($1, $2, $3)")
                    .bind(&self.settings.queue)
                    .bind(msg_id)
                    .bind(vt_seconds(delay)?.max(1))
                    .execute(&self.pool)
                    .await
                    .map_err(|e| TransportError::Finalize(e.to_string()))?;
                Ok(())
            }
        }
    }
}

/// pgmq takes visibility timeouts as whole seconds in an `integer`
fn vt_seconds(duration: Duration) -> TransportResult<i32> {
    i32::try_from(duration.as_secs()).map_err(|_| {
        TransportError::Unsupported("visibility timeout longer than i32::MAX seconds")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vt_seconds_rejects_out_of_range_timeouts() {
        assert_eq!(vt_seconds(Duration::from_secs(30)).unwrap(), 30);
        assert_eq!(vt_seconds(Duration::from_millis(1500)).unwrap(), 1);
        assert_eq!(vt_seconds(Duration::from_secs(i32::MAX as u64)).unwrap(), i32::MAX);
        assert!(matches!(
            vt_seconds(Duration::from_secs(i32::MAX as u64 + 1)),
            Err(TransportError::Unsupported(_))
        ));
    }

    #[test]
    fn test_redact_url_hides_password() {
        assert_eq!(
            redact_url("postgres://postgres:secret@db:5432/gamedb"),
            "postgres://postgres:***@db:5432/gamedb"
        );
        assert_eq!(redact_url("postgres://db:5432/gamedb"), "postgres://db:5432/gamedb");
        assert_eq!(redact_url("not a url"), "not a url");
    }

    #[test]
    fn test_defaults_follow_queue_conventions() {
        let settings = PgmqSettings::new("postgres://localhost/gamedb", "email_queue");

        assert_eq!(settings.visibility_timeout, Duration::from_secs(30));
        assert_eq!(settings.poll_interval, Duration::from_secs(1));
        assert!(settings.retry_delay.is_none());
        assert_eq!(settings.topology().target, "email_queue");
    }

    #[tokio::test]
    async fn test_malformed_url_is_rejected_without_retry() {
        use crate::utils::IsTransient;

        let err = PgmqQueue::connect(PgmqSettings::new("not a url", "email_queue"))
            .await
            .err()
            .unwrap();
        assert!(!err.is_transient(), "unexpected error kind: {}", err);
    }
}
