use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamClaimReply, StreamId, StreamMaxlen,
    StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;

use super::{
    DeliveryTag, Disposition, EventSink, EventSource, MessageEnvelope, SendReceipt, Substrate,
    TopologyDescriptor, TransportError, TransportResult,
};

// ============================================================================
// Broadcast exchange on Redis Streams
// ============================================================================
//
// Topology:
// - the stream is the exchange; publishers XADD to it
// - every bound queue is a consumer group created at "$", so each group
//   receives its own copy of every message published after binding
// - members of one group compete for that group's copy
//
// Delivery:
// - new messages arrive through XREADGROUP ... >
// - XACK finalizes; an un-acked entry stays in the group's pending list
// - a nack requeues the entry for this consumer; it is XCLAIMed again once
//   `retry_delay` has passed
// - entries idle longer than `claim_idle` are taken over with XAUTOCLAIM,
//   which covers consumers that crashed or lost their connection
// - the pending list's delivery counter becomes the envelope's delivery count
// - on close a consumer with an empty pending list leaves the group
//   (XGROUP DELCONSUMER); one still holding entries stays so they are not lost
//
// ============================================================================

const PAYLOAD_FIELD: &str = "payload";
const KEY_FIELD: &str = "key";

#[derive(Debug, Clone)]
pub struct StreamsSettings {
    pub url: String,
    /// Stream key acting as the fan-out exchange
    pub exchange: String,
    /// Consumer group this process reads from
    pub queue: String,
    /// Groups to create when provisioning; defaults to `queue`
    pub bindings: Vec<String>,
    /// Consumer name inside the group
    pub consumer: String,
    /// How long a single XREADGROUP blocks
    pub block: Duration,
    /// Pending entries idle this long are reclaimed from other consumers
    pub claim_idle: Duration,
    /// Wait before a nacked entry is claimed again
    pub retry_delay: Duration,
    /// Approximate stream length cap applied on publish
    pub max_len: Option<usize>,
}

impl StreamsSettings {
    pub fn new(url: impl Into<String>, exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            url: url.into(),
            exchange: exchange.into(),
            bindings: vec![queue.clone()],
            consumer: format!("{}-{}", queue, uuid::Uuid::new_v4().simple()),
            queue,
            block: Duration::from_millis(250),
            claim_idle: Duration::from_secs(30),
            retry_delay: Duration::from_secs(1),
            max_len: Some(100_000),
        }
    }

    pub fn topology(&self) -> TopologyDescriptor {
        let bindings = if self.bindings.is_empty() {
            vec![self.queue.clone()]
        } else {
            self.bindings.clone()
        };
        TopologyDescriptor::new(Substrate::Broadcast, &self.exchange).with_bindings(bindings)
    }
}

/// Shared connection to the Redis server used for publishing and topology
#[derive(Clone)]
pub struct StreamsTransport {
    client: redis::Client,
    conn: MultiplexedConnection,
    settings: Arc<StreamsSettings>,
    provisioned: Arc<OnceCell<()>>,
}

impl StreamsTransport {
    pub async fn connect(settings: StreamsSettings) -> TransportResult<Self> {
        let client = redis::Client::open(settings.url.as_str()).map_err(|e| {
            TransportError::InvalidEndpoint {
                endpoint: settings.url.clone(),
                reason: e.to_string(),
            }
        })?;

        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        tracing::info!(exchange = %settings.exchange, "Connected to Redis");

        Ok(Self {
            client,
            conn,
            settings: Arc::new(settings),
            provisioned: Arc::new(OnceCell::new()),
        })
    }

    /// Create the stream and one consumer group per binding.
    /// Groups that already exist are left untouched.
    pub async fn provision(&self, topology: &TopologyDescriptor) -> TransportResult<()> {
        self.provisioned
            .get_or_try_init(|| async {
                let mut conn = self.conn.clone();
                for group in &topology.bindings {
                    let created: redis::RedisResult<()> = conn
                        .xgroup_create_mkstream(&topology.target, group, "$")
                        .await;

                    match created {
                        Ok(()) => tracing::info!(
                            exchange = %topology.target,
                            queue = %group,
                            "Bound queue to exchange"
                        ),
                        Err(e) if e.code() == Some("BUSYGROUP") => tracing::debug!(
                            exchange = %topology.target,
                            queue = %group,
                            "Queue already bound"
                        ),
                        Err(e) => {
                            return Err(TransportError::Topology(format!(
                                "binding {} to {}: {}",
                                group, topology.target, e
                            )))
                        }
                    }
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Open a dedicated connection for this process's group member.
    /// Blocking reads must not share the publishing connection.
    pub async fn consumer(&self) -> TransportResult<StreamsConsumer> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        tracing::info!(
            exchange = %self.settings.exchange,
            queue = %self.settings.queue,
            consumer = %self.settings.consumer,
            "Joined consumer group"
        );

        Ok(StreamsConsumer {
            conn,
            settings: self.settings.clone(),
            requeued: Mutex::new(RequeueList::default()),
        })
    }
}

#[async_trait]
impl EventSink for StreamsTransport {
    fn substrate(&self) -> Substrate {
        Substrate::Broadcast
    }

    async fn send(&self, key: &str, payload: &[u8]) -> TransportResult<SendReceipt> {
        let mut conn = self.conn.clone();
        let items: [(&str, &[u8]); 2] = [(KEY_FIELD, key.as_bytes()), (PAYLOAD_FIELD, payload)];

        let sent: redis::RedisResult<String> = match self.settings.max_len {
            Some(max_len) => {
                conn.xadd_maxlen(&self.settings.exchange, StreamMaxlen::Approx(max_len), "*", &items)
                    .await
            }
            None => conn.xadd(&self.settings.exchange, "*", &items).await,
        };

        let entry_id = sent.map_err(|e| TransportError::Publish(e.to_string()))?;
        Ok(SendReceipt::accepted(entry_id))
    }
}

/// One member of a consumer group
pub struct StreamsConsumer {
    conn: MultiplexedConnection,
    settings: Arc<StreamsSettings>,
    requeued: Mutex<RequeueList>,
}

/// Nacked entries waiting out their retry delay, oldest first
#[derive(Debug, Default)]
struct RequeueList {
    entries: VecDeque<(String, Instant)>,
}

impl RequeueList {
    /// Schedule `entry_id`; an entry already waiting keeps its slot
    fn push(&mut self, entry_id: &str, ready_at: Instant) {
        if !self.entries.iter().any(|(queued, _)| queued == entry_id) {
            self.entries.push_back((entry_id.to_string(), ready_at));
        }
    }

    /// Take the first entry whose delay has passed
    fn pop_ready(&mut self, now: Instant) -> Option<String> {
        let index = self.entries.iter().position(|(_, ready_at)| *ready_at <= now)?;
        self.entries.remove(index).map(|(entry_id, _)| entry_id)
    }

    fn remove(&mut self, entry_id: &str) {
        self.entries.retain(|(queued, _)| queued != entry_id);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

impl StreamsConsumer {
    fn entry_id(tag: &DeliveryTag) -> TransportResult<&str> {
        match tag {
            DeliveryTag::Stream { entry_id } => Ok(entry_id),
            other => Err(TransportError::ForeignTag(other.clone())),
        }
    }

    async fn delivery_count(&self, entry_id: &str) -> TransportResult<u32> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingCountReply = conn
            .xpending_count(&self.settings.exchange, &self.settings.queue, entry_id, entry_id, 1)
            .await
            .map_err(|e| TransportError::Receive(e.to_string()))?;

        Ok(reply
            .ids
            .first()
            .map(|pending| pending.times_delivered as u32)
            .unwrap_or(1))
    }

    async fn claim_requeued(&self) -> TransportResult<Option<MessageEnvelope>> {
        let Some(entry_id) = self.requeued.lock().await.pop_ready(Instant::now()) else {
            return Ok(None);
        };

        let mut conn = self.conn.clone();
        let reply: StreamClaimReply = conn
            .xclaim(
                &self.settings.exchange,
                &self.settings.queue,
                &self.settings.consumer,
                0,
                &[&entry_id],
            )
            .await
            .map_err(|e| TransportError::Receive(e.to_string()))?;

        // Acked or trimmed in the meantime
        let Some(entry) = reply.ids.into_iter().next() else {
            return Ok(None);
        };
        let count = self.delivery_count(&entry.id).await?;
        Ok(Some(entry_to_envelope(entry, count)))
    }

    async fn reclaim_idle(&self) -> TransportResult<Option<MessageEnvelope>> {
        let mut conn = self.conn.clone();
        let options = StreamAutoClaimOptions::default().count(1);
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(
                &self.settings.exchange,
                &self.settings.queue,
                &self.settings.consumer,
                self.settings.claim_idle.as_millis() as u64,
                "0-0",
                options,
            )
            .await
            .map_err(|e| TransportError::Receive(e.to_string()))?;

        let Some(entry) = reply.claimed.into_iter().next() else {
            return Ok(None);
        };

        let count = self.delivery_count(&entry.id).await?;
        tracing::info!(
            entry_id = %entry.id,
            delivery_count = count,
            "Reclaimed idle message from the pending list"
        );
        Ok(Some(entry_to_envelope(entry, count)))
    }

    async fn read_new(&self) -> TransportResult<Option<MessageEnvelope>> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(&self.settings.queue, &self.settings.consumer)
            .count(1)
            .block(self.settings.block.as_millis() as usize);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.settings.exchange], &[">"], &options)
            .await
            .map_err(|e| TransportError::Receive(e.to_string()))?;

        Ok(reply
            .and_then(|reply| reply.keys.into_iter().next())
            .and_then(|key| key.ids.into_iter().next())
            .map(|entry| entry_to_envelope(entry, 1)))
    }
}

#[async_trait]
impl EventSource for StreamsConsumer {
    fn substrate(&self) -> Substrate {
        Substrate::Broadcast
    }

    async fn pull(&self) -> TransportResult<Option<MessageEnvelope>> {
        if let Some(envelope) = self.claim_requeued().await? {
            return Ok(Some(envelope));
        }
        if let Some(envelope) = self.reclaim_idle().await? {
            return Ok(Some(envelope));
        }
        self.read_new().await
    }

    async fn ack(&self, tag: &DeliveryTag) -> TransportResult<()> {
        let entry_id = Self::entry_id(tag)?;
        self.requeued.lock().await.remove(entry_id);

        let mut conn = self.conn.clone();
        let acked: i64 = conn
            .xack(&self.settings.exchange, &self.settings.queue, &[entry_id])
            .await
            .map_err(|e| TransportError::Finalize(e.to_string()))?;

        if acked == 0 {
            tracing::debug!(entry_id = %entry_id, "Entry was already acknowledged");
        }
        Ok(())
    }

    async fn nack(&self, tag: &DeliveryTag, disposition: Disposition) -> TransportResult<()> {
        let entry_id = Self::entry_id(tag)?;
        match disposition {
            Disposition::Redeliver => {
                // Past claim_idle XAUTOCLAIM would take the entry anyway
                let delay = self.settings.retry_delay.min(self.settings.claim_idle);
                let ready_at = Instant::now() + delay;
                self.requeued.lock().await.push(entry_id, ready_at);
                Ok(())
            }
            // Other groups keep their own copy, so only this group's pending entry goes
            Disposition::Discard => self.ack(tag).await,
        }
    }

    async fn close(&self) -> TransportResult<()> {
        let mut conn = self.conn.clone();
        let pending: StreamPendingCountReply = conn
            .xpending_consumer_count(
                &self.settings.exchange,
                &self.settings.queue,
                "-",
                "+",
                1,
                &self.settings.consumer,
            )
            .await
            .map_err(|e| TransportError::Receive(e.to_string()))?;

        if !pending.ids.is_empty() {
            let requeued = self.requeued.lock().await.len();
            tracing::warn!(
                consumer = %self.settings.consumer,
                requeued,
                "Leaving consumer in the group; it still owns pending entries"
            );
            return Ok(());
        }

        let _: i64 = conn
            .xgroup_delconsumer(&self.settings.exchange, &self.settings.queue, &self.settings.consumer)
            .await
            .map_err(|e| TransportError::Topology(e.to_string()))?;

        tracing::info!(
            queue = %self.settings.queue,
            consumer = %self.settings.consumer,
            "Left consumer group"
        );
        Ok(())
    }
}

fn entry_to_envelope(entry: StreamId, delivery_count: u32) -> MessageEnvelope {
    // A missing payload field yields an empty payload, which the consumer
    // treats as malformed
    let payload: Vec<u8> = entry.get(PAYLOAD_FIELD).unwrap_or_default();
    let enqueued_at = entry_timestamp(&entry.id);

    let envelope = MessageEnvelope::new(DeliveryTag::Stream { entry_id: entry.id }, payload)
        .with_delivery_count(delivery_count);

    match enqueued_at {
        Some(at) => envelope.with_enqueued_at(at),
        None => envelope,
    }
}

/// Stream entry ids are `<unix-millis>-<sequence>`
fn entry_timestamp(entry_id: &str) -> Option<DateTime<Utc>> {
    let (millis, _sequence) = entry_id.split_once('-')?;
    DateTime::from_timestamp_millis(millis.parse().ok()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_timestamp_from_id() {
        let at = entry_timestamp("1700000000123-4").unwrap();
        assert_eq!(at.timestamp_millis(), 1_700_000_000_123);

        assert!(entry_timestamp("garbage").is_none());
        assert!(entry_timestamp("x-1").is_none());
    }

    #[test]
    fn test_topology_binds_own_queue_by_default() {
        let mut settings = StreamsSettings::new("redis://localhost/", "game_events", "email_queue");
        assert_eq!(settings.topology().bindings, vec!["email_queue".to_string()]);

        settings.bindings = vec!["email_queue".into(), "fulfillment_queue".into()];
        let topology = settings.topology();
        assert_eq!(topology.target, "game_events");
        assert_eq!(topology.bindings.len(), 2);
        assert_eq!(topology.substrate, Substrate::Broadcast);
    }

    #[test]
    fn test_consumer_names_are_unique_per_process() {
        let a = StreamsSettings::new("redis://localhost/", "game_events", "email_queue");
        let b = StreamsSettings::new("redis://localhost/", "game_events", "email_queue");
        assert_ne!(a.consumer, b.consumer);
        assert!(a.consumer.starts_with("email_queue-"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nacked_entry_waits_out_the_retry_delay() {
        let mut requeued = RequeueList::default();
        let delay = Duration::from_secs(1);

        requeued.push("1-0", Instant::now() + delay);
        assert!(requeued.pop_ready(Instant::now()).is_none());

        tokio::time::advance(delay).await;
        assert_eq!(requeued.pop_ready(Instant::now()).as_deref(), Some("1-0"));
        assert!(requeued.pop_ready(Instant::now()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_entry_does_not_hold_back_ready_ones() {
        let mut requeued = RequeueList::default();
        let now = Instant::now();

        requeued.push("1-0", now + Duration::from_secs(10));
        requeued.push("2-0", now);
        // Nacking again keeps the first schedule
        requeued.push("1-0", now);

        assert_eq!(requeued.len(), 2);
        assert_eq!(requeued.pop_ready(now).as_deref(), Some("2-0"));
        assert!(requeued.pop_ready(now).is_none());

        requeued.remove("1-0");
        assert_eq!(requeued.len(), 0);
    }

    #[tokio::test]
    async fn test_invalid_url_is_a_permanent_error() {
        use crate::utils::IsTransient;

        let settings = StreamsSettings::new("not a url", "game_events", "email_queue");
        let err = StreamsTransport::connect(settings).await.err().unwrap();

        assert!(matches!(err, TransportError::InvalidEndpoint { .. }));
        assert!(!err.is_transient());
    }
}
