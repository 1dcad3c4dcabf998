//! In-process polling queue with visibility timeouts.
//!
//! Behaves like the polling-table substrate (pgmq) without a database:
//! a pulled message is leased for the visibility timeout, reappears if it is
//! not finalized in time, and counts its deliveries.
//!
//! `InMemoryExchange` fans every publish out to a set of bound queues, the
//! way the broadcast substrate copies a message to every consumer group.
//!
//! Both live inside one process, so they back tests and embedded use only;
//! the binary refuses them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{
    DeliveryTag, Disposition, EventSink, EventSource, MessageEnvelope, Position, SendReceipt,
    Substrate, TransportError, TransportResult,
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Longest lease a message can get, the same ceiling pgmq has
pub const MAX_LEASE: Duration = Duration::from_secs(i32::MAX as u64);

fn lease_until(now: Instant, lease: Duration) -> Instant {
    now.checked_add(lease.min(MAX_LEASE)).unwrap_or(now)
}

struct StoredMessage {
    payload: Vec<u8>,
    read_ct: u32,
    enqueued_at: DateTime<Utc>,
    visible_at: Instant,
}

/// A message that was finalized successfully
#[derive(Debug, Clone)]
pub struct ArchivedMessage {
    pub msg_id: u64,
    pub payload: Vec<u8>,
    pub read_ct: u32,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    messages: BTreeMap<u64, StoredMessage>,
    archived: Vec<ArchivedMessage>,
    deleted: usize,
}

#[derive(Clone)]
pub struct InMemoryQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    visibility_timeout: Duration,
    retry_delay: Option<Duration>,
}

impl InMemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
            visibility_timeout,
            retry_delay: None,
        }
    }

    /// Make a redelivery nack shorten the lease to `delay` instead of
    /// waiting for the visibility timeout
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Messages not yet archived or deleted, leased or not
    pub async fn depth(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn archived(&self) -> Vec<ArchivedMessage> {
        self.state.lock().await.archived.clone()
    }

    pub async fn deleted_count(&self) -> usize {
        self.state.lock().await.deleted
    }

    async fn take_visible(&self) -> Option<MessageEnvelope> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let (msg_id, message) = state
            .messages
            .iter_mut()
            .find(|(_, message)| message.visible_at <= now)?;

        message.read_ct += 1;
        message.visible_at = lease_until(now, self.visibility_timeout);

        let lease = chrono::Duration::from_std(self.visibility_timeout.min(MAX_LEASE))
            .unwrap_or_else(|_| chrono::Duration::zero());

        Some(
            MessageEnvelope::new(DeliveryTag::Memory { msg_id: *msg_id }, message.payload.clone())
                .with_delivery_count(message.read_ct)
                .with_enqueued_at(message.enqueued_at)
                .with_position(Position::VisibilityDeadline(Utc::now() + lease)),
        )
    }

    fn msg_id(tag: &DeliveryTag) -> TransportResult<u64> {
        match tag {
            DeliveryTag::Memory { msg_id } => Ok(*msg_id),
            other => Err(TransportError::ForeignTag(other.clone())),
        }
    }
}

#[async_trait]
impl EventSink for InMemoryQueue {
    fn substrate(&self) -> Substrate {
        Substrate::PollingTable
    }

    async fn send(&self, _key: &str, payload: &[u8]) -> TransportResult<SendReceipt> {
        let msg_id = {
            let mut state = self.state.lock().await;
            state.next_id += 1;
            let msg_id = state.next_id;
            state.messages.insert(
                msg_id,
                StoredMessage {
                    payload: payload.to_vec(),
                    read_ct: 0,
                    enqueued_at: Utc::now(),
                    visible_at: Instant::now(),
                },
            );
            msg_id
        };

        self.notify.notify_one();
        Ok(SendReceipt::accepted(msg_id.to_string()))
    }
}

#[async_trait]
impl EventSource for InMemoryQueue {
    fn substrate(&self) -> Substrate {
        Substrate::PollingTable
    }

    async fn pull(&self) -> TransportResult<Option<MessageEnvelope>> {
        if let Some(envelope) = self.take_visible().await {
            return Ok(Some(envelope));
        }

        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        Ok(self.take_visible().await)
    }

    async fn ack(&self, tag: &DeliveryTag) -> TransportResult<()> {
        let msg_id = Self::msg_id(tag)?;
        let mut state = self.state.lock().await;

        match state.messages.remove(&msg_id) {
            Some(message) => state.archived.push(ArchivedMessage {
                msg_id,
                payload: message.payload,
                read_ct: message.read_ct,
            }),
            None => tracing::debug!(tag = %tag, "Message already finalized"),
        }
        Ok(())
    }

    async fn nack(&self, tag: &DeliveryTag, disposition: Disposition) -> TransportResult<()> {
        let msg_id = Self::msg_id(tag)?;
        let mut state = self.state.lock().await;

        match disposition {
            Disposition::Discard => {
                if state.messages.remove(&msg_id).is_some() {
                    state.deleted += 1;
                }
            }
            Disposition::Redeliver => {
                if let (Some(delay), Some(message)) =
                    (self.retry_delay, state.messages.get_mut(&msg_id))
                {
                    message.visible_at = lease_until(Instant::now(), delay);
                }
            }
        }
        Ok(())
    }
}

/// Fan-out to named queues; each bound queue receives its own copy
#[derive(Clone)]
pub struct InMemoryExchange {
    queues: Arc<StdMutex<BTreeMap<String, InMemoryQueue>>>,
    visibility_timeout: Duration,
}

impl InMemoryExchange {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            queues: Arc::new(StdMutex::new(BTreeMap::new())),
            visibility_timeout,
        }
    }

    /// Bind a queue, or return the one already bound under `name`.
    /// A new binding only sees messages published after it.
    pub fn bind(&self, name: &str) -> TransportResult<InMemoryQueue> {
        let mut queues = self
            .queues
            .lock()
            .map_err(|_| TransportError::Topology("binding table lock poisoned".into()))?;
        Ok(queues
            .entry(name.to_string())
            .or_insert_with(|| InMemoryQueue::new(self.visibility_timeout))
            .clone())
    }
}

#[async_trait]
impl EventSink for InMemoryExchange {
    fn substrate(&self) -> Substrate {
        Substrate::Broadcast
    }

    async fn send(&self, key: &str, payload: &[u8]) -> TransportResult<SendReceipt> {
        let queues: Vec<InMemoryQueue> = self
            .queues
            .lock()
            .map_err(|_| TransportError::Publish("binding table lock poisoned".into()))?
            .values()
            .cloned()
            .collect();

        for queue in &queues {
            queue.send(key, payload).await?;
        }
        Ok(SendReceipt::accepted(format!("{} bindings", queues.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_pulled_message_is_hidden_until_lease_expires() {
        let queue = InMemoryQueue::new(Duration::from_secs(30));
        queue.send("7", b"one").await.unwrap();

        let first = queue.pull().await.unwrap().unwrap();
        assert_eq!(first.delivery_count, Some(1));
        assert!(queue.pull().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_secs(31)).await;

        let again = queue.pull().await.unwrap().unwrap();
        assert_eq!(again.tag, first.tag);
        assert_eq!(again.delivery_count, Some(2));
        assert!(again.is_redelivery());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_archives_and_is_idempotent() {
        let queue = InMemoryQueue::new(Duration::from_secs(30));
        queue.send("7", b"one").await.unwrap();

        let envelope = queue.pull().await.unwrap().unwrap();
        queue.ack(&envelope.tag).await.unwrap();
        queue.ack(&envelope.tag).await.unwrap();

        assert_eq!(queue.depth().await, 0);
        assert_eq!(queue.archived().await.len(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(queue.pull().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_deletes_without_archiving() {
        let queue = InMemoryQueue::new(Duration::from_secs(30));
        queue.send("7", b"junk").await.unwrap();

        let envelope = queue.pull().await.unwrap().unwrap();
        queue.nack(&envelope.tag, Disposition::Discard).await.unwrap();

        assert_eq!(queue.depth().await, 0);
        assert_eq!(queue.deleted_count().await, 1);
        assert!(queue.archived().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delay_shortens_the_lease() {
        let queue = InMemoryQueue::new(Duration::from_secs(30))
            .with_retry_delay(Duration::from_millis(500));
        queue.send("7", b"one").await.unwrap();

        let envelope = queue.pull().await.unwrap().unwrap();
        queue.nack(&envelope.tag, Disposition::Redeliver).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let again = queue.pull().await.unwrap().unwrap();
        assert_eq!(again.delivery_count, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_lease_is_capped_instead_of_overflowing() {
        let queue = InMemoryQueue::new(Duration::MAX).with_retry_delay(Duration::MAX);
        queue.send("7", b"one").await.unwrap();

        let envelope = queue.pull().await.unwrap().unwrap();
        queue.nack(&envelope.tag, Disposition::Redeliver).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(queue.pull().await.unwrap().is_none());
        assert_eq!(queue.depth().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchange_copies_to_bindings_made_before_publish() {
        let exchange = InMemoryExchange::new(Duration::from_secs(30));
        let email = exchange.bind("email_queue").unwrap();
        exchange.send("7", b"first").await.unwrap();

        let fulfilment = exchange.bind("fulfillment_queue").unwrap();
        exchange.send("7", b"second").await.unwrap();

        assert_eq!(email.depth().await, 2);
        assert_eq!(fulfilment.depth().await, 1);
        assert_eq!(exchange.bind("email_queue").unwrap().depth().await, 2);
    }

    #[tokio::test]
    async fn test_foreign_tags_are_rejected() {
        let queue = InMemoryQueue::new(Duration::from_secs(30));
        let err = queue.ack(&DeliveryTag::Table { msg_id: 1 }).await.unwrap_err();

        assert!(matches!(err, TransportError::ForeignTag(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_are_delivered_oldest_first() {
        let queue = InMemoryQueue::new(Duration::from_secs(30));
        queue.send("1", b"a").await.unwrap();
        queue.send("2", b"b").await.unwrap();

        assert_eq!(queue.pull().await.unwrap().unwrap().payload, b"a");
        assert_eq!(queue.pull().await.unwrap().unwrap().payload, b"b");
    }
}
