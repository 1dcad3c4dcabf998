use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::{
    admin::{AdminClient, AdminOptions, NewTopic, TopicReplication, TopicResult},
    client::DefaultClientContext,
    config::ClientConfig,
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::KafkaError,
    producer::{FutureProducer, FutureRecord, Producer},
    types::RDKafkaErrorCode,
    util::Timeout,
    Message, Offset, TopicPartitionList,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::OnceCell;

use super::{
    DeliveryTag, Disposition, EventSink, EventSource, MessageEnvelope, Position, SendGuarantee,
    SendReceipt, Substrate, TopologyDescriptor, TransportError, TransportResult,
};

// ============================================================================
// Partitioned log on Redpanda / Kafka
// ============================================================================
//
// - publish keys every record by game id, so one game's events stay ordered
//   within a partition
// - consumers join a group and commit offsets manually, only after a
//   successful process
// - a failed delivery seeks the partition back to its offset, so the same
//   record is fetched again
// - the log has no delivery counter; attempts per offset are counted locally
//
// ============================================================================

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub brokers: String,
    pub topic: String,
    pub group_id: String,
    pub partitions: i32,
    pub replication: i32,
    /// How long a single pull waits for a record
    pub read_timeout: Duration,
    pub message_timeout: Duration,
    pub auto_offset_reset: String,
}

impl LogSettings {
    pub fn new(brokers: impl Into<String>, topic: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            topic: topic.into(),
            group_id: group_id.into(),
            partitions: 3,
            replication: 1,
            read_timeout: Duration::from_millis(500),
            message_timeout: Duration::from_secs(5),
            auto_offset_reset: "earliest".into(),
        }
    }

    pub fn topology(&self) -> TopologyDescriptor {
        TopologyDescriptor::new(Substrate::PartitionedLog, &self.topic)
            .with_bindings(vec![self.group_id.clone()])
            .with_partitions(self.partitions, self.replication)
    }
}

fn kafka_error(e: KafkaError) -> TransportError {
    TransportError::Connection(e.to_string())
}

#[derive(Clone)]
pub struct RedpandaClient {
    producer: FutureProducer,
    admin: Arc<AdminClient<DefaultClientContext>>,
    settings: Arc<LogSettings>,
    provisioned: Arc<OnceCell<()>>,
}

impl RedpandaClient {
    /// Build the producer and admin clients and check the brokers answer a
    /// metadata request.
    pub async fn connect(settings: LogSettings) -> TransportResult<Self> {
        let invalid = |e: KafkaError| TransportError::InvalidEndpoint {
            endpoint: settings.brokers.clone(),
            reason: e.to_string(),
        };

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &settings.brokers)
            .set("message.timeout.ms", settings.message_timeout.as_millis().to_string())
            .create()
            .map_err(invalid)?;

        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &settings.brokers)
            .create()
            .map_err(invalid)?;

        // librdkafka connects lazily; the metadata call is the real connection check
        let checker = producer.clone();
        let timeout = settings.message_timeout;
        tokio::task::spawn_blocking(move || {
            checker.client().fetch_metadata(None, timeout).map(|_| ())
        })
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?
        .map_err(kafka_error)?;

        tracing::info!(brokers = %settings.brokers, topic = %settings.topic, "Connected to Redpanda");

        Ok(Self {
            producer,
            admin: Arc::new(admin),
            settings: Arc::new(settings),
            provisioned: Arc::new(OnceCell::new()),
        })
    }

    pub async fn provision(&self, topology: &TopologyDescriptor) -> TransportResult<()> {
        self.provisioned
            .get_or_try_init(|| async {
                let topic = NewTopic::new(
                    &topology.target,
                    topology.partitions,
                    TopicReplication::Fixed(topology.replication),
                );
                let options = AdminOptions::new()
                    .operation_timeout(Some(Timeout::After(Duration::from_secs(10))));

                let results = self
                    .admin
                    .create_topics(&[topic], &options)
                    .await
                    .map_err(|e| TransportError::Topology(e.to_string()))?;

                for result in &results {
                    match topic_outcome(result) {
                        Ok(true) => tracing::info!(
                            topic = %topology.target,
                            partitions = topology.partitions,
                            "Created topic"
                        ),
                        Ok(false) => tracing::debug!(topic = %topology.target, "Topic already exists"),
                        Err(reason) => return Err(TransportError::Topology(reason)),
                    }
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Join the consumer group and subscribe to the topic
    pub fn consumer(&self) -> TransportResult<RedpandaConsumer> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.settings.brokers)
            .set("group.id", &self.settings.group_id)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", &self.settings.auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .create()
            .map_err(|e| TransportError::InvalidEndpoint {
                endpoint: self.settings.brokers.clone(),
                reason: e.to_string(),
            })?;

        consumer
            .subscribe(&[&self.settings.topic])
            .map_err(|e| TransportError::Topology(e.to_string()))?;

        tracing::info!(
            topic = %self.settings.topic,
            group_id = %self.settings.group_id,
            "Subscribed to topic"
        );

        Ok(RedpandaConsumer {
            consumer,
            settings: self.settings.clone(),
            offsets: StdMutex::new(OffsetTracker::default()),
        })
    }
}

/// `Ok(true)` when the topic was created, `Ok(false)` when it already existed
fn topic_outcome(result: &TopicResult) -> Result<bool, String> {
    match result {
        Ok(_) => Ok(true),
        Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => Ok(false),
        Err((name, code)) => Err(format!("creating topic {}: {}", name, code)),
    }
}

#[async_trait]
impl EventSink for RedpandaClient {
    fn substrate(&self) -> Substrate {
        Substrate::PartitionedLog
    }

    async fn send(&self, key: &str, payload: &[u8]) -> TransportResult<SendReceipt> {
        let record = FutureRecord::to(&self.settings.topic).key(key).payload(payload);

        self.producer
            .send(record, Timeout::After(self.settings.message_timeout))
            .await
            .map(|_| ())
            .map_err(|(e, _)| TransportError::Publish(e.to_string()))?;

        Ok(SendReceipt {
            guarantee: SendGuarantee::BrokerAccepted,
            message_id: None,
        })
    }
}

// ============================================================================
// Offset bookkeeping
// ============================================================================

/// Local delivery attempts and committed positions per partition
#[derive(Debug, Default)]
pub struct OffsetTracker {
    attempts: HashMap<(i32, i64), u32>,
    /// Next offset to consume, as last committed
    committed: HashMap<i32, i64>,
}

impl OffsetTracker {
    /// Count a fetch of `offset`; returns the 1-based attempt number
    pub fn record_delivery(&mut self, partition: i32, offset: i64) -> u32 {
        let attempts = self.attempts.entry((partition, offset)).or_insert(0);
        *attempts += 1;
        *attempts
    }

    pub fn is_committed(&self, partition: i32, offset: i64) -> bool {
        self.committed
            .get(&partition)
            .is_some_and(|next| offset < *next)
    }

    /// Mark `offset` done. Returns the next offset to commit, or `None` when
    /// the partition is already committed past it.
    pub fn commit(&mut self, partition: i32, offset: i64) -> Option<i64> {
        if self.is_committed(partition, offset) {
            return None;
        }
        let next = offset + 1;
        self.committed.insert(partition, next);
        self.attempts
            .retain(|(p, o), _| *p != partition || *o >= next);
        Some(next)
    }
}

pub struct RedpandaConsumer {
    consumer: StreamConsumer,
    settings: Arc<LogSettings>,
    offsets: StdMutex<OffsetTracker>,
}

impl RedpandaConsumer {
    fn position(tag: &DeliveryTag) -> TransportResult<(i32, i64)> {
        match tag {
            DeliveryTag::Log { partition, offset } => Ok((*partition, *offset)),
            other => Err(TransportError::ForeignTag(other.clone())),
        }
    }

    fn offsets(&self) -> TransportResult<std::sync::MutexGuard<'_, OffsetTracker>> {
        self.offsets
            .lock()
            .map_err(|_| TransportError::Finalize("offset tracker lock poisoned".into()))
    }

    fn commit(&self, partition: i32, offset: i64) -> TransportResult<()> {
        let Some(next) = self.offsets()?.commit(partition, offset) else {
            tracing::debug!(partition, offset, "Offset already committed");
            return Ok(());
        };

        let mut list = TopicPartitionList::new();
        list.add_partition_offset(&self.settings.topic, partition, Offset::Offset(next))
            .map_err(|e| TransportError::Finalize(e.to_string()))?;

        self.consumer
            .commit(&list, CommitMode::Async)
            .map_err(|e| TransportError::Finalize(e.to_string()))
    }
}

#[async_trait]
impl EventSource for RedpandaConsumer {
    fn substrate(&self) -> Substrate {
        Substrate::PartitionedLog
    }

    async fn pull(&self) -> TransportResult<Option<MessageEnvelope>> {
        let received = match tokio::time::timeout(self.settings.read_timeout, self.consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(received) => received,
        };

        let (partition, offset, payload, timestamp) = {
            let message = received.map_err(|e| TransportError::Receive(e.to_string()))?;
            (
                message.partition(),
                message.offset(),
                message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                message.timestamp().to_millis(),
            )
        };

        let attempts = self
            .offsets
            .lock()
            .map_err(|_| TransportError::Receive("offset tracker lock poisoned".into()))?
            .record_delivery(partition, offset);

        let envelope = MessageEnvelope::new(DeliveryTag::Log { partition, offset }, payload)
            .with_delivery_count(attempts)
            .with_position(Position::PartitionOffset { partition, offset });

        Ok(Some(
            match timestamp.and_then(DateTime::<Utc>::from_timestamp_millis) {
                Some(at) => envelope.with_enqueued_at(at),
                None => envelope,
            },
        ))
    }

    async fn ack(&self, tag: &DeliveryTag) -> TransportResult<()> {
        let (partition, offset) = Self::position(tag)?;
        self.commit(partition, offset)
    }

    async fn nack(&self, tag: &DeliveryTag, disposition: Disposition) -> TransportResult<()> {
        let (partition, offset) = Self::position(tag)?;
        match disposition {
            // Skipping a record on the log means committing past it
            Disposition::Discard => self.commit(partition, offset),
            Disposition::Redeliver => {
                if self.offsets()?.is_committed(partition, offset) {
                    return Ok(());
                }
                self.consumer
                    .seek(
                        &self.settings.topic,
                        partition,
                        Offset::Offset(offset),
                        Timeout::After(Duration::from_secs(1)),
                    )
                    .map_err(|e| TransportError::Finalize(e.to_string()))?;
                tracing::debug!(partition, offset, "Rewound partition for redelivery");
                Ok(())
            }
        }
    }
}
