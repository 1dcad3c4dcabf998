// ============================================================================
// Messaging Module - transport adapters
// ============================================================================
//
// One adapter per substrate, all exposing the same two seams:
// - EventSink:   what the publisher hands payloads to
// - EventSource: what the consumer loop pulls from and finalizes against
//
// Adapters:
// - streams   - broadcast exchange on Redis Streams consumer groups
// - socket    - push/pull over framed TCP (fire-and-forget)
// - redpanda  - partitioned log on Kafka-compatible brokers
// - pgmq      - polling table on PostgreSQL + pgmq
// - memory    - in-process polling queue for tests and local runs
//
// ============================================================================

mod envelope;
mod error;
pub mod memory;
pub mod pgmq;
pub mod redpanda;
pub mod socket;
pub mod streams;
mod substrate;

pub use envelope::{DeliveryTag, MessageEnvelope, Position};
pub use error::{TransportError, TransportResult};
pub use memory::{InMemoryExchange, InMemoryQueue};
pub use pgmq::{PgmqQueue, PgmqSettings};
pub use redpanda::{LogSettings, RedpandaClient, RedpandaConsumer};
pub use socket::{PullSocket, PushSocket, SocketEnd, SocketSettings};
pub use streams::{StreamsConsumer, StreamsSettings, StreamsTransport};
pub use substrate::{
    Capabilities, FanOut, OrderingGuarantee, Redelivery, Substrate, UnknownSubstrate,
};

use async_trait::async_trait;

/// What a successful send promises
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendGuarantee {
    /// The broker accepted responsibility for persisting the message
    BrokerAccepted,
    /// Only the local hand-off completed; the message can still be lost
    /// before any consumer sees it
    LocalSendOnly,
}

#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub guarantee: SendGuarantee,
    pub message_id: Option<String>,
}

impl SendReceipt {
    pub fn accepted(message_id: impl Into<String>) -> Self {
        Self {
            guarantee: SendGuarantee::BrokerAccepted,
            message_id: Some(message_id.into()),
        }
    }

    pub fn local_only() -> Self {
        Self {
            guarantee: SendGuarantee::LocalSendOnly,
            message_id: None,
        }
    }
}

/// How a failed delivery is finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Leave the message for another delivery attempt
    Redeliver,
    /// Remove the message from the delivery path for good
    Discard,
}

/// Durable names a substrate needs before messages can flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyDescriptor {
    pub substrate: Substrate,
    /// Stream, socket endpoint, topic or queue name
    pub target: String,
    /// Queues bound to the target (consumer groups on the broadcast substrate)
    pub bindings: Vec<String>,
    pub partitions: i32,
    pub replication: i32,
}

impl TopologyDescriptor {
    pub fn new(substrate: Substrate, target: impl Into<String>) -> Self {
        Self {
            substrate,
            target: target.into(),
            bindings: Vec::new(),
            partitions: 1,
            replication: 1,
        }
    }

    pub fn with_bindings(mut self, bindings: Vec<String>) -> Self {
        self.bindings = bindings;
        self
    }

    pub fn with_partitions(mut self, partitions: i32, replication: i32) -> Self {
        self.partitions = partitions;
        self.replication = replication;
        self
    }
}

/// Producer-side seam of a transport
#[async_trait]
pub trait EventSink: Send + Sync {
    fn substrate(&self) -> Substrate;

    /// Send one payload. `key` groups related messages (partition key on the
    /// log substrate); substrates without keyed routing ignore it.
    async fn send(&self, key: &str, payload: &[u8]) -> TransportResult<SendReceipt>;
}

/// Consumer-side seam of a transport
///
/// `pull` must be cancel-safe: dropping the future before it resolves must not
/// lose a message beyond what a consumer crash at that point would lose.
#[async_trait]
pub trait EventSource: Send + Sync {
    fn substrate(&self) -> Substrate;

    /// Wait a bounded time for the next delivery. `Ok(None)` means nothing
    /// arrived in that window.
    async fn pull(&self) -> TransportResult<Option<MessageEnvelope>>;

    /// Finalize a successful delivery. Finalizing twice is a no-op.
    async fn ack(&self, tag: &DeliveryTag) -> TransportResult<()>;

    /// Finalize a failed delivery.
    async fn nack(&self, tag: &DeliveryTag, disposition: Disposition) -> TransportResult<()>;

    /// Release whatever the source registered with the broker.
    /// Called once after the consumer loop stops pulling.
    async fn close(&self) -> TransportResult<()> {
        Ok(())
    }
}
