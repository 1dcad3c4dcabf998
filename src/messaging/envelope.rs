use chrono::{DateTime, Utc};
use std::fmt;

/// Handle needed to finalize a delivery.
///
/// Only meaningful to the adapter that produced it; passing a tag to a
/// different adapter is rejected with `TransportError::ForeignTag`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeliveryTag {
    /// Redis stream entry id, scoped to the consumer group
    Stream { entry_id: String },
    /// Local receive sequence of a pull socket
    Socket { sequence: u64 },
    Log { partition: i32, offset: i64 },
    Table { msg_id: i64 },
    Memory { msg_id: u64 },
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryTag::Stream { entry_id } => write!(f, "stream:{entry_id}"),
            DeliveryTag::Socket { sequence } => write!(f, "socket:{sequence}"),
            DeliveryTag::Log { partition, offset } => write!(f, "log:{partition}@{offset}"),
            DeliveryTag::Table { msg_id } => write!(f, "table:{msg_id}"),
            DeliveryTag::Memory { msg_id } => write!(f, "memory:{msg_id}"),
        }
    }
}

/// Where the delivery sits in its substrate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Position {
    /// Lease end; the message becomes visible again afterwards
    VisibilityDeadline(DateTime<Utc>),
    PartitionOffset { partition: i32, offset: i64 },
    Unpositioned,
}

/// A delivered message, owned by exactly one in-flight consumer until it is
/// finalized or its lease lapses.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    pub tag: DeliveryTag,
    pub payload: Vec<u8>,
    /// 1-based; `None` where the substrate cannot count deliveries
    pub delivery_count: Option<u32>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub position: Position,
}

impl MessageEnvelope {
    pub fn new(tag: DeliveryTag, payload: Vec<u8>) -> Self {
        Self {
            tag,
            payload,
            delivery_count: None,
            enqueued_at: None,
            position: Position::Unpositioned,
        }
    }

    pub fn with_delivery_count(mut self, count: u32) -> Self {
        self.delivery_count = Some(count);
        self
    }

    pub fn with_enqueued_at(mut self, at: DateTime<Utc>) -> Self {
        self.enqueued_at = Some(at);
        self
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count.is_some_and(|count| count > 1)
    }
}
