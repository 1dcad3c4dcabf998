use std::fmt;
use std::str::FromStr;

// ============================================================================
// Substrates and their delivery guarantees
// ============================================================================
//
// Every transport adapter is tagged with the substrate class it implements.
// The consumer loop and callers query the capabilities instead of assuming
// uniform behavior:
//
// | Substrate      | Fan-out                 | Redelivery trigger    | Ordering      |
// |----------------|-------------------------|-----------------------|---------------|
// | Broadcast      | copy per bound queue    | nack / disconnect     | none          |
// | PushPull       | competing, no ack       | none                  | none          |
// | PartitionedLog | consumer groups, replay | offset not committed  | per partition |
// | PollingTable   | competing, row locking  | visibility timeout    | FIFO-ish      |
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Substrate {
    Broadcast,
    PushPull,
    PartitionedLog,
    PollingTable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOut {
    /// Every bound queue receives its own copy
    CopyPerBoundQueue,
    /// Each message goes to exactly one connected consumer
    CompetingConsumers,
    /// Each consumer group sees every message; members of a group compete
    ConsumerGroups,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redelivery {
    OnNackOrDisconnect,
    UncommittedOffset,
    VisibilityTimeout,
    /// In-flight messages of a crashed or failing consumer are lost
    None,
}

impl Redelivery {
    pub fn is_supported(self) -> bool {
        !matches!(self, Redelivery::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingGuarantee {
    None,
    PerPartition,
    FifoBestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub fan_out: FanOut,
    pub redelivery: Redelivery,
    pub ordering: OrderingGuarantee,
    /// A successful publish means the broker took responsibility for persistence
    pub durable_publish: bool,
    /// Envelopes carry a delivery count usable for dead-letter thresholds
    pub delivery_count: bool,
}

impl Substrate {
    pub const ALL: [Substrate; 4] = [
        Substrate::Broadcast,
        Substrate::PushPull,
        Substrate::PartitionedLog,
        Substrate::PollingTable,
    ];

    pub const fn capabilities(self) -> Capabilities {
        match self {
            Substrate::Broadcast => Capabilities {
                fan_out: FanOut::CopyPerBoundQueue,
                redelivery: Redelivery::OnNackOrDisconnect,
                ordering: OrderingGuarantee::None,
                durable_publish: true,
                delivery_count: true,
            },
            Substrate::PushPull => Capabilities {
                fan_out: FanOut::CompetingConsumers,
                redelivery: Redelivery::None,
                ordering: OrderingGuarantee::None,
                durable_publish: false,
                delivery_count: false,
            },
            Substrate::PartitionedLog => Capabilities {
                fan_out: FanOut::ConsumerGroups,
                redelivery: Redelivery::UncommittedOffset,
                ordering: OrderingGuarantee::PerPartition,
                durable_publish: true,
                delivery_count: true,
            },
            Substrate::PollingTable => Capabilities {
                fan_out: FanOut::CompetingConsumers,
                redelivery: Redelivery::VisibilityTimeout,
                ordering: OrderingGuarantee::FifoBestEffort,
                durable_publish: true,
                delivery_count: true,
            },
        }
    }

    pub fn supports_redelivery(self) -> bool {
        self.capabilities().redelivery.is_supported()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Substrate::Broadcast => "broadcast",
            Substrate::PushPull => "push-pull",
            Substrate::PartitionedLog => "log",
            Substrate::PollingTable => "table",
        }
    }
}

impl fmt::Display for Substrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown substrate '{0}' (expected broadcast, push-pull, log or table)")]
pub struct UnknownSubstrate(pub String);

impl FromStr for Substrate {
    type Err = UnknownSubstrate;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "broadcast" | "fanout" | "streams" => Ok(Substrate::Broadcast),
            "push-pull" | "pushpull" | "socket" => Ok(Substrate::PushPull),
            "log" | "partitioned-log" | "kafka" => Ok(Substrate::PartitionedLog),
            "table" | "polling-table" | "pgmq" => Ok(Substrate::PollingTable),
            other => Err(UnknownSubstrate(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_push_pull_lacks_redelivery() {
        for substrate in Substrate::ALL {
            let expected = substrate != Substrate::PushPull;
            assert_eq!(substrate.supports_redelivery(), expected, "{substrate}");
        }
    }

    #[test]
    fn test_only_log_orders_messages() {
        assert_eq!(
            Substrate::PartitionedLog.capabilities().ordering,
            OrderingGuarantee::PerPartition
        );
        assert_eq!(Substrate::Broadcast.capabilities().ordering, OrderingGuarantee::None);
    }

    #[test]
    fn test_push_pull_publish_is_not_durable() {
        let caps = Substrate::PushPull.capabilities();
        assert!(!caps.durable_publish);
        assert!(!caps.delivery_count);
    }

    #[test]
    fn test_parse_round_trips_display_names() {
        for substrate in Substrate::ALL {
            assert_eq!(substrate.as_str().parse::<Substrate>().unwrap(), substrate);
        }
        assert_eq!("PGMQ".parse::<Substrate>().unwrap(), Substrate::PollingTable);
        assert!("carrier-pigeon".parse::<Substrate>().is_err());
    }
}
