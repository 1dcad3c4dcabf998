// ============================================================================
// Dispatch Module - reliable event delivery on top of the transports
// ============================================================================
//
// - bootstrap  - connect with bounded retry, provision topology
// - publisher  - serialize and send with timeout + circuit breaker
// - consumer   - pull / process / finalize loop with dead-letter policy
// - processor  - event handlers and idempotency
// - dlq        - dead-letter records and sinks
//
// ============================================================================

pub mod bootstrap;
pub mod consumer;
pub mod dlq;
pub mod processor;
pub mod publisher;

pub use bootstrap::{BootstrapError, Bootstrapper, Role, TransportClient, TransportConfig};
pub use consumer::{ConsumerConfig, ConsumerLoop, ConsumerStats, StepOutcome};
pub use dlq::{
    DeadLetter, DeadLetterReason, DeadLetterSink, DlqStats, InMemoryDeadLetterSink,
    LogDeadLetterSink, PgDeadLetterSink,
};
pub use processor::{
    EmailNotifier, EventProcessor, FulfilmentProcessor, IdempotentProcessor, InMemoryProcessedStore, PgProcessedStore,
    ProcessedStore,
};
pub use publisher::{PublishAck, PublishError, Publisher, PublisherConfig};
