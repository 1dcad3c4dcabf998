use std::time::Duration;

use super::DeliveryTag;
use crate::utils::IsTransient;

/// Errors raised by transport adapters
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("topology error: {0}")]
    Topology(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("receive error: {0}")]
    Receive(String),

    #[error("finalize error: {0}")]
    Finalize(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("delivery tag {0} does not belong to this transport")]
    ForeignTag(DeliveryTag),

    #[error("{0} is not supported by this transport")]
    Unsupported(&'static str),
}

pub type TransportResult<T> = Result<T, TransportError>;

impl IsTransient for TransportError {
    fn is_transient(&self) -> bool {
        match self {
            TransportError::Connection(_)
            | TransportError::Timeout(_)
            | TransportError::Receive(_)
            | TransportError::Publish(_)
            | TransportError::Finalize(_)
            | TransportError::Topology(_) => true,
            TransportError::InvalidEndpoint { .. }
            | TransportError::ForeignTag(_)
            | TransportError::Unsupported(_) => false,
        }
    }
}
