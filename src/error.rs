use crate::cascade::LifecycleState;
use crate::transport::TransportError;
use thiserror::Error;

/// Errors surfaced by the cascade router and service.
///
/// Every variant is `Clone` so the same value can be returned to the caller
/// and published on the `error` event.
#[derive(Debug, Clone, Error)]
pub enum CascadeError {
    #[error("Connection error during {operation}: {source}")]
    Connection {
        operation: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("Failed to parse cascade metadata: {reason}")]
    MetadataParse { reason: String },

    #[error("Topic provisioning failed: {source}")]
    TopicProvisioning {
        #[source]
        source: TransportError,
    },

    #[error("Failed to send message to topic '{topic}': {source}")]
    Send {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Consumer error during {operation}: {source}")]
    Consumer {
        operation: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("Cannot {operation} while service is {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },

    #[error("Retry producer is stopped and accepts no new messages")]
    Stopped,

    #[error("Service has been disconnected and cannot be reused")]
    Closed,
}

impl CascadeError {
    /// Stable short name for logs and event consumers
    pub fn kind(&self) -> &'static str {
        match self {
            CascadeError::Connection { .. } => "ConnectionError",
            CascadeError::MetadataParse { .. } => "MetadataParseError",
            CascadeError::TopicProvisioning { .. } => "TopicProvisioningError",
            CascadeError::Send { .. } => "SendError",
            CascadeError::UnknownEvent(_) => "UnknownEventError",
            CascadeError::Consumer { .. } => "ConsumerError",
            CascadeError::InvalidState { .. } => "InvalidStateError",
            CascadeError::Stopped => "StoppedError",
            CascadeError::Closed => "ClosedError",
        }
    }
}

pub type Result<T> = std::result::Result<T, CascadeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_source() {
        let err = CascadeError::Send {
            topic: "orders-cascade-retry-1".to_string(),
            source: TransportError::Unavailable("broker down".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("orders-cascade-retry-1"));
        assert!(msg.contains("broker down"));
        assert_eq!(err.kind(), "SendError");
    }

    #[test]
    fn test_invalid_state_display() {
        let err = CascadeError::InvalidState {
            operation: "run",
            state: LifecycleState::Disconnected,
        };
        assert_eq!(err.to_string(), "Cannot run while service is disconnected");
    }
}
