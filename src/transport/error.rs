use thiserror::Error;

/// Failures reported by a messaging client implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Client is not connected")]
    NotConnected,

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Consumer is already running")]
    AlreadyRunning,

    #[error("Consumer has no subscription")]
    NotSubscribed,

    #[error("Request rejected: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
