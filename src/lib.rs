pub mod cascade;
pub mod cli;
pub mod config;
pub mod error;
pub mod messages;
pub mod transport;

// Re-export key types for easy testing
pub use cascade::{CascadeEvent, CascadeService, EventKind, LifecycleState, RetryLevelOptions};
pub use config::CascadeConfig;
pub use error::{CascadeError, Result};
pub use messages::{Message, RetryEnvelope};
pub use transport::{handler_fn, MemoryBroker, MessageHandler, MessagingClient};
