//! Messaging client boundary.
//!
//! The cascade router never talks to a broker directly. It consumes the
//! producer, consumer and admin capabilities defined here, so any client that
//! implements these traits can carry the retry cascade. [`MemoryBroker`] is
//! the in-process implementation used by the binary and the tests.

pub mod error;
pub mod handler;
pub mod memory;

pub use error::TransportError;
pub use handler::{handler_fn, FnHandler, MessageHandler};
pub use memory::{FaultPoint, MemoryBroker};

use crate::messages::{ProducerRecord, RecordMetadata};
use async_trait::async_trait;
use regex::Regex;
use std::sync::Arc;

/// A topic to create through the admin capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub topic: String,
}

/// Batch topic creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTopicsRequest {
    pub wait_for_leaders: bool,
    pub topics: Vec<TopicSpec>,
}

#[async_trait]
pub trait ProducerClient: Send + Sync {
    async fn connect(&self) -> error::Result<()>;

    async fn disconnect(&self) -> error::Result<()>;

    /// Publish a batch of messages to one topic and return the acknowledgment
    async fn send(&self, record: ProducerRecord) -> error::Result<Vec<RecordMetadata>>;
}

#[async_trait]
pub trait ConsumerClient: Send + Sync {
    async fn connect(&self) -> error::Result<()>;

    async fn disconnect(&self) -> error::Result<()>;

    /// Subscribe to every topic whose name matches `pattern`
    async fn subscribe(&self, pattern: Regex) -> error::Result<()>;

    /// Start delivering messages to `handler`.
    ///
    /// Implementations decide whether this resolves once the loop has started
    /// or once it has exited.
    async fn run(&self, handler: Arc<dyn MessageHandler>) -> error::Result<()>;

    /// Stop delivery, letting the in-flight handler call finish
    async fn stop(&self) -> error::Result<()>;

    async fn pause(&self) -> error::Result<()>;

    async fn resume(&self) -> error::Result<()>;
}

#[async_trait]
pub trait AdminClient: Send + Sync {
    async fn connect(&self) -> error::Result<()>;

    async fn disconnect(&self) -> error::Result<()>;

    /// Create topics. Topics that already exist are not an error.
    async fn create_topics(&self, request: CreateTopicsRequest) -> error::Result<bool>;

    async fn list_topics(&self) -> error::Result<Vec<String>>;
}

/// Factory for the three client capabilities.
pub trait MessagingClient: Send + Sync {
    fn producer(&self) -> Arc<dyn ProducerClient>;

    fn consumer(&self, group_id: &str) -> Arc<dyn ConsumerClient>;

    fn admin(&self) -> Arc<dyn AdminClient>;
}
