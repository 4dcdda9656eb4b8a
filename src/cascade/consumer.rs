//! Consumer half of the cascade.
//!
//! Reads the primary topic together with its retry topics, runs the user
//! processing callback on each message and forwards the message to the
//! success or failure callback depending on the outcome.

use crate::cascade::events::{CascadeEvent, EventBus};
use crate::cascade::topics::cascade_topic_pattern;
use crate::error::{CascadeError, Result};
use crate::messages::envelope::{self, RetryEnvelope, CASCADE_METADATA_HEADER};
use crate::messages::Message;
use crate::transport::{ConsumerClient, MessageHandler, TransportError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct IntakeConsumer {
    client: Arc<dyn ConsumerClient>,
    topic: String,
    group_id: String,
    events: Arc<EventBus>,
}

impl IntakeConsumer {
    pub fn new(
        client: Arc<dyn ConsumerClient>,
        topic: impl Into<String>,
        group_id: impl Into<String>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            client,
            topic: topic.into(),
            group_id: group_id.into(),
            events,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Connect and subscribe to the primary topic and its retry topics
    pub async fn connect(&self) -> Result<()> {
        self.client
            .connect()
            .await
            .map_err(|source| CascadeError::Connection {
                operation: "connect consumer",
                source,
            })?;

        let subscribed = match cascade_topic_pattern(&self.topic) {
            Ok(pattern) => self.client.subscribe(pattern).await,
            Err(e) => Err(TransportError::Rejected(e.to_string())),
        };
        if let Err(source) = subscribed {
            // Do not leave a connected client without a subscription behind
            if let Err(e) = self.client.disconnect().await {
                warn!(topic = %self.topic, error = %e, "Failed to disconnect consumer after subscribe failure");
            }
            return Err(CascadeError::Connection {
                operation: "subscribe",
                source,
            });
        }

        info!(topic = %self.topic, group = %self.group_id, "Intake consumer connected");
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.client
            .disconnect()
            .await
            .map_err(|source| CascadeError::Connection {
                operation: "disconnect consumer",
                source,
            })
    }

    /// Start delivery.
    ///
    /// `process` decides the fate of each message: `Ok` hands it to
    /// `on_success`, `Err` hands it to `on_failure`.
    pub async fn run(
        &self,
        process: Arc<dyn MessageHandler>,
        on_success: Arc<dyn MessageHandler>,
        on_failure: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let handler = Arc::new(IntakeHandler {
            process,
            on_success,
            on_failure,
            events: Arc::clone(&self.events),
        });
        self.client
            .run(handler)
            .await
            .map_err(|source| CascadeError::Consumer {
                operation: "run",
                source,
            })
    }

    pub async fn pause(&self) -> Result<()> {
        self.client
            .pause()
            .await
            .map_err(|source| CascadeError::Consumer {
                operation: "pause",
                source,
            })
    }

    pub async fn resume(&self) -> Result<()> {
        self.client
            .resume()
            .await
            .map_err(|source| CascadeError::Consumer {
                operation: "resume",
                source,
            })
    }

    pub async fn stop(&self) -> Result<()> {
        self.client
            .stop()
            .await
            .map_err(|source| CascadeError::Consumer {
                operation: "stop",
                source,
            })
    }
}

struct IntakeHandler {
    process: Arc<dyn MessageHandler>,
    on_success: Arc<dyn MessageHandler>,
    on_failure: Arc<dyn MessageHandler>,
    events: Arc<EventBus>,
}

#[async_trait]
impl MessageHandler for IntakeHandler {
    async fn handle(&self, mut message: Message) -> anyhow::Result<()> {
        // First entry into the routing path
        if !message.headers.contains_key(CASCADE_METADATA_HEADER) {
            envelope::write_into(&mut message.headers, &RetryEnvelope::fresh());
        }

        self.events.publish(CascadeEvent::Receive(message.clone()));

        match self.process.handle(message.clone()).await {
            Ok(()) => self.on_success.handle(message).await,
            Err(e) => {
                debug!(topic = %message.topic, offset = message.offset, error = %e, "Processing failed, routing for retry");
                self.on_failure.handle(message).await
            }
        }
    }
}
