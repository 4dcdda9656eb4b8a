use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Message headers keyed by name. Values are UTF-8 strings.
pub type Headers = BTreeMap<String, String>;

/// A record delivered by a consumer client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: Vec<u8>,
    pub headers: Headers,
}

impl Message {
    /// Create a message for `topic` with no headers
    pub fn new(topic: impl Into<String>, key: Option<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            partition: 0,
            offset: 0,
            key,
            value: value.into(),
            headers: Headers::new(),
        }
    }

    /// Add a header, replacing any existing value
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Get a header value by name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Payload as text, replacing invalid UTF-8
    pub fn value_lossy(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// A single message inside a [`ProducerRecord`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub key: Option<String>,
    pub value: Vec<u8>,
    pub headers: Headers,
}

impl From<&Message> for OutboundMessage {
    fn from(message: &Message) -> Self {
        Self {
            key: message.key.clone(),
            value: message.value.clone(),
            headers: message.headers.clone(),
        }
    }
}

/// Client-side settings for one retry level, passed through untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LevelSettings {
    pub timeout: Option<Duration>,
    pub batch_limit: Option<u32>,
}

/// Publish request handed to a producer client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub topic: String,
    pub messages: Vec<OutboundMessage>,
    pub settings: LevelSettings,
}

impl ProducerRecord {
    pub fn new(topic: impl Into<String>, messages: Vec<OutboundMessage>) -> Self {
        Self {
            topic: topic.into(),
            messages,
            settings: LevelSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: LevelSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// Acknowledgment returned by a producer client for one topic partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub base_offset: i64,
}
