//! Retry envelope codec.
//!
//! The envelope rides in the `cascadeMetadata` header as a JSON object with
//! `status`, `retries` and `topicArr` fields. Fields this crate does not know
//! about are kept and written back unchanged.

use crate::error::{CascadeError, Result};
use crate::messages::Headers;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::trace;

/// Header carrying the serialized [`RetryEnvelope`].
pub const CASCADE_METADATA_HEADER: &str = "cascadeMetadata";

/// Status written on first entry into the routing path.
pub const STATUS_RECEIVED: &str = "received";
/// Status written on every retry hop.
pub const STATUS_RETRY: &str = "retry";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct RetryEnvelope {
    #[serde(default)]
    pub status: String,
    pub retries: u32,
    #[serde(rename = "topicArr", default)]
    pub topic_arr: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RetryEnvelope {
    /// Envelope for a message that has not been retried yet
    pub fn fresh() -> Self {
        Self {
            status: STATUS_RECEIVED.to_string(),
            ..Self::default()
        }
    }

    /// Envelope for the next hop: one more retry, `from_topic` recorded
    pub fn next_hop(&self, from_topic: &str) -> Self {
        let mut next = self.clone();
        next.retries += 1;
        next.status = STATUS_RETRY.to_string();
        next.topic_arr.push(from_topic.to_string());
        next
    }
}

/// Read the envelope out of a header map.
pub fn decode(headers: &Headers) -> Result<RetryEnvelope> {
    let raw = headers
        .get(CASCADE_METADATA_HEADER)
        .ok_or_else(|| CascadeError::MetadataParse {
            reason: format!("missing '{}' header", CASCADE_METADATA_HEADER),
        })?;

    let envelope: RetryEnvelope =
        serde_json::from_str(raw).map_err(|e| CascadeError::MetadataParse {
            reason: format!("malformed '{}' header: {}", CASCADE_METADATA_HEADER, e),
        })?;

    trace!(retries = envelope.retries, "Decoded cascade metadata");
    Ok(envelope)
}

/// Serialize the envelope into its header value.
pub fn encode(envelope: &RetryEnvelope) -> String {
    let mut object = envelope.extra.clone();
    object.insert("status".to_string(), Value::from(envelope.status.clone()));
    object.insert("retries".to_string(), Value::from(envelope.retries));
    object.insert(
        "topicArr".to_string(),
        Value::Array(
            envelope
                .topic_arr
                .iter()
                .map(|t| Value::from(t.as_str()))
                .collect(),
        ),
    );
    Value::Object(object).to_string()
}

/// Write the envelope into `headers`, leaving every other header alone.
pub fn write_into(headers: &mut Headers, envelope: &RetryEnvelope) {
    headers.insert(CASCADE_METADATA_HEADER.to_string(), encode(envelope));
}
