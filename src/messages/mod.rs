pub mod envelope;
pub mod types;

pub use envelope::{RetryEnvelope, CASCADE_METADATA_HEADER};
pub use types::{
    Headers, LevelSettings, Message, OutboundMessage, ProducerRecord, RecordMetadata,
};
