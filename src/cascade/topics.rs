use regex::Regex;
use std::sync::Arc;

/// Infix between the base topic and the 1-based retry level.
pub const RETRY_TOPIC_INFIX: &str = "-cascade-retry-";

/// Name of the retry topic for `level` (1-based).
pub fn retry_topic_name(base: &str, level: usize) -> String {
    format!("{}{}{}", base, RETRY_TOPIC_INFIX, level)
}

/// Pattern matching `base` and every retry topic derived from it.
pub fn cascade_topic_pattern(base: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(
        "^{}(?:{}[0-9]+)?$",
        regex::escape(base),
        regex::escape(RETRY_TOPIC_INFIX)
    ))
}

/// Ordered, immutable list of retry topic names for one base topic.
///
/// Index `i` holds the topic for retry level `i + 1`. Resizing produces a new
/// value; existing names are carried over, never regenerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTopicSequence {
    base: String,
    topics: Arc<[String]>,
}

impl RetryTopicSequence {
    /// Sequence with no retry levels
    pub fn empty(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            topics: Arc::from(Vec::new()),
        }
    }

    /// Sequence with `count` levels
    pub fn generate(base: impl Into<String>, count: usize) -> Self {
        Self::empty(base).resized(count)
    }

    /// New sequence with `count` levels: truncated, or extended by appending
    pub fn resized(&self, count: usize) -> Self {
        let keep = count.min(self.topics.len());
        let mut topics: Vec<String> = self.topics[..keep].to_vec();
        topics.extend((topics.len() + 1..=count).map(|level| retry_topic_name(&self.base, level)));
        Self {
            base: self.base.clone(),
            topics: Arc::from(topics),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Topic at zero-based `index`
    pub fn get(&self, index: usize) -> Option<&str> {
        self.topics.get(index).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.topics
    }
}
