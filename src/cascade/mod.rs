//! Retry cascade: the intake consumer, the retry router and the service
//! that drives them.

pub mod consumer;
pub mod events;
pub mod options;
pub mod router;
pub mod service;
pub mod topics;

pub use consumer::IntakeConsumer;
pub use events::{CascadeEvent, EventBus, EventKind, Listener, SubscriptionId};
pub use options::RetryLevelOptions;
pub use router::{DeadLetterReason, RetryRouter, RouteOutcome};
pub use service::{CascadeService, LifecycleState};
pub use topics::{cascade_topic_pattern, retry_topic_name, RetryTopicSequence};
