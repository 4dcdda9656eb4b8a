//! Producer half of the cascade: republishes failed messages to the next
//! retry topic or hands them to the dead-letter sink.

use crate::cascade::events::{CascadeEvent, EventBus};
use crate::cascade::options::RetryLevelOptions;
use crate::cascade::topics::RetryTopicSequence;
use crate::error::{CascadeError, Result};
use crate::messages::envelope;
use crate::messages::{Message, OutboundMessage, ProducerRecord, RecordMetadata};
use crate::transport::{MessageHandler, ProducerClient};
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};

/// Why a message ended up in the dead-letter sink.
#[derive(Debug, Clone)]
pub enum DeadLetterReason {
    /// Every configured retry level was used
    Exhausted { retries: u32 },
    /// The retry envelope was missing or unreadable
    MalformedMetadata(CascadeError),
}

/// Result of routing one failed message.
#[derive(Debug, Clone)]
pub enum RouteOutcome {
    Retried {
        topic: String,
        retries: u32,
        ack: Vec<RecordMetadata>,
    },
    DeadLettered { reason: DeadLetterReason },
}

impl RouteOutcome {
    pub fn is_retried(&self) -> bool {
        matches!(self, RouteOutcome::Retried { .. })
    }

    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, RouteOutcome::DeadLettered { .. })
    }
}

/// Topic sequence and level options, swapped as one value.
#[derive(Debug)]
struct RoutingTable {
    sequence: RetryTopicSequence,
    options: RetryLevelOptions,
}

pub struct RetryRouter {
    producer: Arc<dyn ProducerClient>,
    dead_letter: Arc<dyn MessageHandler>,
    events: Arc<EventBus>,
    table: ArcSwap<RoutingTable>,
    paused: AtomicBool,
    stopped: AtomicBool,
    resumed: Notify,
    in_flight: AtomicUsize,
    drained: Notify,
}

/// Counts a route call as in flight until dropped.
struct InFlight<'a> {
    router: &'a RetryRouter,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.router.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.router.drained.notify_waiters();
        }
    }
}

impl RetryRouter {
    pub fn new(
        producer: Arc<dyn ProducerClient>,
        dead_letter: Arc<dyn MessageHandler>,
        events: Arc<EventBus>,
        base_topic: &str,
    ) -> Self {
        Self {
            producer,
            dead_letter,
            events,
            table: ArcSwap::from_pointee(RoutingTable {
                sequence: RetryTopicSequence::empty(base_topic),
                options: RetryLevelOptions::default(),
            }),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            resumed: Notify::new(),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    pub async fn connect(&self) -> Result<()> {
        self.producer
            .connect()
            .await
            .map_err(|source| CascadeError::Connection {
                operation: "connect producer",
                source,
            })
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.producer
            .disconnect()
            .await
            .map_err(|source| CascadeError::Connection {
                operation: "disconnect producer",
                source,
            })
    }

    /// Replace the active sequence and options in one atomic swap.
    ///
    /// Route calls that already loaded the previous table finish with it.
    pub fn configure_topics(&self, sequence: RetryTopicSequence, options: RetryLevelOptions) {
        info!(levels = sequence.len(), "Retry topics configured");
        self.table
            .store(Arc::new(RoutingTable { sequence, options }));
    }

    /// Currently active sequence
    pub fn sequence(&self) -> RetryTopicSequence {
        self.table.load().sequence.clone()
    }

    /// Currently active level options
    pub fn options(&self) -> RetryLevelOptions {
        self.table.load().options.clone()
    }

    /// Gate new publishes. Returns false if already paused.
    pub fn pause(&self) -> bool {
        if self.paused.swap(true, Ordering::SeqCst) {
            warn!("Retry router pause called while already paused");
            return false;
        }
        debug!("Retry router paused");
        true
    }

    /// Open the gate again. Returns false if already running.
    pub fn resume(&self) -> bool {
        if !self.paused.swap(false, Ordering::SeqCst) {
            warn!("Retry router resume called while already running");
            return false;
        }
        self.resumed.notify_waiters();
        debug!("Retry router resumed");
        true
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Accept work again after a stop, clearing any pause
    pub fn start(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.stopped.store(false, Ordering::SeqCst);
    }

    /// Refuse new work without waiting for in-flight hops
    pub fn halt(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.resumed.notify_waiters();
    }

    /// Refuse new work and wait for in-flight hops to finish
    pub async fn stop(&self) {
        self.halt();
        loop {
            let drained = self.drained.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            debug!(
                in_flight = self.in_flight.load(Ordering::SeqCst),
                "Waiting for in-flight retries"
            );
            drained.await;
        }
        info!("Retry router stopped");
    }

    async fn admit(&self) -> Result<InFlight<'_>> {
        loop {
            let resumed = self.resumed.notified();
            if self.is_stopped() {
                return Err(CascadeError::Stopped);
            }
            if !self.is_paused() {
                break;
            }
            debug!("Retry router paused, holding message until resume");
            resumed.await;
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight { router: self };
        // stop() may have started between the check and the increment
        if self.is_stopped() {
            return Err(CascadeError::Stopped);
        }
        Ok(guard)
    }

    /// Route a message whose processing failed.
    ///
    /// With `retries < levels` the message is republished to the next retry
    /// topic with its retry count bumped by one. Otherwise it goes to the
    /// dead-letter sink unchanged. A message without a readable envelope is
    /// dead-lettered as well and reported on the `error` event.
    #[instrument(level = "debug", skip(self, message), fields(topic = %message.topic, offset = message.offset))]
    pub async fn route(&self, message: Message) -> Result<RouteOutcome> {
        let _in_flight = self.admit().await?;
        let table = self.table.load_full();

        let current = match envelope::decode(&message.headers) {
            Ok(current) => current,
            Err(err) => {
                error!(topic = %message.topic, error = %err, "Unreadable cascade metadata, dead-lettering message");
                self.events.publish(CascadeEvent::Error {
                    operation: "route",
                    error: err.clone(),
                });
                self.dead_letter(message).await;
                return Ok(RouteOutcome::DeadLettered {
                    reason: DeadLetterReason::MalformedMetadata(err),
                });
            }
        };

        let Some(target) = table.sequence.get(current.retries as usize) else {
            info!(
                topic = %message.topic,
                retries = current.retries,
                levels = table.sequence.len(),
                "Retry levels exhausted, sending to dead-letter sink"
            );
            self.dead_letter(message).await;
            return Ok(RouteOutcome::DeadLettered {
                reason: DeadLetterReason::Exhausted {
                    retries: current.retries,
                },
            });
        };
        let target = target.to_string();

        let next = current.next_hop(&message.topic);
        let mut outgoing = message;
        outgoing.topic = target.clone();
        envelope::write_into(&mut outgoing.headers, &next);

        let record = ProducerRecord::new(target.clone(), vec![OutboundMessage::from(&outgoing)])
            .with_settings(table.options.for_level(next.retries as usize));

        let ack = self.producer.send(record).await.map_err(|source| {
            error!(topic = %target, error = %source, "Failed to publish retry");
            CascadeError::Send {
                topic: target.clone(),
                source,
            }
        })?;

        debug!(topic = %target, retries = next.retries, "Message republished for retry");
        self.events.publish(CascadeEvent::Retry(outgoing));

        Ok(RouteOutcome::Retried {
            topic: target,
            retries: next.retries,
            ack,
        })
    }

    async fn dead_letter(&self, message: Message) {
        self.events.publish(CascadeEvent::Dlq(message.clone()));
        // The sink owns its own durability; its failure does not undo the routing decision
        if let Err(e) = self.dead_letter.handle(message).await {
            warn!(error = %e, "Dead-letter sink reported a failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Headers, RetryEnvelope};
    use crate::transport::{handler_fn, MemoryBroker, MessagingClient};
    use std::sync::Mutex;
    use std::time::Duration;

    fn message_with_retries(topic: &str, retries: u32) -> Message {
        let mut headers = Headers::new();
        envelope::write_into(
            &mut headers,
            &RetryEnvelope {
                retries,
                ..RetryEnvelope::fresh()
            },
        );
        Message {
            headers,
            ..Message::new(topic, Some("k".to_string()), "v")
        }
    }

    async fn router_with(
        broker: &MemoryBroker,
        levels: usize,
    ) -> (Arc<RetryRouter>, Arc<Mutex<Vec<Message>>>) {
        let dead = Arc::new(Mutex::new(Vec::new()));
        let sink_store = Arc::clone(&dead);
        let sink = handler_fn(move |msg: Message| {
            let sink_store = Arc::clone(&sink_store);
            async move {
                sink_store.lock().unwrap().push(msg);
                Ok(())
            }
        });
        let router = Arc::new(RetryRouter::new(
            broker.producer(),
            sink,
            Arc::new(EventBus::new()),
            "orders",
        ));
        let sequence = RetryTopicSequence::generate("orders", levels);
        for topic in sequence.iter() {
            broker.create_topic(topic).await;
        }
        router.configure_topics(sequence, RetryLevelOptions::default());
        router.connect().await.unwrap();
        (router, dead)
    }

    #[tokio::test]
    async fn test_route_publishes_to_next_level() {
        let broker = MemoryBroker::new();
        let (router, dead) = router_with(&broker, 3).await;

        let outcome = router.route(message_with_retries("orders", 0)).await.unwrap();
        match outcome {
            RouteOutcome::Retried { topic, retries, .. } => {
                assert_eq!(topic, "orders-cascade-retry-1");
                assert_eq!(retries, 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let stored = broker.messages("orders-cascade-retry-1").await;
        assert_eq!(stored.len(), 1);
        let env = envelope::decode(&stored[0].headers).unwrap();
        assert_eq!(env.retries, 1);
        assert_eq!(env.topic_arr, vec!["orders"]);
        assert!(dead.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_route_exhausted_goes_to_dead_letter_unchanged() {
        let broker = MemoryBroker::new();
        let (router, dead) = router_with(&broker, 2).await;
        let original = message_with_retries("orders-cascade-retry-2", 2);

        let outcome = router.route(original.clone()).await.unwrap();
        assert!(outcome.is_dead_lettered());
        assert_eq!(dead.lock().unwrap().as_slice(), &[original]);
        assert!(broker.accepted_records().await.is_empty());
    }

    #[tokio::test]
    async fn test_zero_levels_dead_letters_immediately() {
        let broker = MemoryBroker::new();
        let (router, dead) = router_with(&broker, 0).await;
        let outcome = router.route(message_with_retries("orders", 0)).await.unwrap();
        assert!(outcome.is_dead_lettered());
        assert_eq!(dead.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_metadata_is_dead_lettered_and_reported() {
        let broker = MemoryBroker::new();
        let (router, dead) = router_with(&broker, 3).await;
        let mut errors = router.events.stream();

        let bad = Message::new("orders", None, "v").with_header(envelope::CASCADE_METADATA_HEADER, "{oops");
        let outcome = router.route(bad).await.unwrap();

        assert!(matches!(
            outcome,
            RouteOutcome::DeadLettered {
                reason: DeadLetterReason::MalformedMetadata(CascadeError::MetadataParse { .. })
            }
        ));
        assert_eq!(dead.lock().unwrap().len(), 1);
        let event = errors.recv().await.unwrap();
        assert!(matches!(event, CascadeEvent::Error { operation: "route", .. }));
    }

    #[tokio::test]
    async fn test_send_failure_is_propagated() {
        let broker = MemoryBroker::new();
        let (router, _dead) = router_with(&broker, 1).await;
        broker
            .inject_fault(
                crate::transport::FaultPoint::Send,
                crate::transport::TransportError::Unavailable("leader moved".to_string()),
            )
            .await;

        let err = router.route(message_with_retries("orders", 0)).await.unwrap_err();
        assert!(matches!(err, CascadeError::Send { ref topic, .. } if topic == "orders-cascade-retry-1"));
    }

    #[tokio::test]
    async fn test_pause_is_idempotent_and_holds_routes() {
        let broker = MemoryBroker::new();
        let (router, _dead) = router_with(&broker, 1).await;

        assert!(router.pause());
        assert!(!router.pause());

        let pending = tokio::spawn({
            let router = Arc::clone(&router);
            async move { router.route(message_with_retries("orders", 0)).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(broker.messages("orders-cascade-retry-1").await.is_empty());

        assert!(router.resume());
        assert!(!router.resume());
        let outcome = pending.await.unwrap().unwrap();
        assert!(outcome.is_retried());
        assert_eq!(broker.messages("orders-cascade-retry-1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_stopped_router_rejects_new_work() {
        let broker = MemoryBroker::new();
        let (router, _dead) = router_with(&broker, 1).await;
        router.stop().await;
        let err = router.route(message_with_retries("orders", 0)).await.unwrap_err();
        assert!(matches!(err, CascadeError::Stopped));

        router.start();
        assert!(router.route(message_with_retries("orders", 0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_level_settings_are_passed_through() {
        let broker = MemoryBroker::new();
        let (router, _dead) = router_with(&broker, 2).await;
        router.configure_topics(
            router.sequence(),
            RetryLevelOptions::new(vec![Duration::from_secs(1), Duration::from_secs(5)], vec![50, 10]),
        );

        router.route(message_with_retries("orders-cascade-retry-1", 1)).await.unwrap();
        let records = broker.accepted_records().await;
        assert_eq!(records[0].topic, "orders-cascade-retry-2");
        assert_eq!(records[0].settings.timeout, Some(Duration::from_secs(5)));
        assert_eq!(records[0].settings.batch_limit, Some(10));
    }
}
