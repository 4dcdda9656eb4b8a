//! Common test utilities shared by the cascade integration tests
#![allow(dead_code)]

use cascade::cascade::{CascadeEvent, CascadeService, EventKind};
use cascade::messages::{envelope, Headers, Message, OutboundMessage, ProducerRecord, RetryEnvelope};
use async_trait::async_trait;
use cascade::transport::{
    handler_fn, AdminClient, ConsumerClient, MemoryBroker, MessageHandler, MessagingClient,
    ProducerClient, TransportError,
};
use regex::Regex;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};

pub const TIMEOUT: Duration = Duration::from_secs(2);

/// Collects every message handed to a sink
#[derive(Clone, Default)]
pub struct Recorder {
    messages: Arc<Mutex<Vec<Message>>>,
}

impl Recorder {
    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        let messages = Arc::clone(&self.messages);
        handler_fn(move |msg: Message| {
            let messages = Arc::clone(&messages);
            async move {
                messages.lock().unwrap().push(msg);
                Ok(())
            }
        })
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

/// A service wired to an in-memory broker with recording sinks
pub struct Harness {
    pub broker: MemoryBroker,
    pub service: CascadeService,
    pub succeeded: Recorder,
    pub dead_lettered: Recorder,
}

impl Harness {
    /// Disconnected service over a broker where `topic` already exists
    pub async fn new(topic: &str, processor: Arc<dyn MessageHandler>) -> Self {
        Self::with_broker(MemoryBroker::new(), topic, processor).await
    }

    pub async fn with_broker(
        broker: MemoryBroker,
        topic: &str,
        processor: Arc<dyn MessageHandler>,
    ) -> Self {
        let client = Arc::new(broker.clone());
        Self::with_client(broker, client, topic, processor).await
    }

    /// Service built on `client`, with `broker` as the backing store to inspect
    pub async fn with_client(
        broker: MemoryBroker,
        client: Arc<dyn MessagingClient>,
        topic: &str,
        processor: Arc<dyn MessageHandler>,
    ) -> Self {
        broker.create_topic(topic).await;
        let succeeded = Recorder::default();
        let dead_lettered = Recorder::default();
        let service = CascadeService::new(
            client,
            topic,
            format!("{}-group", topic),
            processor,
            succeeded.handler(),
            dead_lettered.handler(),
        );
        Self {
            broker,
            service,
            succeeded,
            dead_lettered,
        }
    }

    /// Connected, provisioned with `levels` retry topics and running
    pub async fn running(topic: &str, levels: usize, processor: Arc<dyn MessageHandler>) -> Self {
        let harness = Self::new(topic, processor).await;
        harness.service.connect().await.expect("connect");
        harness
            .service
            .configure_retry_levels(levels, None)
            .await
            .expect("configure retry levels");
        harness.service.run().await.expect("run");
        harness
    }

    /// Publish one message to the primary topic
    pub async fn produce(&self, value: &str) {
        self.produce_with_headers(value, Headers::new()).await;
    }

    pub async fn produce_with_headers(&self, value: &str, headers: Headers) {
        produce(&self.broker, self.service.topic(), value, headers).await;
    }
}

pub async fn produce(broker: &MemoryBroker, topic: &str, value: &str, headers: Headers) {
    let producer = broker.producer();
    producer.connect().await.expect("test producer connect");
    producer
        .send(ProducerRecord::new(
            topic,
            vec![OutboundMessage {
                key: Some(format!("key-{}", value)),
                value: value.as_bytes().to_vec(),
                headers,
            }],
        ))
        .await
        .expect("test producer send");
}

pub fn always_ok() -> Arc<dyn MessageHandler> {
    handler_fn(|_msg: Message| async { Ok(()) })
}

pub fn always_fail() -> Arc<dyn MessageHandler> {
    handler_fn(|_msg: Message| async { Err(anyhow::anyhow!("processing failed")) })
}

/// Processor that fails until a message has been retried `retries` times
pub fn fail_until_retries(retries: u32) -> Arc<dyn MessageHandler> {
    handler_fn(move |msg: Message| async move {
        if retries_of(&msg) < retries {
            anyhow::bail!("not yet");
        }
        Ok(())
    })
}

pub fn envelope_of(msg: &Message) -> RetryEnvelope {
    envelope::decode(&msg.headers).expect("message carries cascade metadata")
}

pub fn retries_of(msg: &Message) -> u32 {
    envelope_of(msg).retries
}

pub fn headers_with_retries(retries: u32) -> Headers {
    let mut headers = Headers::new();
    envelope::write_into(
        &mut headers,
        &RetryEnvelope {
            retries,
            ..RetryEnvelope::fresh()
        },
    );
    headers
}

/// Wait for the next event of `kind`, skipping others
pub async fn next_event(rx: &mut broadcast::Receiver<CascadeEvent>, kind: EventKind) -> CascadeEvent {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            let event = rx.recv().await.expect("event stream open");
            if event.kind() == kind {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for '{}' event", kind))
}

/// Poll `condition` until it holds or the timeout expires
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Client over a [`MemoryBroker`] whose consumer `run` waits for a permit
/// from `gate` before starting the loop
#[derive(Clone)]
pub struct GatedClient {
    pub broker: MemoryBroker,
    pub gate: Arc<Semaphore>,
}

impl GatedClient {
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    /// Let one pending `run` call through
    pub fn open(&self) {
        self.gate.add_permits(1);
    }
}

impl MessagingClient for GatedClient {
    fn producer(&self) -> Arc<dyn ProducerClient> {
        self.broker.producer()
    }

    fn consumer(&self, group_id: &str) -> Arc<dyn ConsumerClient> {
        Arc::new(GatedConsumer {
            inner: self.broker.consumer(group_id),
            gate: Arc::clone(&self.gate),
        })
    }

    fn admin(&self) -> Arc<dyn AdminClient> {
        self.broker.admin()
    }
}

struct GatedConsumer {
    inner: Arc<dyn ConsumerClient>,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl ConsumerClient for GatedConsumer {
    async fn connect(&self) -> Result<(), TransportError> {
        self.inner.connect().await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.inner.disconnect().await
    }

    async fn subscribe(&self, pattern: Regex) -> Result<(), TransportError> {
        self.inner.subscribe(pattern).await
    }

    async fn run(&self, handler: Arc<dyn MessageHandler>) -> Result<(), TransportError> {
        self.gate
            .acquire()
            .await
            .expect("gate semaphore open")
            .forget();
        self.inner.run(handler).await
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.inner.stop().await
    }

    async fn pause(&self) -> Result<(), TransportError> {
        self.inner.pause().await
    }

    async fn resume(&self) -> Result<(), TransportError> {
        self.inner.resume().await
    }
}
