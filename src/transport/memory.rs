//! In-process broker implementing the producer, consumer and admin traits.
//!
//! Topics are append-only logs with a single partition. Consumer groups keep
//! a committed offset per topic, so a record is delivered once per group even
//! across pause/resume or a restart of the delivery loop. The offset only
//! advances once the handler accepts a record; a failed record is redelivered
//! after a short backoff. Faults can be injected per operation; each injected
//! fault fires exactly once.

use crate::messages::{Message, ProducerRecord, RecordMetadata};
use crate::transport::error::{Result, TransportError};
use crate::transport::{
    AdminClient, ConsumerClient, CreateTopicsRequest, MessageHandler, MessagingClient,
    ProducerClient,
};
use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Delay before a record whose handler failed is delivered again
const REDELIVERY_BACKOFF: Duration = Duration::from_millis(50);

/// Operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    ProducerConnect,
    ProducerDisconnect,
    Send,
    ConsumerConnect,
    ConsumerDisconnect,
    Subscribe,
    ConsumerRun,
    ConsumerPause,
    ConsumerResume,
    ConsumerStop,
    AdminConnect,
    CreateTopics,
    ListTopics,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<String>,
    value: Vec<u8>,
    headers: crate::messages::Headers,
}

#[derive(Default)]
struct BrokerState {
    topics: BTreeMap<String, Vec<StoredRecord>>,
    // (group, topic) -> next offset to deliver
    committed: HashMap<(String, String), usize>,
    faults: HashMap<FaultPoint, TransportError>,
    accepted: Vec<ProducerRecord>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    appended: Notify,
    auto_create_topics: bool,
}

/// Shared handle to an in-memory broker. Clones refer to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Broker that rejects sends to topics that were never created
    pub fn new() -> Self {
        Self::with_auto_create_topics(false)
    }

    pub fn with_auto_create_topics(auto_create_topics: bool) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                appended: Notify::new(),
                auto_create_topics,
            }),
        }
    }

    /// Create a topic if it does not exist. Returns true if it was created.
    pub async fn create_topic(&self, topic: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.topics.contains_key(topic) {
            return false;
        }
        state.topics.insert(topic.to_string(), Vec::new());
        debug!(topic = %topic, "Created topic");
        true
    }

    /// Names of all topics, sorted
    pub async fn topics(&self) -> Vec<String> {
        self.inner.state.lock().await.topics.keys().cloned().collect()
    }

    /// Every record currently stored in `topic`
    pub async fn messages(&self, topic: &str) -> Vec<Message> {
        let state = self.inner.state.lock().await;
        state
            .topics
            .get(topic)
            .map(|records| {
                records
                    .iter()
                    .enumerate()
                    .map(|(offset, record)| to_message(topic, offset, record))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every publish request the broker accepted, in order
    pub async fn accepted_records(&self) -> Vec<ProducerRecord> {
        self.inner.state.lock().await.accepted.clone()
    }

    /// Next offset `group` will read from `topic`
    pub async fn committed_offset(&self, group: &str, topic: &str) -> usize {
        let state = self.inner.state.lock().await;
        state
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Make the next call at `point` fail with `error`
    pub async fn inject_fault(&self, point: FaultPoint, error: TransportError) {
        self.inner.state.lock().await.faults.insert(point, error);
    }

    async fn check_fault(&self, point: FaultPoint) -> Result<()> {
        match self.inner.state.lock().await.faults.remove(&point) {
            Some(error) => {
                warn!(?point, error = %error, "Injected fault triggered");
                Err(error)
            }
            None => Ok(()),
        }
    }

    async fn append(&self, record: ProducerRecord) -> Result<Vec<RecordMetadata>> {
        let mut state = self.inner.state.lock().await;

        if !state.topics.contains_key(&record.topic) {
            if !self.inner.auto_create_topics {
                return Err(TransportError::UnknownTopic(record.topic.clone()));
            }
            debug!(topic = %record.topic, "Auto-creating topic on first send");
            state.topics.insert(record.topic.clone(), Vec::new());
        }

        let log = state.topics.entry(record.topic.clone()).or_default();
        let base_offset = log.len() as i64;
        log.extend(record.messages.iter().map(|m| StoredRecord {
            key: m.key.clone(),
            value: m.value.clone(),
            headers: m.headers.clone(),
        }));

        let metadata = RecordMetadata {
            topic: record.topic.clone(),
            partition: 0,
            base_offset,
        };
        state.accepted.push(record);
        drop(state);

        self.inner.appended.notify_waiters();
        Ok(vec![metadata])
    }

    async fn next_for_group(&self, group: &str, pattern: &Regex) -> Option<Message> {
        let state = self.inner.state.lock().await;
        for (topic, records) in state.topics.iter() {
            if !pattern.is_match(topic) {
                continue;
            }
            let offset = state
                .committed
                .get(&(group.to_string(), topic.clone()))
                .copied()
                .unwrap_or(0);
            if let Some(record) = records.get(offset) {
                return Some(to_message(topic, offset, record));
            }
        }
        None
    }

    async fn commit(&self, group: &str, topic: &str, next_offset: usize) {
        let mut state = self.inner.state.lock().await;
        state
            .committed
            .insert((group.to_string(), topic.to_string()), next_offset);
    }
}

fn to_message(topic: &str, offset: usize, record: &StoredRecord) -> Message {
    Message {
        topic: topic.to_string(),
        partition: 0,
        offset: offset as i64,
        key: record.key.clone(),
        value: record.value.clone(),
        headers: record.headers.clone(),
    }
}

impl MessagingClient for MemoryBroker {
    fn producer(&self) -> Arc<dyn ProducerClient> {
        Arc::new(MemoryProducer {
            broker: self.clone(),
            connected: AtomicBool::new(false),
        })
    }

    fn consumer(&self, group_id: &str) -> Arc<dyn ConsumerClient> {
        let (control, _) = watch::channel(ConsumerControl::default());
        Arc::new(MemoryConsumer {
            broker: self.clone(),
            group_id: group_id.to_string(),
            connected: AtomicBool::new(false),
            pattern: Mutex::new(None),
            control,
            task: Mutex::new(None),
        })
    }

    fn admin(&self) -> Arc<dyn AdminClient> {
        Arc::new(MemoryAdmin {
            broker: self.clone(),
            connected: AtomicBool::new(false),
        })
    }
}

struct MemoryProducer {
    broker: MemoryBroker,
    connected: AtomicBool,
}

#[async_trait]
impl ProducerClient for MemoryProducer {
    async fn connect(&self) -> Result<()> {
        self.broker.check_fault(FaultPoint::ProducerConnect).await?;
        self.connected.store(true, Ordering::SeqCst);
        debug!("Producer connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.broker.check_fault(FaultPoint::ProducerDisconnect).await?;
        self.connected.store(false, Ordering::SeqCst);
        debug!("Producer disconnected");
        Ok(())
    }

    #[instrument(level = "debug", skip(self, record), fields(topic = %record.topic, count = record.messages.len()))]
    async fn send(&self, record: ProducerRecord) -> Result<Vec<RecordMetadata>> {
        self.broker.check_fault(FaultPoint::Send).await?;
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.broker.append(record).await
    }
}

struct MemoryAdmin {
    broker: MemoryBroker,
    connected: AtomicBool,
}

impl MemoryAdmin {
    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

#[async_trait]
impl AdminClient for MemoryAdmin {
    async fn connect(&self) -> Result<()> {
        self.broker.check_fault(FaultPoint::AdminConnect).await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn create_topics(&self, request: CreateTopicsRequest) -> Result<bool> {
        self.broker.check_fault(FaultPoint::CreateTopics).await?;
        self.ensure_connected()?;

        let mut created_any = false;
        for spec in &request.topics {
            created_any |= self.broker.create_topic(&spec.topic).await;
        }
        info!(
            requested = request.topics.len(),
            created_any, "Admin create_topics completed"
        );
        Ok(created_any)
    }

    async fn list_topics(&self) -> Result<Vec<String>> {
        self.broker.check_fault(FaultPoint::ListTopics).await?;
        self.ensure_connected()?;
        Ok(self.broker.topics().await)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ConsumerControl {
    paused: bool,
    stopped: bool,
}

struct MemoryConsumer {
    broker: MemoryBroker,
    group_id: String,
    connected: AtomicBool,
    pattern: Mutex<Option<Regex>>,
    control: watch::Sender<ConsumerControl>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryConsumer {
    async fn halt(&self) {
        // A stopped consumer starts unpaused on its next run
        self.control.send_modify(|c| {
            c.stopped = true;
            c.paused = false;
        });
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(group = %self.group_id, error = %e, "Delivery loop ended abnormally");
            }
        }
    }
}

#[async_trait]
impl ConsumerClient for MemoryConsumer {
    async fn connect(&self) -> Result<()> {
        self.broker.check_fault(FaultPoint::ConsumerConnect).await?;
        self.connected.store(true, Ordering::SeqCst);
        debug!(group = %self.group_id, "Consumer connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.broker.check_fault(FaultPoint::ConsumerDisconnect).await?;
        self.halt().await;
        self.connected.store(false, Ordering::SeqCst);
        debug!(group = %self.group_id, "Consumer disconnected");
        Ok(())
    }

    async fn subscribe(&self, pattern: Regex) -> Result<()> {
        self.broker.check_fault(FaultPoint::Subscribe).await?;
        debug!(group = %self.group_id, pattern = %pattern, "Consumer subscribed");
        *self.pattern.lock().await = Some(pattern);
        Ok(())
    }

    async fn run(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.broker.check_fault(FaultPoint::ConsumerRun).await?;
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let pattern = self
            .pattern
            .lock()
            .await
            .clone()
            .ok_or(TransportError::NotSubscribed)?;

        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(TransportError::AlreadyRunning);
        }

        // Keep a pause requested while run was pending
        self.control.send_modify(|c| c.stopped = false);
        let control = self.control.subscribe();
        let broker = self.broker.clone();
        let group = self.group_id.clone();

        *task = Some(tokio::spawn(delivery_loop(
            broker, group, pattern, handler, control,
        )));
        info!(group = %self.group_id, "Consumer delivery loop started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.broker.check_fault(FaultPoint::ConsumerStop).await?;
        self.halt().await;
        info!(group = %self.group_id, "Consumer stopped");
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.broker.check_fault(FaultPoint::ConsumerPause).await?;
        self.control.send_modify(|c| c.paused = true);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.broker.check_fault(FaultPoint::ConsumerResume).await?;
        self.control.send_modify(|c| c.paused = false);
        Ok(())
    }
}

async fn delivery_loop(
    broker: MemoryBroker,
    group: String,
    pattern: Regex,
    handler: Arc<dyn MessageHandler>,
    mut control: watch::Receiver<ConsumerControl>,
) {
    loop {
        let current = match control.wait_for(|c| c.stopped || !c.paused).await {
            Ok(current) => *current,
            Err(_) => break,
        };
        if current.stopped {
            break;
        }

        // Register for wakeups before looking, so an append in between is not missed
        let appended = broker.inner.appended.notified();

        match broker.next_for_group(&group, &pattern).await {
            Some(message) => {
                let topic = message.topic.clone();
                let offset = message.offset as usize;
                match handler.handle(message).await {
                    Ok(()) => broker.commit(&group, &topic, offset + 1).await,
                    Err(e) => {
                        warn!(group = %group, topic = %topic, offset, error = %e, "Message handler failed, redelivering");
                        tokio::select! {
                            _ = tokio::time::sleep(REDELIVERY_BACKOFF) => {}
                            changed = control.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = appended => {}
                    changed = control.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!(group = %group, "Delivery loop exited");
}
