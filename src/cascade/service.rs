//! Cascade service: ties the intake consumer and the retry router together
//! and drives their shared lifecycle.

use crate::cascade::consumer::IntakeConsumer;
use crate::cascade::events::{CascadeEvent, EventBus, EventKind, SubscriptionId};
use crate::cascade::options::RetryLevelOptions;
use crate::cascade::router::RetryRouter;
use crate::cascade::topics::{cascade_topic_pattern, RetryTopicSequence};
use crate::config::CascadeConfig;
use crate::error::{CascadeError, Result};
use crate::messages::Message;
use crate::transport::{
    CreateTopicsRequest, MessageHandler, MessagingClient, TopicSpec, TransportError,
};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Disconnected,
    Connected,
    Running,
    Paused,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Disconnected => "disconnected",
            LifecycleState::Connected => "connected",
            LifecycleState::Running => "running",
            LifecycleState::Paused => "paused",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

struct ServiceInner {
    id: Uuid,
    client: Arc<dyn MessagingClient>,
    topic: String,
    processor: Arc<dyn MessageHandler>,
    success: Arc<dyn MessageHandler>,
    router: Arc<RetryRouter>,
    consumer: IntakeConsumer,
    events: Arc<EventBus>,
    state: Mutex<LifecycleState>,
    // Serialises lifecycle transitions
    transitions: tokio::sync::Mutex<()>,
    // Serialises retry level reconfiguration
    provisioning: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

/// Retry cascade over one primary topic.
///
/// Cheap to clone; clones share the same service.
#[derive(Clone)]
pub struct CascadeService {
    inner: Arc<ServiceInner>,
}

impl CascadeService {
    pub fn new(
        client: Arc<dyn MessagingClient>,
        topic: impl Into<String>,
        group_id: impl Into<String>,
        processor: Arc<dyn MessageHandler>,
        success: Arc<dyn MessageHandler>,
        dead_letter: Arc<dyn MessageHandler>,
    ) -> Self {
        let topic = topic.into();
        let group_id = group_id.into();
        let events = Arc::new(EventBus::new());

        let router = Arc::new(RetryRouter::new(
            client.producer(),
            dead_letter,
            Arc::clone(&events),
            &topic,
        ));
        let consumer = IntakeConsumer::new(
            client.consumer(&group_id),
            topic.clone(),
            group_id,
            Arc::clone(&events),
        );

        Self {
            inner: Arc::new(ServiceInner {
                id: Uuid::new_v4(),
                client,
                topic,
                processor,
                success,
                router,
                consumer,
                events,
                state: Mutex::new(LifecycleState::Disconnected),
                transitions: tokio::sync::Mutex::new(()),
                provisioning: tokio::sync::Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Build a service for the topic and group named in `config`.
    ///
    /// Retry levels are not provisioned here; call
    /// [`configure_retry_levels`](Self::configure_retry_levels) with
    /// `config.retry_levels` and `config.level_options()`.
    pub fn from_config(
        client: Arc<dyn MessagingClient>,
        config: &CascadeConfig,
        processor: Arc<dyn MessageHandler>,
        success: Arc<dyn MessageHandler>,
        dead_letter: Arc<dyn MessageHandler>,
    ) -> Self {
        Self::new(
            client,
            config.topic.clone(),
            config.group_id.clone(),
            processor,
            success,
            dead_letter,
        )
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn group_id(&self) -> &str {
        self.inner.consumer.group_id()
    }

    pub fn state(&self) -> LifecycleState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn paused(&self) -> bool {
        self.state() == LifecycleState::Paused
    }

    /// Retry topics currently used for routing
    pub fn retry_topics(&self) -> RetryTopicSequence {
        self.inner.router.sequence()
    }

    /// Per-level options currently used for routing
    pub fn level_options(&self) -> RetryLevelOptions {
        self.inner.router.options()
    }

    /// Register a listener by event name.
    ///
    /// Fails with [`CascadeError::UnknownEvent`] for names outside the fixed set.
    pub fn on<F>(&self, name: &str, listener: F) -> Result<SubscriptionId>
    where
        F: Fn(&CascadeEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(name, listener)
    }

    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&CascadeEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(kind, listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Stream of every event published after this call
    pub fn events(&self) -> broadcast::Receiver<CascadeEvent> {
        self.inner.events.stream()
    }

    fn set_state(&self, state: LifecycleState) {
        let mut current = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        debug!(from = %*current, to = %state, "Lifecycle transition");
        *current = state;
    }

    /// Log the failure, publish it on the `error` event and hand it back
    fn report(&self, operation: &'static str, error: CascadeError) -> CascadeError {
        error!(service = %self.inner.id, operation, kind = error.kind(), error = %error, "Cascade service operation failed");
        self.inner.events.publish(CascadeEvent::Error {
            operation,
            error: error.clone(),
        });
        error
    }

    fn ensure_open(&self, operation: &'static str) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(self.report(operation, CascadeError::Closed));
        }
        Ok(())
    }

    fn invalid(&self, operation: &'static str, state: LifecycleState) -> CascadeError {
        self.report(operation, CascadeError::InvalidState { operation, state })
    }

    /// Connect the producer, then the consumer.
    #[instrument(skip(self), fields(service = %self.inner.id, topic = %self.inner.topic))]
    pub async fn connect(&self) -> Result<()> {
        let _transition = self.inner.transitions.lock().await;
        self.ensure_open("connect")?;

        let state = self.state();
        if state != LifecycleState::Disconnected {
            return Err(self.invalid("connect", state));
        }

        if let Err(e) = self.inner.router.connect().await {
            return Err(self.report("connect", e));
        }
        if let Err(e) = self.inner.consumer.connect().await {
            if let Err(rollback) = self.inner.router.disconnect().await {
                warn!(error = %rollback, "Failed to disconnect producer after consumer connect failure");
            }
            return Err(self.report("connect", e));
        }

        self.set_state(LifecycleState::Connected);
        info!("Cascade service connected");
        self.inner.events.publish(CascadeEvent::Connect);
        Ok(())
    }

    /// Resize the retry topic sequence to `count` levels and provision it.
    ///
    /// The new sequence only takes effect once the admin client has created
    /// every topic; on failure the previous sequence stays active.
    #[instrument(skip(self, options), fields(service = %self.inner.id, topic = %self.inner.topic))]
    pub async fn configure_retry_levels(
        &self,
        count: usize,
        options: Option<RetryLevelOptions>,
    ) -> Result<()> {
        let _provisioning = self.inner.provisioning.lock().await;
        self.ensure_open("configureRetryLevels")?;

        let next = self.inner.router.sequence().resized(count);
        if let Err(source) = self.provision(&next).await {
            return Err(self.report(
                "configureRetryLevels",
                CascadeError::TopicProvisioning { source },
            ));
        }

        self.inner
            .router
            .configure_topics(next, options.unwrap_or_default());
        info!(levels = count, "Retry levels configured");
        Ok(())
    }

    async fn provision(
        &self,
        sequence: &RetryTopicSequence,
    ) -> std::result::Result<(), TransportError> {
        let admin = self.inner.client.admin();
        admin.connect().await?;

        let result = async {
            if !sequence.is_empty() {
                let request = CreateTopicsRequest {
                    wait_for_leaders: true,
                    topics: sequence
                        .iter()
                        .map(|topic| TopicSpec {
                            topic: topic.to_string(),
                        })
                        .collect(),
                };
                admin.create_topics(request).await?;
            }

            let pattern = cascade_topic_pattern(&self.inner.topic)
                .map_err(|e| TransportError::Rejected(e.to_string()))?;
            let registered: Vec<String> = admin
                .list_topics()
                .await?
                .into_iter()
                .filter(|topic| pattern.is_match(topic))
                .collect();
            info!(topics = ?registered, "Topics registered");

            let missing: Vec<&str> = sequence
                .iter()
                .filter(|topic| !registered.iter().any(|r| r.as_str() == *topic))
                .collect();
            if !missing.is_empty() {
                return Err(TransportError::Rejected(format!(
                    "topics not present after creation: {}",
                    missing.join(", ")
                )));
            }
            Ok::<(), TransportError>(())
        }
        .await;

        if let Err(e) = admin.disconnect().await {
            warn!(error = %e, "Failed to disconnect admin client");
        }
        result
    }

    /// Start the consumer loop with the processing, success and retry callbacks.
    #[instrument(skip(self), fields(service = %self.inner.id, topic = %self.inner.topic))]
    pub async fn run(&self) -> Result<()> {
        let previous = {
            let _transition = self.inner.transitions.lock().await;
            self.ensure_open("run")?;

            let state = self.state();
            match state {
                LifecycleState::Connected | LifecycleState::Stopped => {}
                other => return Err(self.invalid("run", other)),
            }
            self.inner.router.start();
            self.set_state(LifecycleState::Running);
            state
        };

        let success: Arc<dyn MessageHandler> = Arc::new(SuccessForwarder {
            sink: Arc::clone(&self.inner.success),
            events: Arc::clone(&self.inner.events),
        });
        let failure: Arc<dyn MessageHandler> = Arc::new(RetryForwarder {
            router: Arc::clone(&self.inner.router),
            events: Arc::clone(&self.inner.events),
        });

        // The lifecycle lock is released here: some clients only resolve run
        // once their loop exits, and pause/stop must stay callable meanwhile.
        if let Err(e) = self
            .inner
            .consumer
            .run(Arc::clone(&self.inner.processor), success, failure)
            .await
        {
            let _transition = self.inner.transitions.lock().await;
            if self.state() == LifecycleState::Running {
                if previous == LifecycleState::Stopped {
                    self.inner.router.halt();
                }
                self.set_state(previous);
            }
            return Err(self.report("run", e));
        }

        // pause or stop may have run while the consumer was starting
        let _transition = self.inner.transitions.lock().await;
        match self.state() {
            LifecycleState::Running => {}
            LifecycleState::Paused => {
                if let Err(e) = self.inner.consumer.pause().await {
                    return Err(self.report("run", e));
                }
            }
            state => {
                warn!(%state, "Service left running before the consumer loop started");
                if let Err(e) = self.inner.consumer.stop().await {
                    return Err(self.report("run", e));
                }
                return Ok(());
            }
        }

        info!("Cascade service running");
        self.inner.events.publish(CascadeEvent::Run);
        Ok(())
    }

    /// Pause the consumer, then the router.
    ///
    /// A no-op with a warning when already paused. If the consumer refuses
    /// to pause the service stays running and the error is reported.
    #[instrument(skip(self), fields(service = %self.inner.id))]
    pub async fn pause(&self) -> Result<()> {
        let _transition = self.inner.transitions.lock().await;
        self.ensure_open("pause")?;

        match self.state() {
            LifecycleState::Running => {}
            LifecycleState::Paused => {
                warn!("Cascade service pause called while already paused");
                return Ok(());
            }
            other => return Err(self.invalid("pause", other)),
        }

        if let Err(e) = self.inner.consumer.pause().await {
            return Err(self.report("pause", e));
        }
        self.inner.router.pause();

        self.set_state(LifecycleState::Paused);
        info!("Cascade service paused");
        self.inner.events.publish(CascadeEvent::Pause);
        Ok(())
    }

    /// Resume the router, then the consumer.
    ///
    /// A no-op with a warning when already running.
    #[instrument(skip(self), fields(service = %self.inner.id))]
    pub async fn resume(&self) -> Result<()> {
        let _transition = self.inner.transitions.lock().await;
        self.ensure_open("resume")?;

        match self.state() {
            LifecycleState::Paused => {}
            LifecycleState::Running => {
                warn!("Cascade service resume called while already running");
                return Ok(());
            }
            other => return Err(self.invalid("resume", other)),
        }

        // The router must accept publishes before the consumer delivers again
        self.inner.router.resume();
        if let Err(e) = self.inner.consumer.resume().await {
            self.inner.router.pause();
            return Err(self.report("resume", e));
        }

        self.set_state(LifecycleState::Running);
        info!("Cascade service resumed");
        self.inner.events.publish(CascadeEvent::Resume);
        Ok(())
    }

    /// Stop both halves, letting in-flight hops finish first.
    #[instrument(skip(self), fields(service = %self.inner.id))]
    pub async fn stop(&self) -> Result<()> {
        let _transition = self.inner.transitions.lock().await;
        self.ensure_open("stop")?;

        match self.state() {
            LifecycleState::Stopped => {
                warn!("Cascade service stop called while already stopped");
                return Ok(());
            }
            LifecycleState::Disconnected => {
                return Err(self.invalid("stop", LifecycleState::Disconnected))
            }
            _ => {}
        }

        if let Err(e) = self.halt_flow().await {
            return Err(self.report("stop", e));
        }

        self.set_state(LifecycleState::Stopped);
        info!("Cascade service stopped");
        self.inner.events.publish(CascadeEvent::Stop);
        Ok(())
    }

    async fn halt_flow(&self) -> Result<()> {
        let state = self.state();
        if matches!(state, LifecycleState::Running | LifecycleState::Paused) {
            // Hops held by a pause are in flight; let them through so the
            // consumer can drain instead of waiting on the router forever.
            let was_paused = self.inner.router.is_paused();
            if was_paused {
                self.inner.router.resume();
            }
            if let Err(e) = self.inner.consumer.stop().await {
                if was_paused {
                    self.inner.router.pause();
                }
                return Err(e);
            }
        }
        self.inner.router.stop().await;
        Ok(())
    }

    /// Stop the producer if needed and disconnect both halves.
    ///
    /// The service cannot be used again afterwards.
    #[instrument(skip(self), fields(service = %self.inner.id))]
    pub async fn disconnect(&self) -> Result<()> {
        let _transition = self.inner.transitions.lock().await;
        self.ensure_open("disconnect")?;

        let state = self.state();
        if state != LifecycleState::Disconnected {
            if state != LifecycleState::Stopped {
                if let Err(e) = self.halt_flow().await {
                    return Err(self.report("disconnect", e));
                }
                self.set_state(LifecycleState::Stopped);
            }
            if let Err(e) = self.inner.router.disconnect().await {
                return Err(self.report("disconnect", e));
            }
            if let Err(e) = self.inner.consumer.disconnect().await {
                return Err(self.report("disconnect", e));
            }
        }

        self.inner.closed.store(true, Ordering::SeqCst);
        self.set_state(LifecycleState::Disconnected);
        info!("Cascade service disconnected");
        self.inner.events.publish(CascadeEvent::Disconnect);
        Ok(())
    }
}

/// Publishes `success` and hands the message to the user success sink.
struct SuccessForwarder {
    sink: Arc<dyn MessageHandler>,
    events: Arc<EventBus>,
}

#[async_trait]
impl MessageHandler for SuccessForwarder {
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        self.events.publish(CascadeEvent::Success(message.clone()));
        self.sink.handle(message).await
    }
}

/// Hands failed messages to the router and reports routing failures.
struct RetryForwarder {
    router: Arc<RetryRouter>,
    events: Arc<EventBus>,
}

#[async_trait]
impl MessageHandler for RetryForwarder {
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        match self.router.route(message).await {
            Ok(outcome) => {
                debug!(?outcome, "Failed message routed");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to route message for retry");
                self.events.publish(CascadeEvent::Error {
                    operation: "route",
                    error: e.clone(),
                });
                Err(e.into())
            }
        }
    }
}
