//! Service event channel.
//!
//! Both halves of the service and the service itself publish through a
//! single [`EventBus`]. Listeners are invoked synchronously, in registration
//! order, without any internal lock held, so a listener may register further
//! listeners or kick off service operations. Async observers can take a
//! broadcast receiver instead.

use crate::error::{CascadeError, Result};
use crate::messages::Message;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::trace;

const EVENT_STREAM_CAPACITY: usize = 1024;

/// The closed set of event names a service publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    Run,
    Stop,
    Pause,
    Resume,
    Receive,
    Success,
    Retry,
    Dlq,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        EventKind::Connect,
        EventKind::Disconnect,
        EventKind::Run,
        EventKind::Stop,
        EventKind::Pause,
        EventKind::Resume,
        EventKind::Receive,
        EventKind::Success,
        EventKind::Retry,
        EventKind::Dlq,
        EventKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
            EventKind::Run => "run",
            EventKind::Stop => "stop",
            EventKind::Pause => "pause",
            EventKind::Resume => "resume",
            EventKind::Receive => "receive",
            EventKind::Success => "success",
            EventKind::Retry => "retry",
            EventKind::Dlq => "dlq",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = CascadeError;

    fn from_str(s: &str) -> Result<Self> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CascadeError::UnknownEvent(s.to_string()))
    }
}

/// An event published by a cascade service.
#[derive(Debug, Clone)]
pub enum CascadeEvent {
    Connect,
    Disconnect,
    Run,
    Stop,
    Pause,
    Resume,
    /// A message arrived from the primary topic or a retry topic
    Receive(Message),
    /// The processing callback accepted a message
    Success(Message),
    /// A failed message was republished; carries the message as sent
    Retry(Message),
    /// A message exhausted its retry levels and went to the dead-letter sink
    Dlq(Message),
    Error {
        operation: &'static str,
        error: CascadeError,
    },
}

impl CascadeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CascadeEvent::Connect => EventKind::Connect,
            CascadeEvent::Disconnect => EventKind::Disconnect,
            CascadeEvent::Run => EventKind::Run,
            CascadeEvent::Stop => EventKind::Stop,
            CascadeEvent::Pause => EventKind::Pause,
            CascadeEvent::Resume => EventKind::Resume,
            CascadeEvent::Receive(_) => EventKind::Receive,
            CascadeEvent::Success(_) => EventKind::Success,
            CascadeEvent::Retry(_) => EventKind::Retry,
            CascadeEvent::Dlq(_) => EventKind::Dlq,
            CascadeEvent::Error { .. } => EventKind::Error,
        }
    }

    /// The message carried by message-level events
    pub fn message(&self) -> Option<&Message> {
        match self {
            CascadeEvent::Receive(m)
            | CascadeEvent::Success(m)
            | CascadeEvent::Retry(m)
            | CascadeEvent::Dlq(m) => Some(m),
            _ => None,
        }
    }
}

pub type Listener = Arc<dyn Fn(&CascadeEvent) + Send + Sync>;

/// Handle returned by a registration, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Registration {
    id: SubscriptionId,
    kind: EventKind,
    listener: Listener,
}

pub struct EventBus {
    listeners: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
    stream: broadcast::Sender<CascadeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (stream, _) = broadcast::channel(EVENT_STREAM_CAPACITY);
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            stream,
        }
    }

    /// Register a listener by event name, failing for names outside the set
    pub fn on<F>(&self, name: &str, listener: F) -> Result<SubscriptionId>
    where
        F: Fn(&CascadeEvent) + Send + Sync + 'static,
    {
        let kind = name.parse::<EventKind>()?;
        Ok(self.subscribe(kind, listener))
    }

    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&CascadeEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                id,
                kind,
                listener: Arc::new(listener),
            });
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }

    /// Receiver that sees every event published after this call
    pub fn stream(&self) -> broadcast::Receiver<CascadeEvent> {
        self.stream.subscribe()
    }

    /// Deliver `event` to matching listeners and the broadcast stream
    pub fn publish(&self, event: CascadeEvent) {
        let kind = event.kind();
        let targets: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| Arc::clone(&r.listener))
            .collect();

        trace!(event = %kind, listeners = targets.len(), "Publishing event");
        for listener in targets {
            listener(&event);
        }

        // No receivers is fine
        let _ = self.stream.send(event);
    }
}
