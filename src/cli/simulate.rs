//! `cascade simulate`: drive a service over the in-memory broker.

use crate::cascade::{CascadeService, EventKind};
use crate::config::CascadeConfig;
use crate::messages::{Message, OutboundMessage, ProducerRecord};
use crate::transport::{handler_fn, MemoryBroker, MessagingClient};
use anyhow::{bail, Context, Result};
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Event counts collected during one simulation run.
#[derive(Debug, Clone, Default)]
pub struct SimulationReport {
    pub produced: usize,
    pub counts: HashMap<EventKind, usize>,
}

impl SimulationReport {
    pub fn count(&self, kind: EventKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "produced: {}", self.produced)?;
        for kind in EventKind::ALL {
            writeln!(f, "{:>10}: {}", kind.as_str(), self.count(kind))?;
        }
        Ok(())
    }
}

/// Produce `messages` records to the configured topic and run them through a
/// service whose processor fails with probability `failure_rate`.
///
/// Returns once every message has either succeeded or been dead-lettered.
pub async fn run_simulation(
    config: &CascadeConfig,
    messages: usize,
    failure_rate: f64,
) -> Result<SimulationReport> {
    if !(0.0..=1.0).contains(&failure_rate) {
        bail!("Failure rate must be between 0 and 1, got {}", failure_rate);
    }

    let broker = MemoryBroker::with_auto_create_topics(config.auto_create_topics);
    broker.create_topic(&config.topic).await;
    let client: Arc<dyn MessagingClient> = Arc::new(broker.clone());

    let processor = handler_fn(move |_msg: Message| {
        let fail = rand::thread_rng().gen_bool(failure_rate);
        async move {
            if fail {
                bail!("simulated processing failure");
            }
            Ok(())
        }
    });
    let noop = handler_fn(|_msg: Message| async { Ok(()) });

    let service = CascadeService::from_config(
        client,
        config,
        processor,
        Arc::clone(&noop),
        noop,
    );

    let counts = Arc::new(Mutex::new(HashMap::<EventKind, usize>::new()));
    let settled = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(Notify::new());
    for kind in EventKind::ALL {
        let counts = Arc::clone(&counts);
        let settled = Arc::clone(&settled);
        let done = Arc::clone(&done);
        service.subscribe(kind, move |event| {
            *counts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(event.kind())
                .or_default() += 1;
            if matches!(event.kind(), EventKind::Success | EventKind::Dlq)
                && settled.fetch_add(1, Ordering::SeqCst) + 1 == messages
            {
                done.notify_one();
            }
        });
    }

    service.connect().await?;
    service
        .configure_retry_levels(config.retry_levels, Some(config.level_options()))
        .await?;
    info!(topics = ?service.retry_topics().as_slice(), "Retry levels ready");
    service.run().await?;

    let producer = broker.producer();
    producer.connect().await?;
    for i in 0..messages {
        let record = ProducerRecord::new(
            config.topic.clone(),
            vec![OutboundMessage {
                key: Some(Uuid::new_v4().to_string()),
                value: format!("message-{}", i).into_bytes(),
                headers: Default::default(),
            }],
        );
        producer
            .send(record)
            .await
            .with_context(|| format!("Failed to produce message {}", i))?;
    }
    producer.disconnect().await?;

    let waited = if messages > 0 {
        tokio::time::timeout(SETTLE_TIMEOUT, done.notified())
            .await
            .is_ok()
    } else {
        true
    };

    service.stop().await?;
    service.disconnect().await?;

    if !waited {
        warn!(
            settled = settled.load(Ordering::SeqCst),
            expected = messages,
            "Simulation did not settle in time"
        );
        bail!("Timed out waiting for {} messages to settle", messages);
    }

    let counts = counts
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    Ok(SimulationReport {
        produced: messages,
        counts,
    })
}
