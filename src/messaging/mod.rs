pub mod memory;
pub mod redpanda;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::metrics::Metrics;
use crate::utils::{IsTransient, RedeliveryConfig};

pub use memory::{InMemoryBroker, InMemorySubscriber};
pub use redpanda::{ensure_topic_exists, RedpandaPublisher, RedpandaSubscriber};

// ============================================================================
// Messaging Seams
// ============================================================================
//
// Delivery contract shared by every subscriber implementation:
// - handler Ok                -> commit
// - handler transient error   -> redeliver with backoff until Ok or shutdown
// - handler permanent error   -> forward to the dead letter topic, then commit
// - shutdown while retrying   -> stop without committing, so the message is
//                                redelivered after restart
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Circuit breaker open for broker")]
    CircuitOpen,

    #[error("Subscription failed: {0}")]
    Subscribe(String),

    #[error("Topic administration failed: {0}")]
    Admin(String),
}

impl IsTransient for MessagingError {
    fn is_transient(&self) -> bool {
        matches!(self, MessagingError::Unavailable(_) | MessagingError::CircuitOpen)
    }
}

/// Failure reported by a `MessageHandler`; decides between redelivery and
/// the dead letter topic.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),
}

impl IsTransient for HandlerError {
    fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| HandlerError::Permanent(format!("undecodable payload: {e}")))
    }
}

/// Envelope written to `<topic>.dlq`.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub source_topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(message: &Message, error: &HandlerError) -> Self {
        Self {
            source_topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            key: message.key.clone(),
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
            error: error.to_string(),
            failed_at: Utc::now(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), MessagingError>;
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Consumes until `shutdown` flips to true.
    async fn run(
        &self,
        handler: Arc<dyn MessageHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), MessagingError>;
}

/// What the subscriber should do with its read position after `deliver`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Handled,
    DeadLettered,
    /// Shutdown arrived before the message was settled; do not commit.
    Abandoned,
}

impl Delivery {
    pub fn should_commit(&self) -> bool {
        !matches!(self, Delivery::Abandoned)
    }
}

/// Settings a subscriber needs to run `deliver`.
#[derive(Clone)]
pub struct DeliveryPolicy {
    pub dlq_topic: String,
    pub redelivery: RedeliveryConfig,
    pub dead_letters: Arc<dyn EventPublisher>,
    pub metrics: Arc<Metrics>,
}

/// Drives one message through the handler according to the delivery
/// contract above.
pub async fn deliver(
    handler: &dyn MessageHandler,
    message: &Message,
    policy: &DeliveryPolicy,
    shutdown: &mut watch::Receiver<bool>,
) -> Delivery {
    let mut backoff = policy.redelivery.backoff();
    let mut attempt: u32 = 0;

    let failure = loop {
        attempt += 1;
        match handler.handle(message).await {
            Ok(()) => return Delivery::Handled,
            Err(e) if e.is_transient() => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Transient handler failure, redelivering"
                );
                if !pause(delay, shutdown).await {
                    tracing::info!(
                        offset = message.offset,
                        "Shutdown during redelivery, leaving offset uncommitted"
                    );
                    return Delivery::Abandoned;
                }
            }
            Err(e) => break e,
        }
    };

    let dead_letter = DeadLetter::new(message, &failure);
    let body = match serde_json::to_vec(&dead_letter) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode dead letter, leaving offset uncommitted");
            return Delivery::Abandoned;
        }
    };
    let key = message.key.as_deref().unwrap_or_default();

    // The dead letter must land before the source offset moves on
    loop {
        match policy.dead_letters.publish(&policy.dlq_topic, key, &body).await {
            Ok(()) => break,
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::error!(
                    dlq_topic = %policy.dlq_topic,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Failed to forward message to dead letter topic"
                );
                if !pause(delay, shutdown).await {
                    return Delivery::Abandoned;
                }
            }
        }
    }

    policy.metrics.record_dlq_message(&message.topic);
    tracing::error!(
        topic = %message.topic,
        partition = message.partition,
        offset = message.offset,
        dlq_topic = %policy.dlq_topic,
        error = %failure,
        "💀 Message forwarded to dead letter topic"
    );
    Delivery::DeadLettered
}

/// Sleeps for `delay`; false if shutdown was signalled first.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}
