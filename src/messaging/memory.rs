use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify};

use super::{deliver, DeliveryPolicy, EventPublisher, EventSubscriber, Message, MessageHandler, MessagingError};
use crate::health::{ComponentHealth, HealthCheckable, HealthStatus};

// ============================================================================
// In-Memory Broker
// ============================================================================
//
// Single-partition topics with per-group committed offsets. Mirrors the
// guarantees the service relies on from Kafka: a group resumes from its last
// commit, so anything not committed is delivered again.
//
// ============================================================================

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Message>>,
    /// (group, topic) -> next offset to deliver
    committed: HashMap<(String, String), i64>,
}

pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    available: AtomicBool,
    /// Publishes to fail before the broker behaves again
    failures_pending: AtomicU32,
    published: Notify,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            available: AtomicBool::new(true),
            failures_pending: AtomicU32::new(0),
            published: Notify::new(),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Makes the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: u32) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    pub async fn messages(&self, topic: &str) -> Vec<Message> {
        let state = self.state.lock().await;
        state.topics.get(topic).cloned().unwrap_or_default()
    }

    pub async fn committed_offset(&self, group: &str, topic: &str) -> Option<i64> {
        let state = self.state.lock().await;
        state
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .copied()
    }

    pub fn subscriber(
        self: &Arc<Self>,
        group: impl Into<String>,
        topic: impl Into<String>,
        policy: DeliveryPolicy,
    ) -> InMemorySubscriber {
        InMemorySubscriber {
            broker: self.clone(),
            group: group.into(),
            topic: topic.into(),
            policy,
        }
    }

    async fn next_uncommitted(&self, group: &str, topic: &str) -> Option<Message> {
        let state = self.state.lock().await;
        let position = state
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .copied()
            .unwrap_or(0);
        state
            .topics
            .get(topic)
            .and_then(|messages| messages.get(usize::try_from(position).ok()?))
            .cloned()
    }

    async fn commit(&self, group: &str, message: &Message) {
        let mut state = self.state.lock().await;
        state
            .committed
            .insert((group.to_string(), message.topic.clone()), message.offset + 1);
    }

    fn check_available(&self) -> Result<(), MessagingError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(MessagingError::Unavailable("in-memory broker switched off".to_string()));
        }
        let injected = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(MessagingError::Unavailable("injected publish failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for InMemoryBroker {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), MessagingError> {
        self.check_available()?;

        {
            let mut state = self.state.lock().await;
            let log = state.topics.entry(topic.to_string()).or_default();
            let offset = log.len() as i64;
            log.push(Message {
                topic: topic.to_string(),
                partition: 0,
                offset,
                key: Some(key.to_string()),
                payload: payload.to_vec(),
            });
        }

        self.published.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl HealthCheckable for InMemoryBroker {
    fn component_name(&self) -> &str {
        "broker"
    }

    async fn check_health(&self) -> ComponentHealth {
        let status = if self.available.load(Ordering::SeqCst) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy("broker switched off".to_string())
        };
        ComponentHealth::new(self.component_name(), status)
    }
}

pub struct InMemorySubscriber {
    broker: Arc<InMemoryBroker>,
    group: String,
    topic: String,
    policy: DeliveryPolicy,
}

impl InMemorySubscriber {
    /// Delivers everything not yet committed, then returns how many messages
    /// were settled. Stops early, leaving the rest uncommitted, on shutdown.
    pub async fn process_pending(
        &self,
        handler: &dyn MessageHandler,
        shutdown: &mut watch::Receiver<bool>,
    ) -> usize {
        let mut settled = 0;
        while let Some(message) = self.broker.next_uncommitted(&self.group, &self.topic).await {
            let delivery = deliver(handler, &message, &self.policy, shutdown).await;
            if !delivery.should_commit() {
                break;
            }
            self.broker.commit(&self.group, &message).await;
            settled += 1;
        }
        settled
    }
}

#[async_trait]
impl EventSubscriber for InMemorySubscriber {
    async fn run(
        &self,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), MessagingError> {
        tracing::info!(group = %self.group, topic = %self.topic, "In-memory subscriber started");

        loop {
            let published = self.broker.published.notified();
            self.process_pending(handler.as_ref(), &mut shutdown).await;

            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = published => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(group = %self.group, "In-memory subscriber stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{DeadLetter, HandlerError};
    use crate::metrics::Metrics;
    use crate::utils::RedeliveryConfig;
    use std::time::Duration;

    const TOPIC: &str = "orders.created";

    struct Recording {
        seen: Mutex<Vec<i64>>,
        poison_offset: Option<i64>,
    }

    #[async_trait]
    impl MessageHandler for Recording {
        async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
            if Some(message.offset) == self.poison_offset {
                return Err(HandlerError::Permanent("poison".into()));
            }
            self.seen.lock().await.push(message.offset);
            Ok(())
        }
    }

    struct AlwaysTransient;

    #[async_trait]
    impl MessageHandler for AlwaysTransient {
        async fn handle(&self, _message: &Message) -> Result<(), HandlerError> {
            Err(HandlerError::Transient("store down".into()))
        }
    }

    fn policy(broker: &Arc<InMemoryBroker>) -> DeliveryPolicy {
        DeliveryPolicy {
            dlq_topic: format!("{TOPIC}.dlq"),
            redelivery: RedeliveryConfig {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                ..RedeliveryConfig::default()
            },
            dead_letters: broker.clone(),
            metrics: Arc::new(Metrics::new().unwrap()),
        }
    }

    #[tokio::test]
    async fn test_commits_after_handling() {
        let broker = Arc::new(InMemoryBroker::new());
        for i in 0..3 {
            broker.publish(TOPIC, "A1", format!("{i}").as_bytes()).await.unwrap();
        }
        let subscriber = broker.subscriber("g1", TOPIC, policy(&broker));
        let handler = Recording { seen: Mutex::new(Vec::new()), poison_offset: None };
        let (_tx, mut shutdown) = watch::channel(false);

        assert_eq!(subscriber.process_pending(&handler, &mut shutdown).await, 3);
        assert_eq!(*handler.seen.lock().await, vec![0, 1, 2]);
        assert_eq!(broker.committed_offset("g1", TOPIC).await, Some(3));

        // Nothing left for the same group
        assert_eq!(subscriber.process_pending(&handler, &mut shutdown).await, 0);
    }

    #[tokio::test]
    async fn test_poison_message_is_dead_lettered_and_skipped() {
        let broker = Arc::new(InMemoryBroker::new());
        for i in 0..3 {
            broker.publish(TOPIC, "A1", format!("{i}").as_bytes()).await.unwrap();
        }
        let subscriber = broker.subscriber("g1", TOPIC, policy(&broker));
        let handler = Recording { seen: Mutex::new(Vec::new()), poison_offset: Some(1) };
        let (_tx, mut shutdown) = watch::channel(false);

        subscriber.process_pending(&handler, &mut shutdown).await;

        assert_eq!(*handler.seen.lock().await, vec![0, 2]);
        assert_eq!(broker.committed_offset("g1", TOPIC).await, Some(3));

        let dead = broker.messages(&format!("{TOPIC}.dlq")).await;
        assert_eq!(dead.len(), 1);
        let letter: DeadLetter = serde_json::from_slice(&dead[0].payload).unwrap();
        assert_eq!(letter.offset, 1);
        assert_eq!(letter.payload, "1");
    }

    #[tokio::test]
    async fn test_uncommitted_message_is_redelivered_after_restart() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.publish(TOPIC, "A1", b"0").await.unwrap();

        let (tx, shutdown) = watch::channel(false);
        let failing = broker.subscriber("g1", TOPIC, policy(&broker));
        let run = tokio::spawn(async move { failing.run(Arc::new(AlwaysTransient), shutdown).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        run.await.unwrap().unwrap();
        assert_eq!(broker.committed_offset("g1", TOPIC).await, None);

        let restarted = broker.subscriber("g1", TOPIC, policy(&broker));
        let handler = Recording { seen: Mutex::new(Vec::new()), poison_offset: None };
        let (_tx, mut shutdown) = watch::channel(false);

        assert_eq!(restarted.process_pending(&handler, &mut shutdown).await, 1);
        assert_eq!(*handler.seen.lock().await, vec![0]);
    }

    #[tokio::test]
    async fn test_run_picks_up_new_messages() {
        let broker = Arc::new(InMemoryBroker::new());
        let handler = Arc::new(Recording { seen: Mutex::new(Vec::new()), poison_offset: None });
        let (tx, shutdown) = watch::channel(false);

        let subscriber = broker.subscriber("g1", TOPIC, policy(&broker));
        let consumer_handler: Arc<dyn MessageHandler> = handler.clone();
        let run = tokio::spawn(async move { subscriber.run(consumer_handler, shutdown).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.publish(TOPIC, "A1", b"x").await.unwrap();

        for _ in 0..50 {
            if broker.committed_offset("g1", TOPIC).await == Some(1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tx.send(true).unwrap();
        run.await.unwrap().unwrap();
        assert_eq!(*handler.seen.lock().await, vec![0]);
    }

    #[tokio::test]
    async fn test_injected_failures_then_recovery() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(2);

        assert!(broker.publish(TOPIC, "A1", b"a").await.is_err());
        assert!(broker.publish(TOPIC, "A1", b"a").await.is_err());
        assert!(broker.publish(TOPIC, "A1", b"a").await.is_ok());
        assert_eq!(broker.messages(TOPIC).await.len(), 1);
    }
}
