use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::{BorrowedMessage, Message as KafkaMessage};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::{deliver, DeliveryPolicy, EventPublisher, EventSubscriber, Message, MessageHandler, MessagingError};
use crate::config::KafkaConfig;
use crate::health::{ComponentHealth, HealthCheckable, HealthStatus};
use crate::metrics::Metrics;
use crate::utils::{CircuitBreaker, CircuitBreakerError, CircuitState};

// ============================================================================
// Redpanda / Kafka Publisher
// ============================================================================

pub struct RedpandaPublisher {
    producer: FutureProducer,
    circuit_breaker: CircuitBreaker,
    send_timeout: Duration,
}

impl RedpandaPublisher {
    pub fn new(config: &KafkaConfig, metrics: Arc<Metrics>) -> Result<Self, MessagingError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| MessagingError::Unavailable(format!("Failed to create producer: {e}")))?;

        let circuit_breaker = CircuitBreaker::new(config.circuit_breaker.clone())
            .with_transition_hook(move |from, to| metrics.record_circuit_breaker_transition(from, to));

        tracing::info!(brokers = %config.brokers, "Redpanda producer initialised");

        Ok(Self {
            producer,
            circuit_breaker,
            send_timeout: Duration::from_millis(config.message_timeout_ms),
        })
    }

    pub async fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.get_state().await
    }
}

#[async_trait]
impl EventPublisher for RedpandaPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), MessagingError> {
        // Use circuit breaker to protect against Redpanda failures
        let result = self
            .circuit_breaker
            .call(async {
                let record = FutureRecord::to(topic).key(key).payload(payload);

                self.producer
                    .send(record, self.send_timeout)
                    .await
                    .map_err(|(e, _)| e)
            })
            .await;

        match result {
            Ok(delivery) => {
                tracing::debug!(
                    topic,
                    key,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Published to Redpanda"
                );
                Ok(())
            }
            Err(CircuitBreakerError::CircuitOpen) => {
                tracing::warn!(topic, "Circuit breaker open - Redpanda unavailable");
                Err(MessagingError::CircuitOpen)
            }
            Err(CircuitBreakerError::OperationFailed(e)) => {
                tracing::error!(error = %e, topic, "Failed to publish to Redpanda");
                Err(MessagingError::Unavailable(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl HealthCheckable for RedpandaPublisher {
    fn component_name(&self) -> &str {
        "redpanda"
    }

    async fn check_health(&self) -> ComponentHealth {
        let status = HealthStatus::from(self.circuit_state().await);
        ComponentHealth::new(self.component_name(), status)
    }
}

// ============================================================================
// Redpanda / Kafka Subscriber
// ============================================================================
//
// Auto-commit is off. An offset is committed only once `deliver` settles the
// message (handled or dead-lettered), so a crash or shutdown in between
// means the message comes back after restart.
//
// ============================================================================

pub struct RedpandaSubscriber {
    consumer: StreamConsumer,
    topic: String,
    group: String,
    policy: DeliveryPolicy,
}

impl RedpandaSubscriber {
    pub fn new(config: &KafkaConfig, policy: DeliveryPolicy) -> Result<Self, MessagingError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| MessagingError::Subscribe(format!("Failed to create consumer: {e}")))?;

        tracing::info!(
            brokers = %config.brokers,
            group = %config.consumer_group,
            topic = %config.topic,
            "Redpanda consumer initialised"
        );

        Ok(Self {
            consumer,
            topic: config.topic.clone(),
            group: config.consumer_group.clone(),
            policy,
        })
    }

    fn commit(&self, message: &Message) {
        let mut offsets = TopicPartitionList::new();
        let added = offsets.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        );

        let result = added.and_then(|()| self.consumer.commit(&offsets, CommitMode::Async));
        if let Err(e) = result {
            // Not fatal: the message is handled and will at worst be seen again
            tracing::warn!(
                error = %e,
                partition = message.partition,
                offset = message.offset,
                "Failed to commit offset (message may be redelivered)"
            );
        }
    }
}

fn from_borrowed(msg: &BorrowedMessage<'_>) -> Message {
    Message {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        key: msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from),
        payload: msg.payload().map(|p| p.to_vec()).unwrap_or_default(),
    }
}

#[async_trait]
impl EventSubscriber for RedpandaSubscriber {
    async fn run(
        &self,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), MessagingError> {
        self.consumer
            .subscribe(&[self.topic.as_str()])
            .map_err(|e| MessagingError::Subscribe(e.to_string()))?;

        tracing::info!(topic = %self.topic, group = %self.group, "Consumer loop started");

        loop {
            let received = tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Shutdown signal received, consumer loop exiting");
                        break;
                    }
                    continue;
                }

                received = self.consumer.recv() => received.map(|m| from_borrowed(&m)),
            };

            let message = match received {
                Ok(message) => message,
                Err(e) => {
                    tracing::error!(error = %e, "Error receiving from Redpanda");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            tracing::debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Received message"
            );

            let delivery = deliver(handler.as_ref(), &message, &self.policy, &mut shutdown).await;
            if !delivery.should_commit() {
                // Leave the offset where it is; the group resumes here on restart
                break;
            }
            self.commit(&message);
        }

        Ok(())
    }
}

// ============================================================================
// Topic Administration
// ============================================================================

/// Creates the order topic and its dead letter topic unless they exist.
pub async fn ensure_topic_exists(config: &KafkaConfig) -> Result<(), MessagingError> {
    let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", &config.brokers)
        .create()
        .map_err(|e| MessagingError::Admin(format!("Failed to create admin client: {e}")))?;

    let dlq_topic = config.dlq_topic();
    let topics = [
        NewTopic::new(
            &config.topic,
            config.topic_partitions,
            TopicReplication::Fixed(config.topic_replication),
        ),
        NewTopic::new(
            &dlq_topic,
            1,
            TopicReplication::Fixed(config.topic_replication),
        ),
    ];

    let results = admin
        .create_topics(&topics, &AdminOptions::new().operation_timeout(Some(Duration::from_secs(5))))
        .await
        .map_err(|e| MessagingError::Admin(e.to_string()))?;

    for result in results {
        match result {
            Ok(topic) => tracing::info!(topic = %topic, "Created topic"),
            Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                tracing::debug!(topic = %topic, "Topic already exists");
            }
            Err((topic, code)) => {
                return Err(MessagingError::Admin(format!("Failed to create topic {topic}: {code}")));
            }
        }
    }

    Ok(())
}
