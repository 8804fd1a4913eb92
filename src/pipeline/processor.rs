use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;
use uuid::Uuid;

use super::fulfillment::FulfillmentNotifier;
use crate::config::PipelineConfig;
use crate::domain::order::{
    is_valid_total, CreateOrder, NewOrder, Order, OrderCreatedEvent, OrderError, OrderStatus,
};
use crate::domain::{Account, AccountId};
use crate::messaging::EventPublisher;
use crate::metrics::Metrics;
use crate::store::{StoreError, Stores};

// ============================================================================
// Order Processor
// ============================================================================
//
// Synchronous path (create_order):
//   validate -> read account -> ledger (insert + debit + Debited, atomic)
//   -> publish (detached task) -> Published
//
// Asynchronous path (handle_order_event):
//   stored status decides; notify fulfillment -> Acknowledged
//
// The status column is the recovery marker between the two writes that
// cannot share a transaction (database and broker). An order left Debited
// is picked up by the reconciler through `republish`.
//
// ============================================================================

/// How many times `handle_order_event` re-reads after losing a status race
/// before handing the message back for redelivery.
const MAX_ACK_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    Acknowledged,
    AlreadyAcknowledged,
}

impl EventDisposition {
    pub fn as_label(&self) -> &'static str {
        match self {
            EventDisposition::Acknowledged => "acknowledged",
            EventDisposition::AlreadyAcknowledged => "already_acknowledged",
        }
    }
}

/// Runs a store call under the configured deadline.
async fn bounded<T, F>(limit: Duration, operation: &'static str, fut: F) -> Result<T, OrderError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(OrderError::from),
        Err(_) => Err(OrderError::PersistenceFailure(format!(
            "{operation} timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

/// Publish + advance, owned so it can run in its own task.
#[derive(Clone)]
struct PublishStage {
    stores: Stores,
    publisher: Arc<dyn EventPublisher>,
    topic: String,
    store_timeout: Duration,
    publish_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl PublishStage {
    async fn publish_and_advance(self, mut order: Order) -> Result<Order, OrderError> {
        let event = OrderCreatedEvent::from(&order);

        let sent = match event.to_payload() {
            Ok(payload) => {
                let publish = self.publisher.publish(&self.topic, event.partition_key(), &payload);
                match tokio::time::timeout(self.publish_timeout, publish).await {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(_) => Err(format!(
                        "publish timed out after {}ms",
                        self.publish_timeout.as_millis()
                    )),
                }
            }
            Err(e) => Err(format!("event encoding failed: {e}")),
        };
        self.metrics.record_publish(sent.is_ok());

        if let Err(reason) = sent {
            let attempts = bounded(
                self.store_timeout,
                "record_publish_failure",
                self.stores.orders.record_publish_failure(order.id),
            )
            .await;

            match attempts {
                Ok(attempts) => order.publish_attempts = attempts,
                Err(e) => tracing::warn!(
                    order_id = %order.id,
                    error = %e,
                    "Could not record publish failure"
                ),
            }

            tracing::warn!(
                order_id = %order.id,
                attempts = order.publish_attempts,
                reason = %reason,
                "Order debited but event not published; left for reconciliation"
            );
            return Err(OrderError::PublishFailed {
                order: Box::new(order),
                reason,
            });
        }

        let advanced = bounded(
            self.store_timeout,
            "advance_status",
            self.stores
                .orders
                .advance_status(order.id, OrderStatus::Debited, OrderStatus::Published),
        )
        .await;

        match advanced {
            Ok(published) => {
                tracing::info!(order_id = %published.id, "✅ Order published");
                Ok(published)
            }
            // Someone moved it on first, typically the consumer
            Err(OrderError::Conflict { actual, .. }) => {
                tracing::debug!(order_id = %order.id, status = %actual, "Order already advanced");
                bounded(
                    self.store_timeout,
                    "get_order",
                    self.stores.orders.get_order(order.id),
                )
                .await
            }
            Err(e) => Err(e),
        }
    }
}

pub struct OrderProcessor {
    stores: Stores,
    fulfillment: Arc<dyn FulfillmentNotifier>,
    stage: PublishStage,
    store_timeout: Duration,
    metrics: Arc<Metrics>,
    span: tracing::Span,
}

impl OrderProcessor {
    pub fn new(
        stores: Stores,
        publisher: Arc<dyn EventPublisher>,
        fulfillment: Arc<dyn FulfillmentNotifier>,
        topic: impl Into<String>,
        config: &PipelineConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let stage = PublishStage {
            stores: stores.clone(),
            publisher,
            topic: topic.into(),
            store_timeout: config.store_timeout(),
            publish_timeout: config.publish_timeout(),
            metrics: metrics.clone(),
        };

        Self {
            stores,
            fulfillment,
            stage,
            store_timeout: config.store_timeout(),
            metrics,
            span: tracing::info_span!("order_processor"),
        }
    }

    // ========================================================================
    // CreateOrder
    // ========================================================================

    pub async fn create_order(&self, request: CreateOrder) -> Result<Order, OrderError> {
        let started = Instant::now();
        let span = tracing::info_span!(
            parent: &self.span,
            "create_order",
            account_id = %request.account_id,
            total = %request.total,
        );

        let result = self.create_order_inner(request).instrument(span).await;

        self.metrics
            .record_order(outcome_label(&result), started.elapsed().as_secs_f64());
        result.map(|(order, _)| order)
    }

    /// Returns the order and whether the request replayed an earlier one.
    async fn create_order_inner(&self, request: CreateOrder) -> Result<(Order, bool), OrderError> {
        if !is_valid_total(request.total) {
            return Err(OrderError::InvalidAmount(request.total));
        }

        let account = self.get_account(&request.account_id).await?;

        // With a key this may be a retry of a request that already debited,
        // so the ledger decides after its duplicate check
        if request.idempotency_key.is_none() && !account.can_cover(request.total) {
            return Err(OrderError::InsufficientFunds {
                account_id: account.id,
                balance: account.balance,
                requested: request.total,
            });
        }

        let new_order = NewOrder {
            account_id: request.account_id,
            total: request.total,
            idempotency_key: request.idempotency_key,
        };
        let outcome = bounded(
            self.store_timeout,
            "commit_debit",
            self.stores.ledger.commit_debit(new_order),
        )
        .await?;

        let duplicate = outcome.is_duplicate();
        let order = outcome.into_order();
        tracing::info!(order_id = %order.id, duplicate, status = %order.status, "Order debited");

        if order.status != OrderStatus::Debited {
            // A duplicate that already made it past publishing
            return Ok((order, duplicate));
        }

        let order = self.spawn_publish(order).await?;
        Ok((order, duplicate))
    }

    /// Publishing runs in its own task: once the debit is committed, a caller
    /// that goes away must not be able to stop the event from going out.
    async fn spawn_publish(&self, order: Order) -> Result<Order, OrderError> {
        let fallback = order.clone();
        let stage = self.stage.clone();
        let task = tokio::spawn(
            stage
                .publish_and_advance(order)
                .instrument(tracing::Span::current()),
        );

        match task.await {
            Ok(result) => result,
            Err(e) => Err(OrderError::PublishFailed {
                order: Box::new(fallback),
                reason: format!("publish task failed: {e}"),
            }),
        }
    }

    // ========================================================================
    // HandleOrderEvent
    // ========================================================================

    pub async fn handle_order_event(
        &self,
        event: &OrderCreatedEvent,
    ) -> Result<EventDisposition, OrderError> {
        let span = tracing::info_span!(parent: &self.span, "handle_order_event", order_id = %event.order_id);
        self.handle_order_event_inner(event).instrument(span).await
    }

    async fn handle_order_event_inner(
        &self,
        event: &OrderCreatedEvent,
    ) -> Result<EventDisposition, OrderError> {
        let mut order = self.get_order(event.order_id).await?;

        if !event.describes(&order) {
            return Err(OrderError::EventMismatch {
                order_id: event.order_id,
            });
        }

        let mut notified = false;
        for _ in 0..MAX_ACK_ATTEMPTS {
            match order.status {
                OrderStatus::Acknowledged => {
                    tracing::debug!("Order already acknowledged, nothing to do");
                    return Ok(EventDisposition::AlreadyAcknowledged);
                }
                OrderStatus::Pending => {
                    return Err(OrderError::Conflict {
                        order_id: order.id,
                        expected: OrderStatus::Debited,
                        actual: OrderStatus::Pending,
                    });
                }
                OrderStatus::Debited | OrderStatus::Published | OrderStatus::Failed => {}
            }

            if !notified {
                self.fulfillment
                    .order_confirmed(&order)
                    .await
                    .map_err(|e| OrderError::FulfillmentFailed(e.to_string()))?;
                notified = true;
            }

            let advanced = bounded(
                self.store_timeout,
                "advance_status",
                self.stores
                    .orders
                    .advance_status(order.id, order.status, OrderStatus::Acknowledged),
            )
            .await;

            match advanced {
                Ok(acknowledged) => {
                    tracing::info!(order_id = %acknowledged.id, "Order acknowledged");
                    return Ok(EventDisposition::Acknowledged);
                }
                Err(OrderError::Conflict { actual, .. }) => {
                    tracing::debug!(status = %actual, "Status moved underneath, re-reading");
                    order = self.get_order(order.id).await?;
                }
                Err(e) => return Err(e),
            }
        }

        Err(OrderError::Conflict {
            order_id: order.id,
            expected: order.status,
            actual: order.status,
        })
    }

    // ========================================================================
    // Reconciliation support
    // ========================================================================

    /// Publishes a stalled order again and advances it to `Published`.
    pub async fn republish(&self, order: &Order) -> Result<Order, OrderError> {
        let span = tracing::info_span!(parent: &self.span, "republish", order_id = %order.id);
        self.spawn_publish(order.clone()).instrument(span).await
    }

    pub async fn stalled_orders(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>, OrderError> {
        bounded(
            self.store_timeout,
            "list_stalled",
            self.stores
                .orders
                .list_stalled(OrderStatus::Debited, older_than, limit),
        )
        .await
    }

    /// Gives up on publishing: the order needs manual intervention.
    pub async fn mark_failed(&self, order: &Order) -> Result<Order, OrderError> {
        bounded(
            self.store_timeout,
            "advance_status",
            self.stores
                .orders
                .advance_status(order.id, OrderStatus::Debited, OrderStatus::Failed),
        )
        .await
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn get_order(&self, id: Uuid) -> Result<Order, OrderError> {
        bounded(self.store_timeout, "get_order", self.stores.orders.get_order(id)).await
    }

    pub async fn get_account(&self, id: &AccountId) -> Result<Account, OrderError> {
        bounded(self.store_timeout, "get_account", self.stores.accounts.get_account(id)).await
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>, OrderError> {
        bounded(self.store_timeout, "list_accounts", self.stores.accounts.list_accounts()).await
    }
}

fn outcome_label(result: &Result<(Order, bool), OrderError>) -> &'static str {
    match result {
        Ok((_, true)) => "duplicate",
        Ok((_, false)) => "published",
        Err(OrderError::InvalidAmount(_)) => "invalid_amount",
        Err(OrderError::AccountNotFound(_)) => "account_not_found",
        Err(OrderError::InsufficientFunds { .. }) => "insufficient_funds",
        Err(OrderError::IdempotencyKeyReused { .. }) => "idempotency_key_reused",
        Err(OrderError::PublishFailed { .. }) => "publish_failed",
        Err(OrderError::PersistenceFailure(_)) => "persistence_failure",
        Err(_) => "other",
    }
}
