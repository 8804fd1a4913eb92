use async_trait::async_trait;

use crate::domain::order::Order;

/// Downstream action taken once per acknowledged order.
///
/// Delivery is at-least-once: a crash between a successful notification and
/// the `Acknowledged` write means the notifier sees the order again.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FulfillmentNotifier: Send + Sync {
    async fn order_confirmed(&self, order: &Order) -> Result<(), FulfillmentError>;
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct FulfillmentError(pub String);

/// Default notifier: records the hand-off in the service log.
pub struct LoggingFulfillment;

#[async_trait]
impl FulfillmentNotifier for LoggingFulfillment {
    async fn order_confirmed(&self, order: &Order) -> Result<(), FulfillmentError> {
        tracing::info!(
            order_id = %order.id,
            account_id = %order.account_id,
            total = %order.total,
            "📦 Order handed to fulfillment"
        );
        Ok(())
    }
}
