use rust_decimal::Decimal;
use uuid::Uuid;

use super::value_objects::{Order, OrderStatus};
use crate::domain::AccountId;
use crate::utils::IsTransient;

// ============================================================================
// Order Pipeline Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("Invalid order total {0}: must be positive with at most 4 decimal places")]
    InvalidAmount(Decimal),

    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Order not found: {0}")]
    OrderNotFound(Uuid),

    #[error("Insufficient funds on account {account_id}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account_id: AccountId,
        balance: Decimal,
        requested: Decimal,
    },

    #[error("Order {order_id} is {actual}, expected {expected}")]
    Conflict {
        order_id: Uuid,
        expected: OrderStatus,
        actual: OrderStatus,
    },

    #[error("Idempotency key {key} was already used for a different order")]
    IdempotencyKeyReused { key: String },

    #[error("Event for order {order_id} does not match the stored order")]
    EventMismatch { order_id: Uuid },

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    /// The order is debited and stored but its event did not go out. The
    /// reconciliation sweep picks it up later.
    #[error("Order {} debited but event not published: {reason}", order.id)]
    PublishFailed { order: Box<Order>, reason: String },

    #[error("Fulfillment notification failed: {0}")]
    FulfillmentFailed(String),
}

impl IsTransient for OrderError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            OrderError::PersistenceFailure(_)
                | OrderError::PublishFailed { .. }
                | OrderError::FulfillmentFailed(_)
                | OrderError::Conflict { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_business_rejections_are_not_transient() {
        let err = OrderError::InsufficientFunds {
            account_id: AccountId::new("A1"),
            balance: dec!(5),
            requested: dec!(10),
        };
        assert!(!err.is_transient());
        assert!(!OrderError::AccountNotFound(AccountId::new("A1")).is_transient());
        assert!(!OrderError::EventMismatch { order_id: Uuid::nil() }.is_transient());
    }

    #[test]
    fn test_infrastructure_errors_are_transient() {
        assert!(OrderError::PersistenceFailure("timeout".into()).is_transient());
        assert!(OrderError::FulfillmentFailed("503".into()).is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = OrderError::Conflict {
            order_id: Uuid::nil(),
            expected: OrderStatus::Debited,
            actual: OrderStatus::Acknowledged,
        };
        assert_eq!(
            err.to_string(),
            "Order 00000000-0000-0000-0000-000000000000 is acknowledged, expected debited"
        );
    }
}
