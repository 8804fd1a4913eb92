use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::total_survives_wire;
use crate::domain::AccountId;

// ============================================================================
// Order Value Objects
// ============================================================================

/// Lifecycle of an order.
///
/// `Pending` only exists inside the debit transaction; once committed an
/// order is `Debited`. `Published` means the order-created event left the
/// service, `Acknowledged` means the consumer ran the downstream action.
/// `Failed` marks an order reconciliation gave up publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Debited,
    Published,
    Acknowledged,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Debited => "debited",
            OrderStatus::Published => "published",
            OrderStatus::Acknowledged => "acknowledged",
            OrderStatus::Failed => "failed",
        }
    }

    /// Forward-only transitions. Anything else would regress the order.
    pub fn can_advance_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;

        matches!(
            (self, next),
            (Pending, Debited)
                | (Debited, Published)
                | (Debited, Acknowledged)
                | (Debited, Failed)
                | (Published, Acknowledged)
                | (Failed, Acknowledged)
        )
    }

}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "debited" => Ok(OrderStatus::Debited),
            "published" => Ok(OrderStatus::Published),
            "acknowledged" => Ok(OrderStatus::Acknowledged),
            "failed" => Ok(OrderStatus::Failed),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: Uuid,
    pub account_id: AccountId,
    #[serde(with = "rust_decimal::serde::float")]
    pub total: Decimal,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub publish_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What the ledger needs to create an order. The id and timestamps are
/// assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub account_id: AccountId,
    pub total: Decimal,
    pub idempotency_key: Option<String>,
}

impl NewOrder {
    /// True when an existing order could have been produced by this request.
    pub fn matches(&self, order: &Order) -> bool {
        self.account_id == order.account_id && self.total == order.total
    }
}

/// Input of `OrderProcessor::create_order`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrder {
    pub account_id: AccountId,
    pub total: Decimal,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Decimal places a total may carry; balances and totals are NUMERIC(20, 4).
pub const TOTAL_SCALE: u32 = 4;

/// Totals stay below 10^16, the 16 integer digits of NUMERIC(20, 4).
fn total_limit() -> Decimal {
    Decimal::from(10_i64.pow(16))
}

/// A total the pipeline can carry unchanged: positive, at most four decimal
/// places, inside the column range, and exact through the event encoding.
pub fn is_valid_total(total: Decimal) -> bool {
    total > Decimal::ZERO
        && total.normalize().scale() <= TOTAL_SCALE
        && total < total_limit()
        && total_survives_wire(total)
}

impl CreateOrder {
    pub fn new(account_id: impl Into<String>, total: Decimal) -> Self {
        Self {
            account_id: AccountId::new(account_id),
            total,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_status_advances_forward_only() {
        assert!(OrderStatus::Pending.can_advance_to(OrderStatus::Debited));
        assert!(OrderStatus::Debited.can_advance_to(OrderStatus::Published));
        assert!(OrderStatus::Published.can_advance_to(OrderStatus::Acknowledged));

        assert!(!OrderStatus::Published.can_advance_to(OrderStatus::Debited));
        assert!(!OrderStatus::Acknowledged.can_advance_to(OrderStatus::Published));
        assert!(!OrderStatus::Pending.can_advance_to(OrderStatus::Published));
        assert!(!OrderStatus::Published.can_advance_to(OrderStatus::Failed));
    }

    #[test]
    fn test_acknowledged_is_terminal() {
        let all = [
            OrderStatus::Pending,
            OrderStatus::Debited,
            OrderStatus::Published,
            OrderStatus::Acknowledged,
            OrderStatus::Failed,
        ];

        for next in all {
            assert!(!OrderStatus::Acknowledged.can_advance_to(next));
        }
    }

    #[test]
    fn test_status_text_round_trip() {
        for status in [OrderStatus::Debited, OrderStatus::Failed] {
            let parsed: OrderStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("shipped".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn test_valid_totals() {
        assert!(is_valid_total(dec!(10.5)));
        assert!(is_valid_total(dec!(0.0001)));
        assert!(is_valid_total(dec!(10.12340)));

        assert!(!is_valid_total(Decimal::ZERO));
        assert!(!is_valid_total(dec!(-1)));
        assert!(!is_valid_total(dec!(10.12345)));
        assert!(!is_valid_total(dec!(0.00001)));
        assert!(!is_valid_total(dec!(1234567890123.4567)));
        assert!(!is_valid_total(total_limit()));
    }

    #[test]
    fn test_create_order_request_parsing() {
        let json = r#"{"accountId":"A1","total":10.25,"idempotencyKey":"req-1"}"#;
        let request: CreateOrder = serde_json::from_str(json).unwrap();

        assert_eq!(request.account_id, AccountId::new("A1"));
        assert_eq!(request.total, dec!(10.25));
        assert_eq!(request.idempotency_key.as_deref(), Some("req-1"));
    }

    #[test]
    fn test_new_order_matches_same_request_only() {
        let new_order = NewOrder {
            account_id: AccountId::new("A1"),
            total: dec!(10),
            idempotency_key: Some("k".to_string()),
        };
        let now = Utc::now();
        let mut order = Order {
            id: Uuid::now_v7(),
            account_id: AccountId::new("A1"),
            total: dec!(10),
            status: OrderStatus::Debited,
            idempotency_key: Some("k".to_string()),
            publish_attempts: 0,
            created_at: now,
            updated_at: now,
        };

        assert!(new_order.matches(&order));
        order.total = dec!(11);
        assert!(!new_order.matches(&order));
    }
}
