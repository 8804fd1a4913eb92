use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::value_objects::Order;
use crate::domain::AccountId;

// ============================================================================
// Order Events - Wire contract published to the order topic
// ============================================================================

/// Published once an order has been debited.
///
/// JSON shape: `{"orderId": "...", "accountId": "...", "total": 10.5,
/// "createdAt": "2024-01-01T00:00:00Z"}`. The account id is the partition key
/// so all events of one account land on the same partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreatedEvent {
    pub order_id: Uuid,
    pub account_id: AccountId,
    #[serde(with = "rust_decimal::serde::float")]
    pub total: Decimal,
    pub created_at: DateTime<Utc>,
}

impl OrderCreatedEvent {
    pub fn partition_key(&self) -> &str {
        self.account_id.as_str()
    }

    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_payload(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }

    /// Same order, same account, same amount. Timestamps may differ in
    /// precision after a database round trip, so they are not compared.
    pub fn describes(&self, order: &Order) -> bool {
        self.order_id == order.id
            && self.account_id == order.account_id
            && self.total == order.total
    }
}

#[derive(Serialize, Deserialize)]
struct WireTotal(#[serde(with = "rust_decimal::serde::float")] Decimal);

/// True when `total` decodes back to the same value after the float
/// encoding used on the wire. `describes` compares totals exactly, so an
/// amount that fails this would never match its own event.
pub fn total_survives_wire(total: Decimal) -> bool {
    serde_json::to_vec(&WireTotal(total))
        .ok()
        .and_then(|bytes| serde_json::from_slice::<WireTotal>(&bytes).ok())
        .is_some_and(|decoded| decoded.0 == total)
}

impl From<&Order> for OrderCreatedEvent {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id,
            account_id: order.account_id.clone(),
            total: order.total,
            created_at: order.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::OrderStatus;
    use rust_decimal_macros::dec;

    fn order() -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::now_v7(),
            account_id: AccountId::new("A1"),
            total: dec!(10),
            status: OrderStatus::Debited,
            idempotency_key: None,
            publish_attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_wire_shape() {
        let order = order();
        let event = OrderCreatedEvent::from(&order);
        let json: serde_json::Value = serde_json::from_slice(&event.to_payload().unwrap()).unwrap();

        assert_eq!(json["orderId"], order.id.to_string());
        assert_eq!(json["accountId"], "A1");
        assert_eq!(json["total"], 10.0);
        assert!(json["createdAt"].as_str().unwrap().contains('T'));
        assert_eq!(json.as_object().unwrap().len(), 4);
    }

    #[test]
    fn test_parses_producer_payload() {
        let raw = br#"{"orderId":"0190a7e2-6d3c-7b4e-9a51-6f2d8c1e4b00","accountId":"A7","total":3.5,"createdAt":"2024-05-01T12:00:00Z"}"#;
        let event = OrderCreatedEvent::from_payload(raw).unwrap();

        assert_eq!(event.account_id, AccountId::new("A7"));
        assert_eq!(event.total, dec!(3.5));
        assert_eq!(event.partition_key(), "A7");
    }

    #[test]
    fn test_describes_detects_tampered_total() {
        let order = order();
        let mut event = OrderCreatedEvent::from(&order);
        assert!(event.describes(&order));

        event.total = dec!(11);
        assert!(!event.describes(&order));
    }

    #[test]
    fn test_total_survives_wire() {
        assert!(total_survives_wire(dec!(10.5)));
        assert!(total_survives_wire(dec!(19.99)));
        assert!(total_survives_wire(dec!(0.0001)));

        // 17 significant digits do not fit in an f64
        assert!(!total_survives_wire(dec!(1234567890123.4567)));
    }

    #[test]
    fn test_long_total_does_not_describe_its_order() {
        let mut order = order();
        order.total = dec!(1234567890123.4567);
        let event = OrderCreatedEvent::from_payload(&OrderCreatedEvent::from(&order).to_payload().unwrap()).unwrap();

        assert!(!event.describes(&order));
    }
}
