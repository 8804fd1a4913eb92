// ============================================================================
// Order Pipeline
// ============================================================================
//
// HTTP order creation with an atomic account debit, an order-created event
// on Kafka/Redpanda, an idempotent consumer, and a reconciliation sweep for
// orders whose event never went out.
//
// ============================================================================

pub mod api;
pub mod config;
pub mod domain;
pub mod health;
pub mod messaging;
pub mod metrics;
pub mod pipeline;
pub mod store;
pub mod utils;
