// ============================================================================
// Order Pipeline
// ============================================================================
//
// - processor:   CreateOrder and HandleOrderEvent
// - consumer:    MessageHandler for the order topic
// - reconciler:  periodic repair of debited-but-unpublished orders
// - fulfillment: the downstream action run per acknowledged order
//
// ============================================================================

pub mod consumer;
pub mod fulfillment;
pub mod processor;
pub mod reconciler;

pub use consumer::OrderEventHandler;
pub use fulfillment::{FulfillmentError, FulfillmentNotifier, LoggingFulfillment};
pub use processor::{EventDisposition, OrderProcessor};
pub use reconciler::{Reconciler, SweepReport};
