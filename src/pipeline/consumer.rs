use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

use super::processor::OrderProcessor;
use crate::domain::order::{OrderCreatedEvent, OrderError};
use crate::messaging::{HandlerError, Message, MessageHandler};
use crate::metrics::Metrics;
use crate::utils::IsTransient;

/// Bridges the order topic to `OrderProcessor::handle_order_event`.
///
/// Error classification:
/// - undecodable payload, unknown order, mismatched event: permanent (DLQ)
/// - store outage, fulfillment outage, status races: transient (redeliver)
pub struct OrderEventHandler {
    processor: Arc<OrderProcessor>,
    metrics: Arc<Metrics>,
}

impl OrderEventHandler {
    pub fn new(processor: Arc<OrderProcessor>, metrics: Arc<Metrics>) -> Self {
        Self { processor, metrics }
    }
}

fn classify(err: OrderError) -> HandlerError {
    if err.is_transient() {
        HandlerError::Transient(err.to_string())
    } else {
        HandlerError::Permanent(err.to_string())
    }
}

#[async_trait]
impl MessageHandler for OrderEventHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let started = Instant::now();

        let event: OrderCreatedEvent = match message.decode() {
            Ok(event) => event,
            Err(e) => {
                self.metrics
                    .record_consumed("undecodable", started.elapsed().as_secs_f64());
                return Err(e);
            }
        };

        match self.processor.handle_order_event(&event).await {
            Ok(disposition) => {
                self.metrics
                    .record_consumed(disposition.as_label(), started.elapsed().as_secs_f64());
                Ok(())
            }
            Err(e) => {
                let failure = classify(e);
                let label = if failure.is_transient() { "retry" } else { "rejected" };
                self.metrics
                    .record_consumed(label, started.elapsed().as_secs_f64());
                Err(failure)
            }
        }
    }
}
