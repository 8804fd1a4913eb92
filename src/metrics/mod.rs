// Private module declaration
mod server;

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

use crate::health::HealthStatus;
use crate::utils::CircuitState;

// Re-export for public API
pub use server::start_metrics_server;

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Covers:
// - Order creation (outcome, latency)
// - Event publishing and consumption
// - Reconciliation sweeps
// - Dead letter topic traffic
// - Circuit breaker state transitions
// - Aggregated service health
//
// All metrics are registered with one registry and scraped via /metrics
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Order path
    pub orders_total: IntCounterVec,
    pub operation_duration: HistogramVec,

    // Messaging
    pub events_published: IntCounterVec,
    pub events_consumed: IntCounterVec,
    pub dlq_messages_total: IntCounter,
    pub dlq_messages_by_topic: IntCounterVec,

    // Reconciliation
    pub reconciled_orders: IntCounterVec,
    pub reconciliation_sweeps: IntCounter,

    // Circuit Breaker Metrics
    pub circuit_breaker_state: IntGauge,
    pub circuit_breaker_transitions: IntCounterVec,

    pub health_status: IntGauge,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let orders_total = IntCounterVec::new(
            Opts::new("orders_total", "CreateOrder calls by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(orders_total.clone()))?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new("order_operation_duration_seconds", "Pipeline operation duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["operation"],
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        let events_published = IntCounterVec::new(
            Opts::new("order_events_published_total", "Order event publish attempts"),
            &["outcome"],
        )?;
        registry.register(Box::new(events_published.clone()))?;

        let events_consumed = IntCounterVec::new(
            Opts::new("order_events_consumed_total", "Consumed order events by disposition"),
            &["disposition"],
        )?;
        registry.register(Box::new(events_consumed.clone()))?;

        let dlq_messages_total = IntCounter::new(
            "dlq_messages_total",
            "Total messages forwarded to a dead letter topic",
        )?;
        registry.register(Box::new(dlq_messages_total.clone()))?;

        let dlq_messages_by_topic = IntCounterVec::new(
            Opts::new("dlq_messages_by_topic", "DLQ messages by source topic"),
            &["topic"],
        )?;
        registry.register(Box::new(dlq_messages_by_topic.clone()))?;

        let reconciled_orders = IntCounterVec::new(
            Opts::new("reconciled_orders_total", "Stalled orders handled by reconciliation"),
            &["outcome"],
        )?;
        registry.register(Box::new(reconciled_orders.clone()))?;

        let reconciliation_sweeps = IntCounter::new(
            "reconciliation_sweeps_total",
            "Completed reconciliation sweeps",
        )?;
        registry.register(Box::new(reconciliation_sweeps.clone()))?;

        // Circuit Breaker Metrics
        let circuit_breaker_state = IntGauge::new(
            "circuit_breaker_state",
            "Circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)",
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        let circuit_breaker_transitions = IntCounterVec::new(
            Opts::new("circuit_breaker_transitions_total", "Circuit breaker state transitions"),
            &["from_state", "to_state"],
        )?;
        registry.register(Box::new(circuit_breaker_transitions.clone()))?;

        let health_status = IntGauge::new(
            "service_health_status",
            "Service health status (0=Unhealthy, 1=Degraded, 2=Healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        Ok(Self {
            registry,
            orders_total,
            operation_duration,
            events_published,
            events_consumed,
            dlq_messages_total,
            dlq_messages_by_topic,
            reconciled_orders,
            reconciliation_sweeps,
            circuit_breaker_state,
            circuit_breaker_transitions,
            health_status,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_order(&self, outcome: &str, duration_secs: f64) {
        self.orders_total.with_label_values(&[outcome]).inc();
        self.operation_duration
            .with_label_values(&["create_order"])
            .observe(duration_secs);
    }

    pub fn record_publish(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.events_published.with_label_values(&[outcome]).inc();
    }

    pub fn record_consumed(&self, disposition: &str, duration_secs: f64) {
        self.events_consumed.with_label_values(&[disposition]).inc();
        self.operation_duration
            .with_label_values(&["handle_order_event"])
            .observe(duration_secs);
    }

    pub fn record_reconciled(&self, outcome: &str) {
        self.reconciled_orders.with_label_values(&[outcome]).inc();
    }

    pub fn record_dlq_message(&self, source_topic: &str) {
        self.dlq_messages_total.inc();
        self.dlq_messages_by_topic.with_label_values(&[source_topic]).inc();
    }

    pub fn record_circuit_breaker_transition(&self, from: CircuitState, to: CircuitState) {
        self.circuit_breaker_state.set(to.as_gauge());
        self.circuit_breaker_transitions
            .with_label_values(&[&format!("{from:?}"), &format!("{to:?}")])
            .inc();
    }

    pub fn update_health(&self, status: &HealthStatus) {
        self.health_status.set(status.as_gauge());
    }
}
