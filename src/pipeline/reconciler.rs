use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::processor::OrderProcessor;
use crate::config::ReconciliationConfig;
use crate::domain::order::{Order, OrderError};
use crate::metrics::Metrics;

// ============================================================================
// Reconciliation Sweep
// ============================================================================
//
// Finds orders stuck in `Debited` (debited, event never confirmed published)
// and pushes them through the publish stage again. An order that keeps
// failing is moved to `Failed` once it reaches `max_publish_attempts` and is
// left for an operator.
//
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub republished: usize,
    pub retry_later: usize,
    pub failed: usize,
}

enum Repair {
    Republished,
    RetryLater,
    GaveUp,
}

pub struct Reconciler {
    processor: Arc<OrderProcessor>,
    config: ReconciliationConfig,
    metrics: Arc<Metrics>,
}

impl Reconciler {
    pub fn new(processor: Arc<OrderProcessor>, config: ReconciliationConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            processor,
            config,
            metrics,
        }
    }

    /// One pass over the oldest stalled orders, at most `batch_size` of them.
    pub async fn sweep_once(&self) -> Result<SweepReport, OrderError> {
        let older_than = chrono::Duration::from_std(Duration::from_secs(self.config.min_age_secs))
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let stalled = self
            .processor
            .stalled_orders(older_than, self.config.batch_size)
            .await?;
        self.metrics.reconciliation_sweeps.inc();

        let mut report = SweepReport {
            scanned: stalled.len(),
            ..SweepReport::default()
        };

        for order in &stalled {
            match self.repair(order).await {
                Repair::Republished => report.republished += 1,
                Repair::RetryLater => report.retry_later += 1,
                Repair::GaveUp => report.failed += 1,
            }
        }

        if report.scanned > 0 {
            tracing::info!(
                scanned = report.scanned,
                republished = report.republished,
                retry_later = report.retry_later,
                failed = report.failed,
                "🔁 Reconciliation sweep finished"
            );
        }
        Ok(report)
    }

    async fn repair(&self, order: &Order) -> Repair {
        if order.publish_attempts >= self.config.max_publish_attempts {
            return self.give_up(order).await;
        }

        match self.processor.republish(order).await {
            Ok(_) => {
                self.metrics.record_reconciled("republished");
                Repair::Republished
            }
            Err(e) => {
                tracing::warn!(order_id = %order.id, error = %e, "Republish failed, will retry");
                self.metrics.record_reconciled("retry_later");
                Repair::RetryLater
            }
        }
    }

    async fn give_up(&self, order: &Order) -> Repair {
        match self.processor.mark_failed(order).await {
            Ok(failed) => {
                tracing::error!(
                    order_id = %failed.id,
                    account_id = %failed.account_id,
                    total = %failed.total,
                    attempts = failed.publish_attempts,
                    "❌ Order debited but never published; marked failed, needs manual review"
                );
                self.metrics.record_reconciled("failed");
                Repair::GaveUp
            }
            Err(e) => {
                tracing::warn!(order_id = %order.id, error = %e, "Could not mark order failed");
                self.metrics.record_reconciled("retry_later");
                Repair::RetryLater
            }
        }
    }

    /// Sweeps every `interval_secs` until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = self.config.interval_secs,
            min_age_secs = self.config.min_age_secs,
            "Reconciler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::warn!(error = %e, "Reconciliation sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::domain::order::{CreateOrder, OrderStatus};
    use crate::messaging::InMemoryBroker;
    use crate::pipeline::fulfillment::LoggingFulfillment;
    use crate::store::{InMemoryStore, OrderStore, Stores};
    use rust_decimal_macros::dec;

    const TOPIC: &str = "orders.created";

    struct Setup {
        store: Arc<InMemoryStore>,
        broker: Arc<InMemoryBroker>,
        processor: Arc<OrderProcessor>,
        metrics: Arc<Metrics>,
    }

    async fn setup() -> Setup {
        let store = Arc::new(InMemoryStore::new());
        store.seed_account("A1", dec!(100)).await;
        let broker = Arc::new(InMemoryBroker::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let processor = Arc::new(OrderProcessor::new(
            Stores::from_shared(store.clone()),
            broker.clone(),
            Arc::new(LoggingFulfillment),
            TOPIC,
            &PipelineConfig::default(),
            metrics.clone(),
        ));
        Setup {
            store,
            broker,
            processor,
            metrics,
        }
    }

    fn reconciler(s: &Setup, max_publish_attempts: i32) -> Reconciler {
        let config = ReconciliationConfig {
            enabled: true,
            interval_secs: 1,
            min_age_secs: 0,
            batch_size: 10,
            max_publish_attempts,
        };
        Reconciler::new(s.processor.clone(), config, s.metrics.clone())
    }

    async fn stalled_order(s: &Setup) -> Order {
        s.broker.set_available(false);
        let result = s.processor.create_order(CreateOrder::new("A1", dec!(10))).await;
        s.broker.set_available(true);

        match result {
            Err(OrderError::PublishFailed { order, .. }) => *order,
            other => panic!("expected PublishFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sweep_republishes_stalled_orders() {
        let s = setup().await;
        let order = stalled_order(&s).await;
        assert!(s.broker.messages(TOPIC).await.is_empty());

        let report = reconciler(&s, 5).sweep_once().await.unwrap();

        assert_eq!(report, SweepReport { scanned: 1, republished: 1, ..SweepReport::default() });
        assert_eq!(s.store.get_order(order.id).await.unwrap().status, OrderStatus::Published);
        assert_eq!(s.broker.messages(TOPIC).await.len(), 1);

        // Nothing left to do on the next pass
        let report = reconciler(&s, 5).sweep_once().await.unwrap();
        assert_eq!(report.scanned, 0);
    }

    #[tokio::test]
    async fn test_sweep_counts_failed_republish_attempts() {
        let s = setup().await;
        let order = stalled_order(&s).await;

        s.broker.set_available(false);
        let report = reconciler(&s, 5).sweep_once().await.unwrap();

        assert_eq!(report.retry_later, 1);
        let stored = s.store.get_order(order.id).await.unwrap();
        assert_eq!(stored.status, OrderStatus::Debited);
        assert_eq!(stored.publish_attempts, 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let s = setup().await;
        let order = stalled_order(&s).await;

        let report = reconciler(&s, 1).sweep_once().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(s.store.get_order(order.id).await.unwrap().status, OrderStatus::Failed);
        assert!(s.broker.messages(TOPIC).await.is_empty());
        assert_eq!(s.metrics.reconciled_orders.with_label_values(&["failed"]).get(), 1);
    }

    #[tokio::test]
    async fn test_young_orders_are_left_alone() {
        let s = setup().await;
        stalled_order(&s).await;

        let mut r = reconciler(&s, 5);
        r.config.min_age_secs = 3600;

        assert_eq!(r.sweep_once().await.unwrap().scanned, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let s = setup().await;
        let order = stalled_order(&s).await;
        let r = Arc::new(reconciler(&s, 5));
        let (tx, shutdown) = watch::channel(false);

        let task = {
            let r = r.clone();
            tokio::spawn(async move { r.run(shutdown).await })
        };

        // The first tick fires immediately
        for _ in 0..50 {
            if s.store.get_order(order.id).await.unwrap().status == OrderStatus::Published {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(s.store.get_order(order.id).await.unwrap().status, OrderStatus::Published);
    }
}
