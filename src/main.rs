use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use order_pipeline::api::{start_api_server, ApiState};
use order_pipeline::config::{AppConfig, ObservabilityConfig};
use order_pipeline::health::{DatabaseHealth, HealthMonitor};
use order_pipeline::messaging::{
    ensure_topic_exists, DeliveryPolicy, EventSubscriber, RedpandaPublisher, RedpandaSubscriber,
};
use order_pipeline::metrics::{start_metrics_server, Metrics};
use order_pipeline::pipeline::{LoggingFulfillment, OrderEventHandler, OrderProcessor, Reconciler};
use order_pipeline::store::{PgStore, Stores};
use order_pipeline::utils::{retry_with_backoff, RetryConfig};

fn init_tracing(config: &ObservabilityConfig) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},order_pipeline=debug", config.log_level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(fmt::layer().json().with_current_span(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true).with_thread_ids(true)).init();
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config.observability);

    tracing::info!("🚀 Starting order pipeline");

    // === 1. Metrics ===
    let metrics = Arc::new(Metrics::new()?);
    let metrics_server = actix_web::rt::spawn(start_metrics_server(
        metrics.registry().clone(),
        config.observability.metrics_port,
    ));

    // === 2. Postgres ===
    tracing::info!("Connecting to Postgres...");
    let store = retry_with_backoff(RetryConfig::aggressive(), |_| PgStore::connect(&config.database))
        .await
        .into_result()?;
    store.init_schema().await?;
    let store = Arc::new(store);
    let stores = Stores::from_shared(store.clone());

    // === 3. Redpanda ===
    retry_with_backoff(RetryConfig::aggressive(), |_| ensure_topic_exists(&config.kafka))
        .await
        .into_result()?;
    let publisher = Arc::new(RedpandaPublisher::new(&config.kafka, metrics.clone())?);

    // === 4. Processor ===
    let processor = Arc::new(OrderProcessor::new(
        stores,
        publisher.clone(),
        Arc::new(LoggingFulfillment),
        config.kafka.topic.clone(),
        &config.pipeline,
        metrics.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // === 5. Consumer ===
    let policy = DeliveryPolicy {
        dlq_topic: config.kafka.dlq_topic(),
        redelivery: config.kafka.redelivery.clone(),
        dead_letters: publisher.clone(),
        metrics: metrics.clone(),
    };
    let subscriber = RedpandaSubscriber::new(&config.kafka, policy)?;
    let handler = Arc::new(OrderEventHandler::new(processor.clone(), metrics.clone()));
    let consumer = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = subscriber.run(handler, shutdown).await {
                tracing::error!(error = %e, "Consumer stopped with error");
            }
        })
    };

    // === 6. Reconciler ===
    let reconciler = if config.reconciliation.enabled {
        let reconciler = Reconciler::new(processor.clone(), config.reconciliation.clone(), metrics.clone());
        let shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move { reconciler.run(shutdown).await }))
    } else {
        tracing::info!("Reconciliation disabled");
        None
    };

    // === 7. HTTP API (returns on ctrl-c) ===
    let health = HealthMonitor::new(metrics.clone())
        .with_component(Arc::new(DatabaseHealth::new(store.clone())))
        .with_component(publisher.clone());
    let state = ApiState {
        processor,
        health: Arc::new(health),
    };
    start_api_server(state, &config.server).await?;

    // === 8. Shutdown ===
    tracing::info!("🛑 Shutting down background tasks");
    shutdown_tx.send(true)?;
    consumer.await?;
    if let Some(reconciler) = reconciler {
        reconciler.await?;
    }
    metrics_server.abort();

    tracing::info!("👋 Order pipeline stopped");
    Ok(())
}
