use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;

use crate::metrics::Metrics;
use crate::store::OrderStore;
use crate::utils::CircuitState;

// ============================================================================
// Health Check Abstractions
// ============================================================================
//
// Each dependency reports a ComponentHealth; the monitor folds them into one
// SystemHealth for the /health endpoint. One unhealthy component makes the
// whole service unhealthy, a degraded one makes it degraded.
//
// ============================================================================

/// Health status of a component
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy(_))
    }

    /// Encoding used by the `service_health_status` gauge
    pub fn as_gauge(&self) -> i64 {
        match self {
            HealthStatus::Unhealthy(_) => 0,
            HealthStatus::Degraded(_) => 1,
            HealthStatus::Healthy => 2,
        }
    }
}

impl From<CircuitState> for HealthStatus {
    fn from(state: CircuitState) -> Self {
        match state {
            CircuitState::Closed => HealthStatus::Healthy,
            CircuitState::HalfOpen => HealthStatus::Degraded("Circuit breaker half-open".to_string()),
            CircuitState::Open => HealthStatus::Unhealthy("Circuit breaker open".to_string()),
        }
    }
}

/// Health information for a component
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    #[serde(flatten)]
    pub status: HealthStatus,
    pub last_check: DateTime<Utc>,
}

impl ComponentHealth {
    pub fn new(name: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            status,
            last_check: Utc::now(),
        }
    }
}

#[async_trait]
pub trait HealthCheckable: Send + Sync {
    fn component_name(&self) -> &str;

    async fn check_health(&self) -> ComponentHealth;
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub overall: HealthStatus,
    pub components: Vec<ComponentHealth>,
    pub check_time: DateTime<Utc>,
}

impl SystemHealth {
    pub fn from_components(components: Vec<ComponentHealth>) -> Self {
        let mut has_degraded = false;
        let mut unhealthy_components = Vec::new();

        for health in &components {
            match &health.status {
                HealthStatus::Unhealthy(msg) => {
                    unhealthy_components.push(format!("{}: {}", health.name, msg));
                }
                HealthStatus::Degraded(_) => {
                    has_degraded = true;
                }
                HealthStatus::Healthy => {}
            }
        }

        let overall = if !unhealthy_components.is_empty() {
            HealthStatus::Unhealthy(unhealthy_components.join(", "))
        } else if has_degraded {
            HealthStatus::Degraded("Some components degraded".to_string())
        } else {
            HealthStatus::Healthy
        };

        Self {
            overall,
            components,
            check_time: Utc::now(),
        }
    }
}

/// Database reachability, probed with a trivial query.
pub struct DatabaseHealth {
    store: Arc<dyn OrderStore>,
}

impl DatabaseHealth {
    pub fn new(store: Arc<dyn OrderStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthCheckable for DatabaseHealth {
    fn component_name(&self) -> &str {
        "database"
    }

    async fn check_health(&self) -> ComponentHealth {
        let status = match self.store.ping().await {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => HealthStatus::Unhealthy(e.to_string()),
        };
        ComponentHealth::new(self.component_name(), status)
    }
}

pub struct HealthMonitor {
    components: Vec<Arc<dyn HealthCheckable>>,
    metrics: Arc<Metrics>,
}

impl HealthMonitor {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            components: Vec::new(),
            metrics,
        }
    }

    pub fn with_component(mut self, component: Arc<dyn HealthCheckable>) -> Self {
        self.components.push(component);
        self
    }

    pub async fn check(&self) -> SystemHealth {
        let results = join_all(self.components.iter().map(|c| c.check_health())).await;

        let health = SystemHealth::from_components(results);
        self.metrics.update_health(&health.overall);

        if !health.overall.is_healthy() {
            tracing::warn!(status = ?health.overall, "Service health check not healthy");
        }
        health
    }
}
