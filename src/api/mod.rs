// ============================================================================
// HTTP API
// ============================================================================
//
// - POST /orders          create an order (debit + publish)
// - GET  /orders/{id}     read an order
// - GET  /accounts/{id}   read an account balance
// - GET  /health          aggregated component health
//
// Metrics live on their own port, see `metrics::server`.
//
// ============================================================================

pub mod orders;

use actix_web::http::StatusCode;
use actix_web::{web, App, HttpResponse, HttpServer, ResponseError};
use serde::Serialize;
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::domain::order::{Order, OrderError};
use crate::health::HealthMonitor;
use crate::pipeline::OrderProcessor;

/// Shared handler state.
pub struct ApiState {
    pub processor: Arc<OrderProcessor>,
    pub health: Arc<HealthMonitor>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Order(#[from] OrderError),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    order: Option<&'a Order>,
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Order(e) => match e {
                OrderError::InvalidAmount(_) => "invalid_amount",
                OrderError::AccountNotFound(_) => "account_not_found",
                OrderError::OrderNotFound(_) => "order_not_found",
                OrderError::InsufficientFunds { .. } => "insufficient_funds",
                OrderError::Conflict { .. } => "conflict",
                OrderError::IdempotencyKeyReused { .. } => "idempotency_key_reused",
                OrderError::EventMismatch { .. } => "event_mismatch",
                OrderError::PersistenceFailure(_) => "persistence_failure",
                OrderError::PublishFailed { .. } => "publish_failed",
                OrderError::FulfillmentFailed(_) => "fulfillment_failed",
            },
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Order(e) => match e {
                OrderError::InvalidAmount(_) => StatusCode::BAD_REQUEST,
                OrderError::AccountNotFound(_) | OrderError::OrderNotFound(_) => StatusCode::NOT_FOUND,
                OrderError::InsufficientFunds { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                OrderError::Conflict { .. } | OrderError::IdempotencyKeyReused { .. } => {
                    StatusCode::CONFLICT
                }
                OrderError::PersistenceFailure(_) | OrderError::PublishFailed { .. } => {
                    StatusCode::BAD_GATEWAY
                }
                OrderError::EventMismatch { .. } | OrderError::FulfillmentFailed(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    fn error_response(&self) -> HttpResponse {
        // A failed publish still created a debited order; the caller gets it
        let order = match self {
            ApiError::Order(OrderError::PublishFailed { order, .. }) => Some(order.as_ref()),
            _ => None,
        };

        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.code(),
            message: self.to_string(),
            order,
        })
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    let json = web::JsonConfig::default()
        .error_handler(|err, _req| ApiError::BadRequest(err.to_string()).into());

    cfg.app_data(json)
        .route("/orders", web::post().to(orders::create_order))
        .route("/orders/{id}", web::get().to(orders::get_order))
        .route("/accounts", web::get().to(orders::list_accounts))
        .route("/accounts/{id}", web::get().to(orders::get_account))
        .route("/health", web::get().to(orders::health));
}

/// Runs the order API until the server receives a stop signal.
pub async fn start_api_server(state: ApiState, config: &ServerConfig) -> std::io::Result<()> {
    let state = web::Data::new(state);
    tracing::info!(host = %config.host, port = config.port, "Starting order API");

    HttpServer::new(move || App::new().app_data(state.clone()).configure(configure))
        .bind((config.host.as_str(), config.port))?
        .run()
        .await
}
