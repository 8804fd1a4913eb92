use actix_web::{web, HttpRequest, HttpResponse};
use uuid::Uuid;

use super::{ApiError, ApiState};
use crate::domain::order::CreateOrder;
use crate::domain::AccountId;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Body field and header may both carry the key; they must agree.
fn resolve_idempotency_key(req: &HttpRequest, body: &mut CreateOrder) -> Result<(), ApiError> {
    let header = match req.headers().get(IDEMPOTENCY_KEY_HEADER) {
        Some(value) => Some(
            value
                .to_str()
                .map_err(|_| ApiError::BadRequest("Idempotency-Key header is not valid text".into()))?
                .trim()
                .to_string(),
        ),
        None => None,
    };

    match (header, body.idempotency_key.clone()) {
        (Some(h), _) if h.is_empty() => Err(ApiError::BadRequest("Idempotency-Key header is empty".into())),
        (Some(h), Some(b)) if h != b => Err(ApiError::BadRequest(
            "Idempotency-Key header and idempotencyKey field differ".into(),
        )),
        (Some(h), None) => {
            body.idempotency_key = Some(h);
            Ok(())
        }
        _ => Ok(()),
    }
}

pub async fn create_order(
    state: web::Data<ApiState>,
    req: HttpRequest,
    body: web::Json<CreateOrder>,
) -> Result<HttpResponse, ApiError> {
    let mut request = body.into_inner();
    resolve_idempotency_key(&req, &mut request)?;

    let order = state.processor.create_order(request).await?;
    Ok(HttpResponse::Created().json(order))
}

pub async fn get_order(state: web::Data<ApiState>, path: web::Path<Uuid>) -> Result<HttpResponse, ApiError> {
    let order = state.processor.get_order(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(order))
}

pub async fn get_account(
    state: web::Data<ApiState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let account = state
        .processor
        .get_account(&AccountId::new(path.into_inner()))
        .await?;
    Ok(HttpResponse::Ok().json(account))
}

pub async fn list_accounts(state: web::Data<ApiState>) -> Result<HttpResponse, ApiError> {
    let accounts = state.processor.list_accounts().await?;
    Ok(HttpResponse::Ok().json(accounts))
}

pub async fn health(state: web::Data<ApiState>) -> HttpResponse {
    let health = state.health.check().await;

    if health.overall.is_unhealthy() {
        HttpResponse::ServiceUnavailable().json(health)
    } else {
        HttpResponse::Ok().json(health)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::health::{DatabaseHealth, HealthMonitor};
    use crate::messaging::InMemoryBroker;
    use crate::metrics::Metrics;
    use crate::pipeline::{LoggingFulfillment, OrderProcessor};
    use crate::store::{InMemoryStore, Stores};
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use rust_decimal_macros::dec;
    use serde_json::{json, Value};
    use std::sync::Arc;

    struct Fixture {
        store: Arc<InMemoryStore>,
        broker: Arc<InMemoryBroker>,
        state: web::Data<ApiState>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        store.seed_account("A1", dec!(100)).await;
        let broker = Arc::new(InMemoryBroker::new());
        let metrics = Arc::new(Metrics::new().unwrap());

        let processor = Arc::new(OrderProcessor::new(
            Stores::from_shared(store.clone()),
            broker.clone(),
            Arc::new(LoggingFulfillment),
            "orders.created",
            &PipelineConfig::default(),
            metrics.clone(),
        ));
        let health = HealthMonitor::new(metrics)
            .with_component(Arc::new(DatabaseHealth::new(store.clone())))
            .with_component(broker.clone());

        Fixture {
            store,
            broker,
            state: web::Data::new(ApiState {
                processor,
                health: Arc::new(health),
            }),
        }
    }

    macro_rules! app {
        ($fixture:expr) => {
            test::init_service(
                App::new()
                    .app_data($fixture.state.clone())
                    .configure(crate::api::configure),
            )
            .await
        };
    }

    fn post_order(body: Value) -> test::TestRequest {
        test::TestRequest::post().uri("/orders").set_json(body)
    }

    #[actix_web::test]
    async fn test_create_order_returns_published_order() {
        let f = fixture().await;
        let app = app!(f);

        let req = post_order(json!({"accountId": "A1", "total": 10.5})).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "published");
        assert_eq!(body["accountId"], "A1");
        assert_eq!(body["total"], 10.5);

        let req = test::TestRequest::get().uri("/accounts/A1").to_request();
        let account: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(account["balance"], 89.5);

        let id = body["id"].as_str().unwrap();
        let req = test::TestRequest::get().uri(&format!("/orders/{id}")).to_request();
        let fetched: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(fetched["id"], body["id"]);
    }

    #[actix_web::test]
    async fn test_error_statuses() {
        let f = fixture().await;
        let app = app!(f);

        let cases = [
            (json!({"accountId": "A1", "total": 0}), StatusCode::BAD_REQUEST, "invalid_amount"),
            (json!({"accountId": "A1", "total": 10.12345}), StatusCode::BAD_REQUEST, "invalid_amount"),
            (json!({"accountId": "A1", "total": 0.00001}), StatusCode::BAD_REQUEST, "invalid_amount"),
            (json!({"accountId": "A1", "total": "1234567890123.4567"}), StatusCode::BAD_REQUEST, "invalid_amount"),
            (json!({"accountId": "A1"}), StatusCode::BAD_REQUEST, "bad_request"),
            (json!({"accountId": "nobody", "total": 1}), StatusCode::NOT_FOUND, "account_not_found"),
            (json!({"accountId": "A1", "total": 1000}), StatusCode::UNPROCESSABLE_ENTITY, "insufficient_funds"),
        ];

        for (body, status, code) in cases {
            let resp = test::call_service(&app, post_order(body).to_request()).await;
            assert_eq!(resp.status(), status);
            let body: Value = test::read_body_json(resp).await;
            assert_eq!(body["error"], code);
        }

        let req = test::TestRequest::get()
            .uri(&format!("/orders/{}", Uuid::now_v7()))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        // Nothing was debited by the rejected requests
        let req = test::TestRequest::get().uri("/accounts/A1").to_request();
        let account: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(account["balance"], 100.0);
        assert!(f.store.orders_for(&AccountId::new("A1")).await.is_empty());
    }

    #[actix_web::test]
    async fn test_list_accounts() {
        let f = fixture().await;
        f.store.seed_account("B7", dec!(12.5)).await;
        let app = app!(f);

        let req = test::TestRequest::get().uri("/accounts").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let accounts: Value = test::read_body_json(resp).await;
        let accounts = accounts.as_array().unwrap();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0]["id"], "A1");
        assert_eq!(accounts[1]["id"], "B7");
        assert_eq!(accounts[1]["balance"], 12.5);

        f.store.set_available(false);
        let req = test::TestRequest::get().uri("/accounts").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_GATEWAY);
    }

    #[actix_web::test]
    async fn test_idempotency_key_header() {
        let f = fixture().await;
        let app = app!(f);

        let mut ids = Vec::new();
        for _ in 0..2 {
            let req = test::TestRequest::post()
                .uri("/orders")
                .insert_header((IDEMPOTENCY_KEY_HEADER, "req-42"))
                .set_json(json!({"accountId": "A1", "total": 30}))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::CREATED);
            let body: Value = test::read_body_json(resp).await;
            ids.push(body["id"].clone());
        }
        assert_eq!(ids[0], ids[1]);
        assert_eq!(f.store.orders_for(&AccountId::new("A1")).await.len(), 1);

        let req = test::TestRequest::post()
            .uri("/orders")
            .insert_header((IDEMPOTENCY_KEY_HEADER, "req-42"))
            .set_json(json!({"accountId": "A1", "total": 31}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CONFLICT);

        let req = test::TestRequest::post()
            .uri("/orders")
            .insert_header((IDEMPOTENCY_KEY_HEADER, "a"))
            .set_json(json!({"accountId": "A1", "total": 1, "idempotencyKey": "b"}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_publish_failure_is_bad_gateway_with_order() {
        let f = fixture().await;
        f.broker.set_available(false);
        let app = app!(f);

        let resp = test::call_service(
            &app,
            post_order(json!({"accountId": "A1", "total": 25})).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "publish_failed");
        assert_eq!(body["order"]["status"], "debited");
        assert_eq!(body["order"]["publishAttempts"], 1);
    }

    #[actix_web::test]
    async fn test_health_reports_unavailable_components() {
        let f = fixture().await;
        let app = app!(f);

        let req = test::TestRequest::get().uri("/health").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        f.store.set_available(false);
        let req = test::TestRequest::get().uri("/health").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["overall"]["status"], "unhealthy");
    }
}
