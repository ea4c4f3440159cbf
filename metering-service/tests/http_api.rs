//! HTTP surface tests against an in-memory backed router.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chrono::Utc;
use http_body_util::BodyExt;
use metering_service::cache::{MemoryQuotaCache, QuotaCache};
use metering_service::models::BillingContext;
use metering_service::ratelimit::{MemoryRateLimit, RateLimiter};
use metering_service::services::QuotaEnforcer;
use metering_service::startup::{build_router, AppState};
use metering_service::store::{MemoryStore, QuotaStore};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

struct TestApp {
    state: AppState,
    owner_id: Uuid,
    plan_id: Uuid,
}

async fn spawn_test_app(per_minute: Option<i32>) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let owner_id = Uuid::new_v4();
    let plan_id = Uuid::new_v4();

    store
        .upsert_feature_cost(&metering_service::models::UpsertFeatureCost {
            feature_key: "api.extract".parse().unwrap(),
            internal_cost_credits: Decimal::new(600, 2),
        })
        .await
        .unwrap();
    store
        .upsert_pricing_rule(&metering_service::models::UpsertPricingRule {
            plan_id,
            multiplier: Decimal::new(200, 2),
            credits_allocation: Decimal::new(100_00, 2),
            rate_limit_per_minute: per_minute,
            rate_limit_per_day: None,
        })
        .await
        .unwrap();

    let now = Utc::now();
    store
        .put_billing_context(BillingContext {
            owner_id,
            plan_id: Some(plan_id),
            period_start: None,
            period_end: None,
            anchor_utc: now - chrono::Duration::days(1),
            credits_used: Decimal::ZERO,
            created_utc: now,
            updated_utc: now,
        })
        .unwrap();

    let cache = Arc::new(QuotaCache::new(Arc::new(MemoryQuotaCache::new())));
    cache.init(store.as_ref()).await.unwrap();

    let store: Arc<dyn QuotaStore> = store;
    let limiter = RateLimiter::new(Arc::new(MemoryRateLimit::new()));
    let enforcer = Arc::new(QuotaEnforcer::new(store.clone(), cache.clone(), limiter));

    TestApp {
        state: AppState {
            store,
            cache,
            enforcer,
        },
        owner_id,
        plan_id,
    }
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn put_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn validate_body(owner_id: Uuid, request_id: &str) -> Value {
    json!({
        "owner_id": owner_id,
        "request_id": request_id,
        "feature_key": "api.extract",
        "endpoint": "/v1/extract",
        "method": "POST",
        "payload_hash": "a".repeat(64),
    })
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn validate_grants_and_reserves() {
    let app = spawn_test_app(None).await;
    let router = build_router(app.state.clone());

    let response = router
        .oneshot(post_json(
            "/internal/usage/validate",
            validate_body(app.owner_id, "req-1"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["access"], "granted");
    assert_eq!(body["replayed"], false);
    // 6.00 cost * 2.00 multiplier
    let reserved = Decimal::from_str(body["credits_reserved"].as_str().unwrap()).unwrap();
    assert_eq!(reserved, Decimal::new(12_00, 2));
    assert!(body["message"].as_str().unwrap().contains("Access granted"));
}

#[tokio::test]
async fn duplicate_validate_replays() {
    let app = spawn_test_app(None).await;
    let router = build_router(app.state.clone());

    let first = router
        .clone()
        .oneshot(post_json(
            "/internal/usage/validate",
            validate_body(app.owner_id, "req-1"),
        ))
        .await
        .unwrap();
    let first = json_body(first).await;

    let second = router
        .oneshot(post_json(
            "/internal/usage/validate",
            validate_body(app.owner_id, "req-1"),
        ))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let second = json_body(second).await;

    assert_eq!(second["replayed"], true);
    assert_eq!(second["usage_id"], first["usage_id"]);
}

#[tokio::test]
async fn rate_limited_validate_is_429_with_retry_after() {
    let app = spawn_test_app(Some(2)).await;
    let router = build_router(app.state.clone());

    for i in 0..2 {
        let response = router
            .clone()
            .oneshot(post_json(
                "/internal/usage/validate",
                validate_body(app.owner_id, &format!("req-{}", i)),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = router
        .oneshot(post_json(
            "/internal/usage/validate",
            validate_body(app.owner_id, "req-2"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(header::RETRY_AFTER));
    let body = json_body(response).await;
    assert_eq!(body["access"], "denied");
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("Rate limit exceeded"));
}

#[tokio::test]
async fn malformed_payload_hash_is_rejected() {
    let app = spawn_test_app(None).await;
    let router = build_router(app.state.clone());

    let mut body = validate_body(app.owner_id, "req-1");
    body["payload_hash"] = json!("not-hex");
    let response = router
        .oneshot(post_json("/internal/usage/validate", body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn unknown_feature_namespace_is_rejected() {
    let app = spawn_test_app(None).await;
    let router = build_router(app.state.clone());

    let mut body = validate_body(app.owner_id, "req-1");
    body["feature_key"] = json!("billing.extract");
    let response = router
        .oneshot(post_json("/internal/usage/validate", body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn commit_settles_the_reservation() {
    let app = spawn_test_app(None).await;
    let router = build_router(app.state.clone());

    let validated = router
        .clone()
        .oneshot(post_json(
            "/internal/usage/validate",
            validate_body(app.owner_id, "req-1"),
        ))
        .await
        .unwrap();
    let validated = json_body(validated).await;
    let usage_id = validated["usage_id"].as_str().unwrap().to_string();

    let response = router
        .oneshot(post_json(
            "/internal/usage/commit",
            json!({
                "usage_id": usage_id,
                "owner_id": app.owner_id,
                "success": true,
                "metrics": { "model_used": "small", "latency_ms": 900 },
                "result_data": { "discarded": true },
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["replayed"], false);
    assert!(body["committed_at"].is_string());
}

#[tokio::test]
async fn failed_commit_without_failure_details_is_rejected() {
    let app = spawn_test_app(None).await;
    let router = build_router(app.state.clone());

    let validated = router
        .clone()
        .oneshot(post_json(
            "/internal/usage/validate",
            validate_body(app.owner_id, "req-1"),
        ))
        .await
        .unwrap();
    let validated = json_body(validated).await;

    let response = router
        .oneshot(post_json(
            "/internal/usage/commit",
            json!({
                "usage_id": validated["usage_id"],
                "owner_id": app.owner_id,
                "success": false,
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn commit_of_unknown_reservation_is_404() {
    let app = spawn_test_app(None).await;
    let router = build_router(app.state.clone());

    let response = router
        .oneshot(post_json(
            "/internal/usage/commit",
            json!({
                "usage_id": Uuid::new_v4(),
                "owner_id": app.owner_id,
                "success": true,
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn feature_cost_update_changes_subsequent_pricing() {
    let app = spawn_test_app(None).await;
    let router = build_router(app.state.clone());

    let response = router
        .clone()
        .oneshot(put_json(
            "/admin/feature-costs",
            json!({ "feature_key": "api.extract", "internal_cost_credits": "10.00" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let validated = router
        .oneshot(post_json(
            "/internal/usage/validate",
            validate_body(app.owner_id, "req-1"),
        ))
        .await
        .unwrap();
    let body = json_body(validated).await;
    // 10.00 * 2.00 multiplier
    let reserved = Decimal::from_str(body["credits_reserved"].as_str().unwrap()).unwrap();
    assert_eq!(reserved, Decimal::new(20_00, 2));
}

#[tokio::test]
async fn deleting_a_feature_cost_falls_back_to_default_pricing() {
    let app = spawn_test_app(None).await;
    let router = build_router(app.state.clone());

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/admin/feature-costs/api.extract")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let validated = router
        .oneshot(post_json(
            "/internal/usage/validate",
            validate_body(app.owner_id, "req-1"),
        ))
        .await
        .unwrap();
    let body = json_body(validated).await;
    // Default 6.00 cost * 2.00 plan multiplier
    let reserved = Decimal::from_str(body["credits_reserved"].as_str().unwrap()).unwrap();
    assert_eq!(reserved, Decimal::new(12_00, 2));
}

#[tokio::test]
async fn pricing_rule_with_zero_limit_is_rejected() {
    let app = spawn_test_app(None).await;
    let router = build_router(app.state.clone());

    let response = router
        .oneshot(put_json(
            "/admin/pricing-rules",
            json!({
                "plan_id": app.plan_id,
                "multiplier": "2.00",
                "credits_allocation": "100.00",
                "rate_limit_per_minute": 0,
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn pricing_rule_delete_reverts_to_defaults() {
    let app = spawn_test_app(None).await;
    let router = build_router(app.state.clone());

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/admin/pricing-rules/{}", app.plan_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let validated = router
        .oneshot(post_json(
            "/internal/usage/validate",
            validate_body(app.owner_id, "req-1"),
        ))
        .await
        .unwrap();
    let body = json_body(validated).await;
    // 6.00 cost * 3.00 default multiplier
    let reserved = Decimal::from_str(body["credits_reserved"].as_str().unwrap()).unwrap();
    assert_eq!(reserved, Decimal::new(18_00, 2));
}

#[tokio::test]
async fn cache_refresh_rehydrates() {
    let app = spawn_test_app(None).await;
    let router = build_router(app.state.clone());

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/cache/refresh")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["state"], "initialized");
}

#[tokio::test]
async fn health_and_readiness_respond() {
    let app = spawn_test_app(None).await;
    let router = build_router(app.state.clone());

    let health = router
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);

    let ready = router
        .clone()
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(ready.status(), StatusCode::OK);

    let metrics = router
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(metrics.status(), StatusCode::OK);
}

#[tokio::test]
async fn request_id_is_echoed_or_assigned() {
    let app = spawn_test_app(None).await;
    let router = build_router(app.state.clone());

    let with_id = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-request-id", "caller-supplied-id")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        with_id.headers().get("x-request-id").unwrap(),
        "caller-supplied-id"
    );

    let without_id = router
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let assigned = without_id.headers().get("x-request-id").unwrap();
    assert!(Uuid::from_str(assigned.to_str().unwrap()).is_ok());
}
