use crate::services::get_metrics;
use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "service": "metering-service",
                "version": env!("CARGO_PKG_VERSION")
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "service": "metering-service",
                "error": e.to_string()
            })),
        ),
    }
}

/// Ready only once the store answers and the quota cache is hydrated.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.store.health_check().await.is_err() || !state.cache.is_initialized() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}

pub async fn metrics_endpoint() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}
