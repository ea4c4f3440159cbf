use crate::dtos::{
    UsageCommitRequest, UsageCommitResponse, UsageValidateRequest, UsageValidateResponse,
};
use crate::models::{AccessStatus, FeatureKey};
use crate::services::ValidateUsage;
use crate::startup::AppState;
use axum::http::header::RETRY_AFTER;
use axum::response::{IntoResponse, Response};
use axum::{extract::State, http::StatusCode, Json};
use metering_core::error::AppError;
use validator::Validate;

/// Admission check for one metered request. Grants come back as 200;
/// denials (rate limit or quota) come back as 429 with a Retry-After
/// header when the denial is time-bound.
#[tracing::instrument(skip(state, request), fields(owner_id = %request.owner_id, request_id = %request.request_id))]
pub async fn validate_usage(
    State(state): State<AppState>,
    Json(request): Json<UsageValidateRequest>,
) -> Result<Response, AppError> {
    request.validate()?;

    let feature_key = request
        .feature_key
        .parse::<FeatureKey>()
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e)))?;

    let outcome = state
        .enforcer
        .validate_and_reserve(ValidateUsage {
            owner_id: request.owner_id,
            request_id: request.request_id,
            feature_key,
            endpoint: request.endpoint,
            method: request.method,
            payload_hash: request.payload_hash,
            usage_estimate: request.usage_estimate,
            client_ip: request.client_ip,
            client_user_agent: request.client_user_agent,
        })
        .await?;

    let response = UsageValidateResponse::from(outcome);

    if response.access == AccessStatus::Denied {
        let retry_after = response.retry_after;
        let mut res = (StatusCode::TOO_MANY_REQUESTS, Json(response)).into_response();
        if let Some(retry) = retry_after {
            res.headers_mut().insert(RETRY_AFTER, retry.into());
        }
        return Ok(res);
    }

    Ok((StatusCode::OK, Json(response)).into_response())
}

/// Settle a reservation. Terminal rows are returned unchanged so retried
/// commits are safe. `result_data` is accepted but never persisted.
#[tracing::instrument(skip(state, request), fields(usage_id = %request.usage_id, owner_id = %request.owner_id))]
pub async fn commit_usage(
    State(state): State<AppState>,
    Json(request): Json<UsageCommitRequest>,
) -> Result<(StatusCode, Json<UsageCommitResponse>), AppError> {
    request.validate()?;

    let outcome = state
        .enforcer
        .commit(
            request.usage_id,
            request.owner_id,
            request.success,
            request.metrics.as_ref(),
            request.failure.as_ref(),
        )
        .await?;

    match UsageCommitResponse::from_outcome(&outcome) {
        Some(response) => Ok((StatusCode::OK, Json(response))),
        None => Err(AppError::NotFound(anyhow::anyhow!(
            "No usage log with id {}",
            request.usage_id
        ))),
    }
}
