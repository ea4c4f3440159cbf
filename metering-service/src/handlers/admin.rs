use crate::dtos::{
    CacheRefreshResponse, FeatureCostRequest, FeatureCostResponse, PricingRuleRequest,
    PricingRuleResponse,
};
use crate::models::{FeatureKey, QuotaChange, UpsertFeatureCost, UpsertPricingRule};
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use metering_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

/// Create or update a feature cost. The cache is updated write-through
/// after the row is persisted, so readers never serve the stale price
/// for longer than this request takes.
#[tracing::instrument(skip(state, request), fields(feature_key = %request.feature_key))]
pub async fn upsert_feature_cost(
    State(state): State<AppState>,
    Json(request): Json<FeatureCostRequest>,
) -> Result<(StatusCode, Json<FeatureCostResponse>), AppError> {
    request.validate()?;

    let feature_key = request
        .feature_key
        .parse::<FeatureKey>()
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e)))?;

    let row = state
        .store
        .upsert_feature_cost(&UpsertFeatureCost {
            feature_key,
            internal_cost_credits: request.internal_cost_credits,
        })
        .await?;

    state
        .cache
        .apply_change(&QuotaChange::from_feature_cost(&row))
        .await?;

    Ok((StatusCode::OK, Json(row.into())))
}

#[tracing::instrument(skip(state))]
pub async fn delete_feature_cost(
    State(state): State<AppState>,
    Path(feature_key): Path<String>,
) -> Result<(StatusCode, Json<FeatureCostResponse>), AppError> {
    let feature_key = feature_key
        .parse::<FeatureKey>()
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e)))?;

    let row = state
        .store
        .soft_delete_feature_cost(&feature_key)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("No feature cost for {}", feature_key))
        })?;

    state
        .cache
        .apply_change(&QuotaChange::from_feature_cost(&row))
        .await?;

    Ok((StatusCode::OK, Json(row.into())))
}

#[tracing::instrument(skip(state, request), fields(plan_id = %request.plan_id))]
pub async fn upsert_pricing_rule(
    State(state): State<AppState>,
    Json(request): Json<PricingRuleRequest>,
) -> Result<(StatusCode, Json<PricingRuleResponse>), AppError> {
    request.validate()?;

    let row = state
        .store
        .upsert_pricing_rule(&UpsertPricingRule {
            plan_id: request.plan_id,
            multiplier: request.multiplier,
            credits_allocation: request.credits_allocation,
            rate_limit_per_minute: request.rate_limit_per_minute,
            rate_limit_per_day: request.rate_limit_per_day,
        })
        .await?;

    state
        .cache
        .apply_change(&QuotaChange::from_pricing_rule(&row))
        .await?;

    Ok((StatusCode::OK, Json(row.into())))
}

#[tracing::instrument(skip(state))]
pub async fn delete_pricing_rule(
    State(state): State<AppState>,
    Path(plan_id): Path<Uuid>,
) -> Result<(StatusCode, Json<PricingRuleResponse>), AppError> {
    let row = state
        .store
        .soft_delete_pricing_rule(plan_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("No pricing rule for {}", plan_id)))?;

    state
        .cache
        .apply_change(&QuotaChange::from_pricing_rule(&row))
        .await?;

    Ok((StatusCode::OK, Json(row.into())))
}

/// Drop and rebuild the entire quota cache from the store.
#[tracing::instrument(skip(state))]
pub async fn refresh_cache(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<CacheRefreshResponse>), AppError> {
    state.cache.refresh(state.store.as_ref()).await?;

    Ok((
        StatusCode::OK,
        Json(CacheRefreshResponse {
            state: format!("{:?}", state.cache.state()).to_lowercase(),
        }),
    ))
}
