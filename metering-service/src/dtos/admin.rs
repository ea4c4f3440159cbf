use crate::models::{FeatureCostConfig, PlanPricingRule};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

#[derive(Debug, Deserialize, Validate)]
pub struct FeatureCostRequest {
    #[validate(length(min = 1, message = "feature_key cannot be empty"))]
    pub feature_key: String,
    #[validate(custom(function = validate_positive))]
    pub internal_cost_credits: Decimal,
}

#[derive(Debug, Deserialize, Validate)]
#[validate(schema(function = validate_rate_limits, skip_on_field_errors = false))]
pub struct PricingRuleRequest {
    pub plan_id: Uuid,
    #[validate(custom(function = validate_positive))]
    pub multiplier: Decimal,
    #[validate(custom(function = validate_positive))]
    pub credits_allocation: Decimal,
    /// None means unlimited.
    pub rate_limit_per_minute: Option<i32>,
    pub rate_limit_per_day: Option<i32>,
}

fn validate_positive(value: &Decimal) -> Result<(), ValidationError> {
    if *value > Decimal::ZERO {
        Ok(())
    } else {
        Err(ValidationError::new("positive").with_message("value must be positive".into()))
    }
}

fn validate_rate_limits(request: &PricingRuleRequest) -> Result<(), ValidationError> {
    for limit in [request.rate_limit_per_minute, request.rate_limit_per_day] {
        if matches!(limit, Some(v) if v <= 0) {
            return Err(ValidationError::new("rate_limit")
                .with_message("rate limits must be positive; omit for unlimited".into()));
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct FeatureCostResponse {
    pub id: Uuid,
    pub feature_key: String,
    pub product_type: String,
    pub internal_cost_credits: Decimal,
    pub is_deleted: bool,
    pub updated_utc: String,
}

impl From<FeatureCostConfig> for FeatureCostResponse {
    fn from(row: FeatureCostConfig) -> Self {
        Self {
            id: row.id,
            feature_key: row.feature_key.as_str().to_string(),
            product_type: row.product_type,
            internal_cost_credits: row.internal_cost_credits,
            is_deleted: row.is_deleted,
            updated_utc: row.updated_utc.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PricingRuleResponse {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub multiplier: Decimal,
    pub credits_allocation: Decimal,
    pub rate_limit_per_minute: Option<i32>,
    pub rate_limit_per_day: Option<i32>,
    pub is_deleted: bool,
    pub updated_utc: String,
}

impl From<PlanPricingRule> for PricingRuleResponse {
    fn from(row: PlanPricingRule) -> Self {
        Self {
            id: row.id,
            plan_id: row.plan_id,
            multiplier: row.multiplier,
            credits_allocation: row.credits_allocation,
            rate_limit_per_minute: row.rate_limit_per_minute,
            rate_limit_per_day: row.rate_limit_per_day,
            is_deleted: row.is_deleted,
            updated_utc: row.updated_utc.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CacheRefreshResponse {
    pub state: String,
}
