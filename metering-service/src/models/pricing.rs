//! Plan pricing rule model and cache change notifications.

use crate::models::FeatureKey;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Pricing rule row. One row per plan: billing multiplier, credit
/// allocation per billing period, and nullable per-window request
/// limits (null = unlimited).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlanPricingRule {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub multiplier: Decimal,
    pub credits_allocation: Decimal,
    pub rate_limit_per_minute: Option<i32>,
    pub rate_limit_per_day: Option<i32>,
    pub is_deleted: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Input for creating or updating a pricing rule.
#[derive(Debug, Clone)]
pub struct UpsertPricingRule {
    pub plan_id: Uuid,
    pub multiplier: Decimal,
    pub credits_allocation: Decimal,
    pub rate_limit_per_minute: Option<i32>,
    pub rate_limit_per_day: Option<i32>,
}

/// Post-commit change notification applied to the quota cache.
///
/// The write path constructs one of these from the row state after a
/// successful persistence commit and awaits `QuotaCache::apply_change`.
/// Soft-deleted rows carry `is_deleted = true`; hard deletes use the
/// `*Removed` variants.
#[derive(Debug, Clone)]
pub enum QuotaChange {
    FeatureCost {
        feature_key: FeatureKey,
        internal_cost_credits: Decimal,
        is_deleted: bool,
    },
    FeatureCostRemoved {
        feature_key: FeatureKey,
    },
    PricingRule {
        plan_id: Uuid,
        multiplier: Decimal,
        credits_allocation: Decimal,
        rate_limit_per_minute: Option<i32>,
        rate_limit_per_day: Option<i32>,
        is_deleted: bool,
    },
    PricingRuleRemoved {
        plan_id: Uuid,
    },
}

impl QuotaChange {
    pub fn from_feature_cost(row: &crate::models::FeatureCostConfig) -> Self {
        QuotaChange::FeatureCost {
            feature_key: row.feature_key.clone(),
            internal_cost_credits: row.internal_cost_credits,
            is_deleted: row.is_deleted,
        }
    }

    pub fn from_pricing_rule(row: &PlanPricingRule) -> Self {
        QuotaChange::PricingRule {
            plan_id: row.plan_id,
            multiplier: row.multiplier,
            credits_allocation: row.credits_allocation,
            rate_limit_per_minute: row.rate_limit_per_minute,
            rate_limit_per_day: row.rate_limit_per_day,
            is_deleted: row.is_deleted,
        }
    }
}
