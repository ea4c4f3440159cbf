//! Quota parameter cache: five derived maps over the pricing tables.

mod memory;
mod redis;
mod service;

pub use memory::MemoryQuotaCache;
pub use redis::RedisQuotaCache;
pub use service::{CacheState, QuotaCache};

use crate::models::FeatureKey;
use async_trait::async_trait;
use metering_core::error::AppError;
use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Fallback cost when a feature has no configured row.
pub static DEFAULT_FEATURE_COST: Lazy<Decimal> = Lazy::new(|| Decimal::new(600, 2));
/// Fallback billing multiplier for unknown plans.
pub static DEFAULT_PLAN_MULTIPLIER: Lazy<Decimal> = Lazy::new(|| Decimal::new(300, 2));
/// Fallback per-period credit allocation for unknown plans.
pub static DEFAULT_PLAN_CREDITS: Lazy<Decimal> = Lazy::new(|| Decimal::new(500_000, 2));
/// Fallback request limits for unknown plans.
pub const DEFAULT_RATE_LIMIT_PER_MINUTE: i64 = 20;
pub const DEFAULT_RATE_LIMIT_PER_DAY: i64 = 20;

/// Sentinel stored in backends for "limit intentionally unlimited".
/// Backends only store integers; a missing key means "not cached".
pub const UNLIMITED: i64 = -1;

/// Key-value store for the five parameter maps.
///
/// Backends are dumb: defaults, the unlimited sentinel and fallback
/// behavior live in [`QuotaCache`].
#[async_trait]
pub trait QuotaCacheBackend: Send + Sync {
    async fn get_feature_cost(&self, feature_key: &FeatureKey)
        -> Result<Option<Decimal>, AppError>;
    async fn set_feature_cost(
        &self,
        feature_key: &FeatureKey,
        cost: Decimal,
    ) -> Result<(), AppError>;
    async fn delete_feature_cost(&self, feature_key: &FeatureKey) -> Result<(), AppError>;

    async fn get_plan_multiplier(&self, plan_id: Uuid) -> Result<Option<Decimal>, AppError>;
    async fn set_plan_multiplier(&self, plan_id: Uuid, multiplier: Decimal)
        -> Result<(), AppError>;
    async fn delete_plan_multiplier(&self, plan_id: Uuid) -> Result<(), AppError>;

    async fn get_plan_credits_allocation(
        &self,
        plan_id: Uuid,
    ) -> Result<Option<Decimal>, AppError>;
    async fn set_plan_credits_allocation(
        &self,
        plan_id: Uuid,
        credits: Decimal,
    ) -> Result<(), AppError>;
    async fn delete_plan_credits_allocation(&self, plan_id: Uuid) -> Result<(), AppError>;

    async fn get_plan_rate_limit(&self, plan_id: Uuid) -> Result<Option<i64>, AppError>;
    async fn set_plan_rate_limit(&self, plan_id: Uuid, limit: i64) -> Result<(), AppError>;
    async fn delete_plan_rate_limit(&self, plan_id: Uuid) -> Result<(), AppError>;

    async fn get_plan_rate_day_limit(&self, plan_id: Uuid) -> Result<Option<i64>, AppError>;
    async fn set_plan_rate_day_limit(&self, plan_id: Uuid, limit: i64) -> Result<(), AppError>;
    async fn delete_plan_rate_day_limit(&self, plan_id: Uuid) -> Result<(), AppError>;

    /// Drop all cached entries across the five maps.
    async fn clear(&self) -> Result<(), AppError>;
}
