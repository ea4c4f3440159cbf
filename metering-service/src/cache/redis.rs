//! Redis quota cache backend.

use crate::cache::QuotaCacheBackend;
use crate::models::FeatureKey;
use crate::services::RedisHandle;
use async_trait::async_trait;
use metering_core::error::AppError;
use rust_decimal::Decimal;
use std::str::FromStr;
use uuid::Uuid;

const FEATURE_COST_PREFIX: &str = "quota:feature_cost:";
const PLAN_MULTIPLIER_PREFIX: &str = "quota:plan_multiplier:";
const PLAN_CREDITS_PREFIX: &str = "quota:plan_credits:";
const PLAN_RATE_LIMIT_PREFIX: &str = "quota:plan_rate_limit:";
const PLAN_RATE_DAY_LIMIT_PREFIX: &str = "quota:plan_rate_day_limit:";

/// Shared cache backend for multi-instance deployments. Entries have no
/// TTL; they live until the next change notification or clear.
#[derive(Clone)]
pub struct RedisQuotaCache {
    redis: RedisHandle,
}

impl RedisQuotaCache {
    pub fn new(redis: RedisHandle) -> Self {
        Self { redis }
    }

    async fn get_decimal(&self, key: &str) -> Result<Option<Decimal>, AppError> {
        match self.redis.get(key).await? {
            Some(raw) => {
                let value = Decimal::from_str(&raw).map_err(|e| {
                    AppError::InternalError(anyhow::anyhow!(
                        "Corrupt decimal in cache key '{}': {}",
                        key,
                        e
                    ))
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn get_int(&self, key: &str) -> Result<Option<i64>, AppError> {
        match self.redis.get(key).await? {
            Some(raw) => {
                let value = raw.parse::<i64>().map_err(|e| {
                    AppError::InternalError(anyhow::anyhow!(
                        "Corrupt integer in cache key '{}': {}",
                        key,
                        e
                    ))
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl QuotaCacheBackend for RedisQuotaCache {
    async fn get_feature_cost(
        &self,
        feature_key: &FeatureKey,
    ) -> Result<Option<Decimal>, AppError> {
        self.get_decimal(&format!("{}{}", FEATURE_COST_PREFIX, feature_key))
            .await
    }

    async fn set_feature_cost(
        &self,
        feature_key: &FeatureKey,
        cost: Decimal,
    ) -> Result<(), AppError> {
        self.redis
            .set(
                &format!("{}{}", FEATURE_COST_PREFIX, feature_key),
                &cost.to_string(),
            )
            .await
    }

    async fn delete_feature_cost(&self, feature_key: &FeatureKey) -> Result<(), AppError> {
        self.redis
            .del(&format!("{}{}", FEATURE_COST_PREFIX, feature_key))
            .await
    }

    async fn get_plan_multiplier(&self, plan_id: Uuid) -> Result<Option<Decimal>, AppError> {
        self.get_decimal(&format!("{}{}", PLAN_MULTIPLIER_PREFIX, plan_id))
            .await
    }

    async fn set_plan_multiplier(
        &self,
        plan_id: Uuid,
        multiplier: Decimal,
    ) -> Result<(), AppError> {
        self.redis
            .set(
                &format!("{}{}", PLAN_MULTIPLIER_PREFIX, plan_id),
                &multiplier.to_string(),
            )
            .await
    }

    async fn delete_plan_multiplier(&self, plan_id: Uuid) -> Result<(), AppError> {
        self.redis
            .del(&format!("{}{}", PLAN_MULTIPLIER_PREFIX, plan_id))
            .await
    }

    async fn get_plan_credits_allocation(
        &self,
        plan_id: Uuid,
    ) -> Result<Option<Decimal>, AppError> {
        self.get_decimal(&format!("{}{}", PLAN_CREDITS_PREFIX, plan_id))
            .await
    }

    async fn set_plan_credits_allocation(
        &self,
        plan_id: Uuid,
        credits: Decimal,
    ) -> Result<(), AppError> {
        self.redis
            .set(
                &format!("{}{}", PLAN_CREDITS_PREFIX, plan_id),
                &credits.to_string(),
            )
            .await
    }

    async fn delete_plan_credits_allocation(&self, plan_id: Uuid) -> Result<(), AppError> {
        self.redis
            .del(&format!("{}{}", PLAN_CREDITS_PREFIX, plan_id))
            .await
    }

    async fn get_plan_rate_limit(&self, plan_id: Uuid) -> Result<Option<i64>, AppError> {
        self.get_int(&format!("{}{}", PLAN_RATE_LIMIT_PREFIX, plan_id))
            .await
    }

    async fn set_plan_rate_limit(&self, plan_id: Uuid, limit: i64) -> Result<(), AppError> {
        self.redis
            .set(
                &format!("{}{}", PLAN_RATE_LIMIT_PREFIX, plan_id),
                &limit.to_string(),
            )
            .await
    }

    async fn delete_plan_rate_limit(&self, plan_id: Uuid) -> Result<(), AppError> {
        self.redis
            .del(&format!("{}{}", PLAN_RATE_LIMIT_PREFIX, plan_id))
            .await
    }

    async fn get_plan_rate_day_limit(&self, plan_id: Uuid) -> Result<Option<i64>, AppError> {
        self.get_int(&format!("{}{}", PLAN_RATE_DAY_LIMIT_PREFIX, plan_id))
            .await
    }

    async fn set_plan_rate_day_limit(&self, plan_id: Uuid, limit: i64) -> Result<(), AppError> {
        self.redis
            .set(
                &format!("{}{}", PLAN_RATE_DAY_LIMIT_PREFIX, plan_id),
                &limit.to_string(),
            )
            .await
    }

    async fn delete_plan_rate_day_limit(&self, plan_id: Uuid) -> Result<(), AppError> {
        self.redis
            .del(&format!("{}{}", PLAN_RATE_DAY_LIMIT_PREFIX, plan_id))
            .await
    }

    async fn clear(&self) -> Result<(), AppError> {
        for prefix in [
            FEATURE_COST_PREFIX,
            PLAN_MULTIPLIER_PREFIX,
            PLAN_CREDITS_PREFIX,
            PLAN_RATE_LIMIT_PREFIX,
            PLAN_RATE_DAY_LIMIT_PREFIX,
        ] {
            self.redis.delete_pattern(&format!("{}*", prefix)).await?;
        }
        Ok(())
    }
}
