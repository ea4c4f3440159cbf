//! In-memory quota cache backend.

use crate::cache::QuotaCacheBackend;
use crate::models::FeatureKey;
use async_trait::async_trait;
use dashmap::DashMap;
use metering_core::error::AppError;
use rust_decimal::Decimal;
use uuid::Uuid;

/// DashMap-backed cache for single-instance deployments. Entries are
/// lost on restart.
#[derive(Default)]
pub struct MemoryQuotaCache {
    feature_costs: DashMap<String, Decimal>,
    plan_multipliers: DashMap<Uuid, Decimal>,
    plan_credits: DashMap<Uuid, Decimal>,
    plan_rate_limits: DashMap<Uuid, i64>,
    plan_rate_day_limits: DashMap<Uuid, i64>,
}

impl MemoryQuotaCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaCacheBackend for MemoryQuotaCache {
    async fn get_feature_cost(
        &self,
        feature_key: &FeatureKey,
    ) -> Result<Option<Decimal>, AppError> {
        Ok(self.feature_costs.get(feature_key.as_str()).map(|v| *v))
    }

    async fn set_feature_cost(
        &self,
        feature_key: &FeatureKey,
        cost: Decimal,
    ) -> Result<(), AppError> {
        self.feature_costs
            .insert(feature_key.as_str().to_string(), cost);
        Ok(())
    }

    async fn delete_feature_cost(&self, feature_key: &FeatureKey) -> Result<(), AppError> {
        self.feature_costs.remove(feature_key.as_str());
        Ok(())
    }

    async fn get_plan_multiplier(&self, plan_id: Uuid) -> Result<Option<Decimal>, AppError> {
        Ok(self.plan_multipliers.get(&plan_id).map(|v| *v))
    }

    async fn set_plan_multiplier(
        &self,
        plan_id: Uuid,
        multiplier: Decimal,
    ) -> Result<(), AppError> {
        self.plan_multipliers.insert(plan_id, multiplier);
        Ok(())
    }

    async fn delete_plan_multiplier(&self, plan_id: Uuid) -> Result<(), AppError> {
        self.plan_multipliers.remove(&plan_id);
        Ok(())
    }

    async fn get_plan_credits_allocation(
        &self,
        plan_id: Uuid,
    ) -> Result<Option<Decimal>, AppError> {
        Ok(self.plan_credits.get(&plan_id).map(|v| *v))
    }

    async fn set_plan_credits_allocation(
        &self,
        plan_id: Uuid,
        credits: Decimal,
    ) -> Result<(), AppError> {
        self.plan_credits.insert(plan_id, credits);
        Ok(())
    }

    async fn delete_plan_credits_allocation(&self, plan_id: Uuid) -> Result<(), AppError> {
        self.plan_credits.remove(&plan_id);
        Ok(())
    }

    async fn get_plan_rate_limit(&self, plan_id: Uuid) -> Result<Option<i64>, AppError> {
        Ok(self.plan_rate_limits.get(&plan_id).map(|v| *v))
    }

    async fn set_plan_rate_limit(&self, plan_id: Uuid, limit: i64) -> Result<(), AppError> {
        self.plan_rate_limits.insert(plan_id, limit);
        Ok(())
    }

    async fn delete_plan_rate_limit(&self, plan_id: Uuid) -> Result<(), AppError> {
        self.plan_rate_limits.remove(&plan_id);
        Ok(())
    }

    async fn get_plan_rate_day_limit(&self, plan_id: Uuid) -> Result<Option<i64>, AppError> {
        Ok(self.plan_rate_day_limits.get(&plan_id).map(|v| *v))
    }

    async fn set_plan_rate_day_limit(&self, plan_id: Uuid, limit: i64) -> Result<(), AppError> {
        self.plan_rate_day_limits.insert(plan_id, limit);
        Ok(())
    }

    async fn delete_plan_rate_day_limit(&self, plan_id: Uuid) -> Result<(), AppError> {
        self.plan_rate_day_limits.remove(&plan_id);
        Ok(())
    }

    async fn clear(&self) -> Result<(), AppError> {
        self.feature_costs.clear();
        self.plan_multipliers.clear();
        self.plan_credits.clear();
        self.plan_rate_limits.clear();
        self.plan_rate_day_limits.clear();
        Ok(())
    }
}
