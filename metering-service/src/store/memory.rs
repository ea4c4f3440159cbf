//! In-memory store for tests and single-instance runs.

use crate::models::{
    AccessStatus, BillingContext, CreateUsageLog, FailureDetails, FeatureCostConfig, FeatureKey,
    PlanPricingRule, UpsertFeatureCost, UpsertPricingRule, UsageLog, UsageLogStatus, UsageMetrics,
};
use crate::store::QuotaStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metering_core::error::AppError;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// HashMap-backed `QuotaStore`. State is lost on restart; not suitable
/// for multi-instance deployments.
#[derive(Default)]
pub struct MemoryStore {
    feature_costs: Mutex<HashMap<String, FeatureCostConfig>>,
    pricing_rules: Mutex<HashMap<Uuid, PlanPricingRule>>,
    usage_logs: Mutex<HashMap<Uuid, UsageLog>>,
    contexts: Mutex<HashMap<Uuid, BillingContext>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a billing context row (test setup).
    pub fn put_billing_context(&self, context: BillingContext) -> Result<(), AppError> {
        self.contexts
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Store mutex poisoned: {}", e)))?
            .insert(context.owner_id, context);
        Ok(())
    }
}

fn lock_err(e: impl std::fmt::Display) -> AppError {
    AppError::InternalError(anyhow::anyhow!("Store mutex poisoned: {}", e))
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn load_feature_costs(&self) -> Result<Vec<FeatureCostConfig>, AppError> {
        let rows = self.feature_costs.lock().map_err(lock_err)?;
        Ok(rows.values().filter(|r| !r.is_deleted).cloned().collect())
    }

    async fn load_pricing_rules(&self) -> Result<Vec<PlanPricingRule>, AppError> {
        let rows = self.pricing_rules.lock().map_err(lock_err)?;
        Ok(rows.values().filter(|r| !r.is_deleted).cloned().collect())
    }

    async fn get_feature_cost(
        &self,
        feature_key: &FeatureKey,
    ) -> Result<Option<FeatureCostConfig>, AppError> {
        let rows = self.feature_costs.lock().map_err(lock_err)?;
        Ok(rows
            .get(feature_key.as_str())
            .filter(|r| !r.is_deleted)
            .cloned())
    }

    async fn get_pricing_rule(&self, plan_id: Uuid) -> Result<Option<PlanPricingRule>, AppError> {
        let rows = self.pricing_rules.lock().map_err(lock_err)?;
        Ok(rows.get(&plan_id).filter(|r| !r.is_deleted).cloned())
    }

    async fn upsert_feature_cost(
        &self,
        input: &UpsertFeatureCost,
    ) -> Result<FeatureCostConfig, AppError> {
        let now = Utc::now();
        let mut rows = self.feature_costs.lock().map_err(lock_err)?;
        let row = rows
            .entry(input.feature_key.as_str().to_string())
            .and_modify(|r| {
                r.internal_cost_credits = input.internal_cost_credits;
                r.is_deleted = false;
                r.updated_utc = now;
            })
            .or_insert_with(|| FeatureCostConfig {
                id: Uuid::new_v4(),
                feature_key: input.feature_key.clone(),
                product_type: input.feature_key.product_type().as_str().to_string(),
                internal_cost_credits: input.internal_cost_credits,
                is_deleted: false,
                created_utc: now,
                updated_utc: now,
            });
        Ok(row.clone())
    }

    async fn soft_delete_feature_cost(
        &self,
        feature_key: &FeatureKey,
    ) -> Result<Option<FeatureCostConfig>, AppError> {
        let mut rows = self.feature_costs.lock().map_err(lock_err)?;
        Ok(rows.get_mut(feature_key.as_str()).map(|r| {
            r.is_deleted = true;
            r.updated_utc = Utc::now();
            r.clone()
        }))
    }

    async fn upsert_pricing_rule(
        &self,
        input: &UpsertPricingRule,
    ) -> Result<PlanPricingRule, AppError> {
        let now = Utc::now();
        let mut rows = self.pricing_rules.lock().map_err(lock_err)?;
        let row = rows
            .entry(input.plan_id)
            .and_modify(|r| {
                r.multiplier = input.multiplier;
                r.credits_allocation = input.credits_allocation;
                r.rate_limit_per_minute = input.rate_limit_per_minute;
                r.rate_limit_per_day = input.rate_limit_per_day;
                r.is_deleted = false;
                r.updated_utc = now;
            })
            .or_insert_with(|| PlanPricingRule {
                id: Uuid::new_v4(),
                plan_id: input.plan_id,
                multiplier: input.multiplier,
                credits_allocation: input.credits_allocation,
                rate_limit_per_minute: input.rate_limit_per_minute,
                rate_limit_per_day: input.rate_limit_per_day,
                is_deleted: false,
                created_utc: now,
                updated_utc: now,
            });
        Ok(row.clone())
    }

    async fn soft_delete_pricing_rule(
        &self,
        plan_id: Uuid,
    ) -> Result<Option<PlanPricingRule>, AppError> {
        let mut rows = self.pricing_rules.lock().map_err(lock_err)?;
        Ok(rows.get_mut(&plan_id).map(|r| {
            r.is_deleted = true;
            r.updated_utc = Utc::now();
            r.clone()
        }))
    }

    async fn create_usage_log(&self, input: &CreateUsageLog) -> Result<UsageLog, AppError> {
        let now = Utc::now();
        let row = UsageLog {
            id: Uuid::new_v4(),
            owner_id: input.owner_id,
            request_id: input.request_id.clone(),
            fingerprint_hash: input.fingerprint_hash.clone(),
            feature_key: input.feature_key.clone(),
            endpoint: input.endpoint.clone(),
            method: input.method.clone(),
            access_status: input.access_status.as_str().to_string(),
            status: UsageLogStatus::Pending.as_str().to_string(),
            credits_reserved: input.credits_reserved,
            credits_charged: None,
            model_used: None,
            input_tokens: None,
            output_tokens: None,
            latency_ms: None,
            failure_type: None,
            failure_reason: None,
            client_ip: input.client_ip.clone(),
            client_user_agent: input.client_user_agent.clone(),
            usage_estimate: input.usage_estimate.clone(),
            committed_at: None,
            is_deleted: false,
            created_utc: now,
            updated_utc: now,
        };
        self.usage_logs
            .lock()
            .map_err(lock_err)?
            .insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_usage_log(&self, id: Uuid) -> Result<Option<UsageLog>, AppError> {
        let rows = self.usage_logs.lock().map_err(lock_err)?;
        Ok(rows.get(&id).filter(|r| !r.is_deleted).cloned())
    }

    async fn find_usage_log(
        &self,
        owner_id: Uuid,
        request_id: &str,
        fingerprint_hash: &str,
    ) -> Result<Option<UsageLog>, AppError> {
        let rows = self.usage_logs.lock().map_err(lock_err)?;
        Ok(rows
            .values()
            .filter(|r| {
                !r.is_deleted
                    && r.owner_id == owner_id
                    && r.request_id == request_id
                    && r.fingerprint_hash == fingerprint_hash
            })
            .max_by_key(|r| r.created_utc)
            .cloned())
    }

    async fn commit_usage_log(
        &self,
        id: Uuid,
        success: bool,
        metrics: Option<&UsageMetrics>,
        failure: Option<&FailureDetails>,
    ) -> Result<Option<UsageLog>, AppError> {
        let mut rows = self.usage_logs.lock().map_err(lock_err)?;
        let Some(row) = rows.get_mut(&id).filter(|r| !r.is_deleted) else {
            return Ok(None);
        };

        if row.status().is_terminal() {
            return Ok(Some(row.clone()));
        }

        let now = Utc::now();
        if success {
            row.status = UsageLogStatus::Success.as_str().to_string();
            row.credits_charged = Some(row.credits_reserved);
            if let Some(m) = metrics {
                if let Some(model) = &m.model_used {
                    row.model_used = Some(model.clone());
                }
                if let Some(v) = m.input_tokens {
                    row.input_tokens = Some(v);
                }
                if let Some(v) = m.output_tokens {
                    row.output_tokens = Some(v);
                }
                if let Some(v) = m.latency_ms {
                    row.latency_ms = Some(v);
                }
            }
        } else {
            let failure = failure.ok_or_else(|| {
                AppError::BadRequest(anyhow::anyhow!(
                    "Failure details are required when committing with success=false"
                ))
            })?;
            row.status = UsageLogStatus::Failed.as_str().to_string();
            row.failure_type = Some(failure.failure_type.as_str().to_string());
            row.failure_reason = Some(failure.reason.clone());
        }
        row.committed_at = Some(now);
        row.updated_utc = now;
        Ok(Some(row.clone()))
    }

    async fn expire_pending(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        let mut rows = self.usage_logs.lock().map_err(lock_err)?;
        let now = Utc::now();
        let mut expired = 0u64;
        for row in rows.values_mut() {
            if !row.is_deleted
                && row.status() == UsageLogStatus::Pending
                && row.created_utc < older_than
            {
                row.status = UsageLogStatus::Expired.as_str().to_string();
                row.committed_at = Some(now);
                row.updated_utc = now;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn sum_success_credits(
        &self,
        owner_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Decimal, AppError> {
        let rows = self.usage_logs.lock().map_err(lock_err)?;
        Ok(rows
            .values()
            .filter(|r| {
                !r.is_deleted
                    && r.owner_id == owner_id
                    && r.status() == UsageLogStatus::Success
                    && r.access_status() == AccessStatus::Granted
                    && r.created_utc >= period_start
                    && r.created_utc < period_end
            })
            .map(|r| r.credits_reserved)
            .sum())
    }

    async fn get_billing_context(
        &self,
        owner_id: Uuid,
    ) -> Result<Option<BillingContext>, AppError> {
        let rows = self.contexts.lock().map_err(lock_err)?;
        Ok(rows.get(&owner_id).cloned())
    }

    async fn add_credits_used(&self, owner_id: Uuid, amount: Decimal) -> Result<(), AppError> {
        let mut rows = self.contexts.lock().map_err(lock_err)?;
        if let Some(context) = rows.get_mut(&owner_id) {
            context.credits_used += amount;
            context.updated_utc = Utc::now();
        }
        Ok(())
    }
}
