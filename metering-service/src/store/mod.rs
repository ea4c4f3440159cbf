//! Persistent store contract consumed by the metering engine.

mod memory;

pub use memory::MemoryStore;

use crate::models::{
    BillingContext, CreateUsageLog, FailureDetails, FeatureCostConfig, FeatureKey,
    PlanPricingRule, UpsertFeatureCost, UpsertPricingRule, UsageLog, UsageMetrics,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metering_core::error::AppError;
use rust_decimal::Decimal;
use uuid::Uuid;

/// CRUD contract over the relational store.
///
/// `Database` implements this against Postgres; `MemoryStore` implements
/// it in-process for tests and single-instance runs.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Cheap liveness probe of the backing store.
    async fn health_check(&self) -> Result<(), AppError>;

    // Pricing configuration
    async fn load_feature_costs(&self) -> Result<Vec<FeatureCostConfig>, AppError>;
    async fn load_pricing_rules(&self) -> Result<Vec<PlanPricingRule>, AppError>;
    async fn get_feature_cost(
        &self,
        feature_key: &FeatureKey,
    ) -> Result<Option<FeatureCostConfig>, AppError>;
    async fn get_pricing_rule(&self, plan_id: Uuid) -> Result<Option<PlanPricingRule>, AppError>;
    async fn upsert_feature_cost(
        &self,
        input: &UpsertFeatureCost,
    ) -> Result<FeatureCostConfig, AppError>;
    async fn soft_delete_feature_cost(
        &self,
        feature_key: &FeatureKey,
    ) -> Result<Option<FeatureCostConfig>, AppError>;
    async fn upsert_pricing_rule(
        &self,
        input: &UpsertPricingRule,
    ) -> Result<PlanPricingRule, AppError>;
    async fn soft_delete_pricing_rule(
        &self,
        plan_id: Uuid,
    ) -> Result<Option<PlanPricingRule>, AppError>;

    // Usage ledger
    async fn create_usage_log(&self, input: &CreateUsageLog) -> Result<UsageLog, AppError>;
    async fn get_usage_log(&self, id: Uuid) -> Result<Option<UsageLog>, AppError>;
    /// Idempotency lookup: the newest row matching (owner, request_id,
    /// fingerprint).
    async fn find_usage_log(
        &self,
        owner_id: Uuid,
        request_id: &str,
        fingerprint_hash: &str,
    ) -> Result<Option<UsageLog>, AppError>;
    /// Settle a PENDING row. Returns None when the row does not exist or
    /// is soft-deleted; returns terminal rows unchanged.
    async fn commit_usage_log(
        &self,
        id: Uuid,
        success: bool,
        metrics: Option<&UsageMetrics>,
        failure: Option<&FailureDetails>,
    ) -> Result<Option<UsageLog>, AppError>;
    /// Bulk-expire PENDING rows created before `older_than`. Returns the
    /// number of rows transitioned.
    async fn expire_pending(&self, older_than: DateTime<Utc>) -> Result<u64, AppError>;
    /// Sum of `credits_reserved` over SUCCESS rows in [start, end).
    async fn sum_success_credits(
        &self,
        owner_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Decimal, AppError>;

    // Billing context
    async fn get_billing_context(
        &self,
        owner_id: Uuid,
    ) -> Result<Option<BillingContext>, AppError>;
    /// Atomic in-place increment of the owner's credits-used counter.
    async fn add_credits_used(&self, owner_id: Uuid, amount: Decimal) -> Result<(), AppError>;
}
