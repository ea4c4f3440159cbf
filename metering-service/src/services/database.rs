//! Database service for metering-service.

use crate::models::{
    BillingContext, CreateUsageLog, FailureDetails, FeatureCostConfig, FeatureKey,
    PlanPricingRule, UpsertFeatureCost, UpsertPricingRule, UsageLog, UsageLogStatus, UsageMetrics,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::store::QuotaStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metering_core::error::AppError;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const USAGE_LOG_COLUMNS: &str = "id, owner_id, request_id, fingerprint_hash, feature_key, \
     endpoint, method, access_status, status, credits_reserved, credits_charged, model_used, \
     input_tokens, output_tokens, latency_ms, failure_type, failure_reason, client_ip, \
     client_user_agent, usage_estimate, committed_at, is_deleted, created_utc, updated_utc";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "metering-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl QuotaStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_feature_costs(&self) -> Result<Vec<FeatureCostConfig>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["load_feature_costs"])
            .start_timer();

        let rows = sqlx::query_as::<_, FeatureCostConfig>(
            r#"
            SELECT id, feature_key, product_type, internal_cost_credits, is_deleted, created_utc, updated_utc
            FROM feature_cost_configs
            WHERE is_deleted = FALSE
            ORDER BY feature_key
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load feature costs: {}", e)))?;

        timer.observe_duration();
        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn load_pricing_rules(&self) -> Result<Vec<PlanPricingRule>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["load_pricing_rules"])
            .start_timer();

        let rows = sqlx::query_as::<_, PlanPricingRule>(
            r#"
            SELECT id, plan_id, multiplier, credits_allocation, rate_limit_per_minute, rate_limit_per_day, is_deleted, created_utc, updated_utc
            FROM plan_pricing_rules
            WHERE is_deleted = FALSE
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load pricing rules: {}", e)))?;

        timer.observe_duration();
        Ok(rows)
    }

    #[instrument(skip(self), fields(feature_key = %feature_key))]
    async fn get_feature_cost(
        &self,
        feature_key: &FeatureKey,
    ) -> Result<Option<FeatureCostConfig>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_feature_cost"])
            .start_timer();

        let row = sqlx::query_as::<_, FeatureCostConfig>(
            r#"
            SELECT id, feature_key, product_type, internal_cost_credits, is_deleted, created_utc, updated_utc
            FROM feature_cost_configs
            WHERE feature_key = $1 AND is_deleted = FALSE
            "#,
        )
        .bind(feature_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get feature cost: {}", e)))?;

        timer.observe_duration();
        Ok(row)
    }

    #[instrument(skip(self), fields(plan_id = %plan_id))]
    async fn get_pricing_rule(&self, plan_id: Uuid) -> Result<Option<PlanPricingRule>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_pricing_rule"])
            .start_timer();

        let row = sqlx::query_as::<_, PlanPricingRule>(
            r#"
            SELECT id, plan_id, multiplier, credits_allocation, rate_limit_per_minute, rate_limit_per_day, is_deleted, created_utc, updated_utc
            FROM plan_pricing_rules
            WHERE plan_id = $1 AND is_deleted = FALSE
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get pricing rule: {}", e)))?;

        timer.observe_duration();
        Ok(row)
    }

    #[instrument(skip(self, input), fields(feature_key = %input.feature_key))]
    async fn upsert_feature_cost(
        &self,
        input: &UpsertFeatureCost,
    ) -> Result<FeatureCostConfig, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_feature_cost"])
            .start_timer();

        let row = sqlx::query_as::<_, FeatureCostConfig>(
            r#"
            INSERT INTO feature_cost_configs (id, feature_key, product_type, internal_cost_credits)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (feature_key) DO UPDATE
            SET internal_cost_credits = EXCLUDED.internal_cost_credits,
                is_deleted = FALSE,
                updated_utc = NOW()
            RETURNING id, feature_key, product_type, internal_cost_credits, is_deleted, created_utc, updated_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&input.feature_key)
        .bind(input.feature_key.product_type().as_str())
        .bind(input.internal_cost_credits)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to upsert feature cost: {}", e)))?;

        timer.observe_duration();
        info!(feature_key = %row.feature_key, "Feature cost upserted");
        Ok(row)
    }

    #[instrument(skip(self), fields(feature_key = %feature_key))]
    async fn soft_delete_feature_cost(
        &self,
        feature_key: &FeatureKey,
    ) -> Result<Option<FeatureCostConfig>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["soft_delete_feature_cost"])
            .start_timer();

        let row = sqlx::query_as::<_, FeatureCostConfig>(
            r#"
            UPDATE feature_cost_configs
            SET is_deleted = TRUE, updated_utc = NOW()
            WHERE feature_key = $1
            RETURNING id, feature_key, product_type, internal_cost_credits, is_deleted, created_utc, updated_utc
            "#,
        )
        .bind(feature_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to delete feature cost: {}", e)))?;

        timer.observe_duration();
        Ok(row)
    }

    #[instrument(skip(self, input), fields(plan_id = %input.plan_id))]
    async fn upsert_pricing_rule(
        &self,
        input: &UpsertPricingRule,
    ) -> Result<PlanPricingRule, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_pricing_rule"])
            .start_timer();

        let row = sqlx::query_as::<_, PlanPricingRule>(
            r#"
            INSERT INTO plan_pricing_rules (id, plan_id, multiplier, credits_allocation, rate_limit_per_minute, rate_limit_per_day)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (plan_id) DO UPDATE
            SET multiplier = EXCLUDED.multiplier,
                credits_allocation = EXCLUDED.credits_allocation,
                rate_limit_per_minute = EXCLUDED.rate_limit_per_minute,
                rate_limit_per_day = EXCLUDED.rate_limit_per_day,
                is_deleted = FALSE,
                updated_utc = NOW()
            RETURNING id, plan_id, multiplier, credits_allocation, rate_limit_per_minute, rate_limit_per_day, is_deleted, created_utc, updated_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.plan_id)
        .bind(input.multiplier)
        .bind(input.credits_allocation)
        .bind(input.rate_limit_per_minute)
        .bind(input.rate_limit_per_day)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to upsert pricing rule: {}", e)))?;

        timer.observe_duration();
        info!(plan_id = %row.plan_id, "Pricing rule upserted");
        Ok(row)
    }

    #[instrument(skip(self), fields(plan_id = %plan_id))]
    async fn soft_delete_pricing_rule(
        &self,
        plan_id: Uuid,
    ) -> Result<Option<PlanPricingRule>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["soft_delete_pricing_rule"])
            .start_timer();

        let row = sqlx::query_as::<_, PlanPricingRule>(
            r#"
            UPDATE plan_pricing_rules
            SET is_deleted = TRUE, updated_utc = NOW()
            WHERE plan_id = $1
            RETURNING id, plan_id, multiplier, credits_allocation, rate_limit_per_minute, rate_limit_per_day, is_deleted, created_utc, updated_utc
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to delete pricing rule: {}", e)))?;

        timer.observe_duration();
        Ok(row)
    }

    #[instrument(skip(self, input), fields(owner_id = %input.owner_id, request_id = %input.request_id))]
    async fn create_usage_log(&self, input: &CreateUsageLog) -> Result<UsageLog, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_usage_log"])
            .start_timer();

        let row = sqlx::query_as::<_, UsageLog>(&format!(
            r#"
            INSERT INTO usage_logs (id, owner_id, request_id, fingerprint_hash, feature_key, endpoint, method, access_status, status, credits_reserved, client_ip, client_user_agent, usage_estimate)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {}
            "#,
            USAGE_LOG_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(input.owner_id)
        .bind(&input.request_id)
        .bind(&input.fingerprint_hash)
        .bind(&input.feature_key)
        .bind(&input.endpoint)
        .bind(&input.method)
        .bind(input.access_status.as_str())
        .bind(UsageLogStatus::Pending.as_str())
        .bind(input.credits_reserved)
        .bind(&input.client_ip)
        .bind(&input.client_user_agent)
        .bind(&input.usage_estimate)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create usage log: {}", e)))?;

        timer.observe_duration();
        Ok(row)
    }

    #[instrument(skip(self), fields(usage_id = %id))]
    async fn get_usage_log(&self, id: Uuid) -> Result<Option<UsageLog>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_usage_log"])
            .start_timer();

        let row = sqlx::query_as::<_, UsageLog>(&format!(
            "SELECT {} FROM usage_logs WHERE id = $1 AND is_deleted = FALSE",
            USAGE_LOG_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get usage log: {}", e)))?;

        timer.observe_duration();
        Ok(row)
    }

    #[instrument(skip(self, fingerprint_hash), fields(owner_id = %owner_id, request_id = %request_id))]
    async fn find_usage_log(
        &self,
        owner_id: Uuid,
        request_id: &str,
        fingerprint_hash: &str,
    ) -> Result<Option<UsageLog>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_usage_log"])
            .start_timer();

        let row = sqlx::query_as::<_, UsageLog>(&format!(
            r#"
            SELECT {}
            FROM usage_logs
            WHERE owner_id = $1 AND request_id = $2 AND fingerprint_hash = $3 AND is_deleted = FALSE
            ORDER BY created_utc DESC
            LIMIT 1
            "#,
            USAGE_LOG_COLUMNS
        ))
        .bind(owner_id)
        .bind(request_id)
        .bind(fingerprint_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to find usage log: {}", e)))?;

        timer.observe_duration();
        Ok(row)
    }

    #[instrument(skip(self, metrics, failure), fields(usage_id = %id, success = success))]
    async fn commit_usage_log(
        &self,
        id: Uuid,
        success: bool,
        metrics: Option<&UsageMetrics>,
        failure: Option<&FailureDetails>,
    ) -> Result<Option<UsageLog>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["commit_usage_log"])
            .start_timer();

        // Settle only if still PENDING; concurrent commits race on this
        // guard and the loser falls through to the read below.
        let updated = if success {
            let m = metrics.cloned().unwrap_or_default();
            sqlx::query_as::<_, UsageLog>(&format!(
                r#"
                UPDATE usage_logs
                SET status = 'success',
                    credits_charged = credits_reserved,
                    committed_at = NOW(),
                    model_used = COALESCE($2, model_used),
                    input_tokens = COALESCE($3, input_tokens),
                    output_tokens = COALESCE($4, output_tokens),
                    latency_ms = COALESCE($5, latency_ms),
                    updated_utc = NOW()
                WHERE id = $1 AND status = 'pending' AND is_deleted = FALSE
                RETURNING {}
                "#,
                USAGE_LOG_COLUMNS
            ))
            .bind(id)
            .bind(m.model_used)
            .bind(m.input_tokens)
            .bind(m.output_tokens)
            .bind(m.latency_ms)
            .fetch_optional(&self.pool)
            .await
        } else {
            let failure = failure.ok_or_else(|| {
                AppError::BadRequest(anyhow::anyhow!(
                    "Failure details are required when committing with success=false"
                ))
            })?;
            sqlx::query_as::<_, UsageLog>(&format!(
                r#"
                UPDATE usage_logs
                SET status = 'failed',
                    committed_at = NOW(),
                    failure_type = $2,
                    failure_reason = $3,
                    updated_utc = NOW()
                WHERE id = $1 AND status = 'pending' AND is_deleted = FALSE
                RETURNING {}
                "#,
                USAGE_LOG_COLUMNS
            ))
            .bind(id)
            .bind(failure.failure_type.as_str())
            .bind(&failure.reason)
            .fetch_optional(&self.pool)
            .await
        }
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to commit usage log: {}", e)))?;

        timer.observe_duration();

        if updated.is_some() {
            return Ok(updated);
        }

        // Not PENDING (or missing): return the terminal row unchanged.
        self.get_usage_log(id).await
    }

    #[instrument(skip(self))]
    async fn expire_pending(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["expire_pending"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE usage_logs
            SET status = 'expired', committed_at = NOW(), updated_utc = NOW()
            WHERE status = 'pending' AND created_utc < $1 AND is_deleted = FALSE
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to expire pending rows: {}", e)))?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(owner_id = %owner_id))]
    async fn sum_success_credits(
        &self,
        owner_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Decimal, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["sum_success_credits"])
            .start_timer();

        let total: Decimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(credits_reserved), 0)
            FROM usage_logs
            WHERE owner_id = $1
              AND status = 'success'
              AND access_status = 'granted'
              AND created_utc >= $2
              AND created_utc < $3
              AND is_deleted = FALSE
            "#,
        )
        .bind(owner_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to sum credits: {}", e)))?;

        timer.observe_duration();
        Ok(total)
    }

    #[instrument(skip(self), fields(owner_id = %owner_id))]
    async fn get_billing_context(
        &self,
        owner_id: Uuid,
    ) -> Result<Option<BillingContext>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_billing_context"])
            .start_timer();

        let row = sqlx::query_as::<_, BillingContext>(
            r#"
            SELECT owner_id, plan_id, period_start, period_end, anchor_utc, credits_used, created_utc, updated_utc
            FROM billing_contexts
            WHERE owner_id = $1
            "#,
        )
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get billing context: {}", e)))?;

        timer.observe_duration();
        Ok(row)
    }

    #[instrument(skip(self), fields(owner_id = %owner_id))]
    async fn add_credits_used(&self, owner_id: Uuid, amount: Decimal) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["add_credits_used"])
            .start_timer();

        // Single atomic in-place increment, no read-modify-write.
        sqlx::query(
            r#"
            UPDATE billing_contexts
            SET credits_used = credits_used + $2, updated_utc = NOW()
            WHERE owner_id = $1
            "#,
        )
        .bind(owner_id)
        .bind(amount)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to add credits used: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }
}
