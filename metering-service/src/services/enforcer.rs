//! Quota enforcement pipeline: idempotency, rate limits, quota, reserve.

use crate::cache::QuotaCache;
use crate::models::{
    compute_billing_period, AccessStatus, CreateUsageLog, FailureDetails, FeatureKey, UsageLog,
    UsageMetrics,
};
use crate::ratelimit::{format_rate_limit_key, RateLimitScope, RateLimiter};
use crate::services::fingerprint::create_request_fingerprint;
use crate::services::metrics::{
    record_commit, record_expired, record_rate_limit_denial, record_validation,
};
use crate::store::QuotaStore;
use chrono::{DateTime, Utc};
use metering_core::error::AppError;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const MINUTE_WINDOW_SECS: i64 = 60;
const DAY_WINDOW_SECS: i64 = 86_400;

/// One validation request flowing into the enforcement pipeline.
#[derive(Debug, Clone)]
pub struct ValidateUsage {
    pub owner_id: Uuid,
    pub request_id: String,
    pub feature_key: FeatureKey,
    pub endpoint: String,
    pub method: String,
    pub payload_hash: String,
    pub usage_estimate: Option<serde_json::Value>,
    pub client_ip: Option<String>,
    pub client_user_agent: Option<String>,
}

/// Decision returned to the caller. `usage_id` identifies the ledger
/// row to commit against when access was granted.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub access: AccessStatus,
    pub usage_id: Uuid,
    pub message: String,
    pub credits_reserved: Decimal,
    pub retry_after: Option<i64>,
    pub replayed: bool,
}

impl ValidationOutcome {
    fn from_existing(row: &UsageLog) -> Self {
        let access = row.access_status();
        let message = match access {
            AccessStatus::Granted => format!(
                "Access granted. {:.2} credits reserved for this request.",
                row.credits_reserved
            ),
            AccessStatus::Denied => "Access was denied for the original request.".to_string(),
        };
        Self {
            access,
            usage_id: row.id,
            message,
            credits_reserved: row.credits_reserved,
            retry_after: None,
            replayed: true,
        }
    }
}

/// Result of settling a reservation.
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    /// The row transitioned out of PENDING in this call.
    Committed(UsageLog),
    /// The row was already terminal; returned unchanged.
    Replayed(UsageLog),
    /// No such reservation.
    NotFound,
}

/// Orders the admission checks for every metered request: idempotency
/// replay first, then rate limits, then credit quota, then the PENDING
/// reservation. Denials are recorded in the ledger too so the decision
/// itself is replayable.
pub struct QuotaEnforcer {
    store: Arc<dyn QuotaStore>,
    cache: Arc<QuotaCache>,
    limiter: RateLimiter,
}

impl QuotaEnforcer {
    pub fn new(store: Arc<dyn QuotaStore>, cache: Arc<QuotaCache>, limiter: RateLimiter) -> Self {
        Self {
            store,
            cache,
            limiter,
        }
    }

    #[instrument(skip(self, input), fields(owner_id = %input.owner_id, request_id = %input.request_id, feature_key = %input.feature_key))]
    pub async fn validate_and_reserve(
        &self,
        input: ValidateUsage,
    ) -> Result<ValidationOutcome, AppError> {
        let fingerprint = create_request_fingerprint(
            input.feature_key.as_str(),
            &input.endpoint,
            &input.method,
            &input.payload_hash,
            input.usage_estimate.as_ref(),
        );

        // Replay: same (owner, request_id, fingerprint) returns the
        // original decision without re-checking or re-reserving.
        if let Some(existing) = self
            .store
            .find_usage_log(input.owner_id, &input.request_id, &fingerprint)
            .await?
        {
            info!(usage_id = %existing.id, "Duplicate request, returning original decision");
            record_validation("replayed");
            return Ok(ValidationOutcome::from_existing(&existing));
        }

        let context = self.store.get_billing_context(input.owner_id).await?;
        let plan_id = context.as_ref().and_then(|c| c.plan_id);

        // Rate limits before quota: they are the cheaper check and the
        // denial reserves nothing.
        if let Some(limit) = self.cache.get_plan_rate_limit(plan_id).await {
            let key = format_rate_limit_key(
                RateLimitScope::Plan,
                &input.owner_id.to_string(),
                "minute",
            );
            let result = self.limiter.check(&key, limit, MINUTE_WINDOW_SECS).await?;
            if !result.allowed {
                return self
                    .deny_rate_limited(&input, &fingerprint, "minute", limit, result.retry_after)
                    .await;
            }
        }

        if let Some(limit) = self.cache.get_plan_rate_day_limit(plan_id).await {
            let key =
                format_rate_limit_key(RateLimitScope::Plan, &input.owner_id.to_string(), "day");
            let result = self.limiter.check(&key, limit, DAY_WINDOW_SECS).await?;
            if !result.allowed {
                return self
                    .deny_rate_limited(&input, &fingerprint, "day", limit, result.retry_after)
                    .await;
            }
        }

        let billable = self
            .cache
            .calculate_billable_cost(&input.feature_key, plan_id)
            .await;
        let allocation = self
            .cache
            .get_plan_credits_allocation_with_fallback(self.store.as_ref(), plan_id)
            .await;

        let now = Utc::now();
        let (period_start, period_end) = match &context {
            Some(ctx) => {
                compute_billing_period(ctx.period_start, ctx.period_end, ctx.anchor_utc, now)
            }
            // No billing context yet: period 0 starts now.
            None => compute_billing_period(None, None, now, now),
        };

        let used = self
            .store
            .sum_success_credits(input.owner_id, period_start, period_end)
            .await?;

        if used + billable > allocation {
            warn!(
                owner_id = %input.owner_id,
                used = %used,
                allocation = %allocation,
                requested = %billable,
                "Quota exceeded"
            );
            let row = self
                .reserve(&input, &fingerprint, AccessStatus::Denied, billable)
                .await?;
            record_validation("denied_quota");
            return Ok(ValidationOutcome {
                access: AccessStatus::Denied,
                usage_id: row.id,
                message: format!(
                    "Quota exceeded. Used {:.2}/{:.2} credits. This request requires {:.2} credits.",
                    used, allocation, billable
                ),
                credits_reserved: billable,
                retry_after: None,
                replayed: false,
            });
        }

        let row = self
            .reserve(&input, &fingerprint, AccessStatus::Granted, billable)
            .await?;
        record_validation("granted");
        let remaining = allocation - used - billable;
        Ok(ValidationOutcome {
            access: AccessStatus::Granted,
            usage_id: row.id,
            message: format!(
                "Access granted. {:.2} credits remaining after this request.",
                remaining
            ),
            credits_reserved: billable,
            retry_after: None,
            replayed: false,
        })
    }

    async fn deny_rate_limited(
        &self,
        input: &ValidateUsage,
        fingerprint: &str,
        window: &str,
        limit: i64,
        retry_after: Option<i64>,
    ) -> Result<ValidationOutcome, AppError> {
        record_rate_limit_denial(window);
        record_validation("denied_rate_limit");
        let row = self
            .reserve(input, fingerprint, AccessStatus::Denied, Decimal::ZERO)
            .await?;
        let retry = retry_after.unwrap_or(1);
        let per = match window {
            "minute" => "requests/minute",
            _ => "requests/day",
        };
        Ok(ValidationOutcome {
            access: AccessStatus::Denied,
            usage_id: row.id,
            message: format!(
                "Rate limit exceeded. Limit: {} {}. Try again in {} seconds.",
                limit, per, retry
            ),
            credits_reserved: Decimal::ZERO,
            retry_after: Some(retry),
            replayed: false,
        })
    }

    async fn reserve(
        &self,
        input: &ValidateUsage,
        fingerprint: &str,
        access: AccessStatus,
        credits: Decimal,
    ) -> Result<UsageLog, AppError> {
        self.store
            .create_usage_log(&CreateUsageLog {
                owner_id: input.owner_id,
                request_id: input.request_id.clone(),
                fingerprint_hash: fingerprint.to_string(),
                feature_key: input.feature_key.clone(),
                endpoint: input.endpoint.to_lowercase(),
                method: input.method.to_uppercase(),
                access_status: access,
                credits_reserved: credits,
                client_ip: input.client_ip.clone(),
                client_user_agent: input.client_user_agent.clone(),
                usage_estimate: input.usage_estimate.clone(),
            })
            .await
    }

    /// Settle a reservation. Idempotent: a terminal row is returned
    /// unchanged. Successful settlement of a granted row also bumps the
    /// owner's running credits-used counter.
    #[instrument(skip(self, metrics, failure), fields(usage_id = %usage_id, owner_id = %owner_id, success = success))]
    pub async fn commit(
        &self,
        usage_id: Uuid,
        owner_id: Uuid,
        success: bool,
        metrics: Option<&UsageMetrics>,
        failure: Option<&FailureDetails>,
    ) -> Result<CommitOutcome, AppError> {
        let Some(existing) = self.store.get_usage_log(usage_id).await? else {
            record_commit("not_found");
            return Ok(CommitOutcome::NotFound);
        };

        if existing.owner_id != owner_id {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "Usage log does not belong to this owner"
            )));
        }

        if existing.status().is_terminal() {
            info!(status = %existing.status, "Reservation already settled, returning unchanged");
            record_commit("replayed");
            return Ok(CommitOutcome::Replayed(existing));
        }

        if !success && failure.is_none() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Failure details are required when success is false"
            )));
        }

        let Some(committed) = self
            .store
            .commit_usage_log(usage_id, success, metrics, failure)
            .await?
        else {
            record_commit("not_found");
            return Ok(CommitOutcome::NotFound);
        };

        if success && committed.access_status() == AccessStatus::Granted {
            self.store
                .add_credits_used(owner_id, committed.credits_reserved)
                .await?;
        }

        record_commit(if success { "success" } else { "failed" });
        Ok(CommitOutcome::Committed(committed))
    }

    /// Sweep PENDING reservations older than `older_than` to EXPIRED.
    #[instrument(skip(self))]
    pub async fn expire_pending(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        let expired = self.store.expire_pending(older_than).await?;
        if expired > 0 {
            info!(expired = expired, "Expired stale pending reservations");
            record_expired(expired);
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryQuotaCache, QuotaCache};
    use crate::models::{
        BillingContext, FailureType, UpsertFeatureCost, UpsertPricingRule,
    };
    use crate::ratelimit::MemoryRateLimit;
    use crate::store::MemoryStore;
    use std::str::FromStr;

    fn feature_key() -> FeatureKey {
        FeatureKey::from_str("api.extract").unwrap()
    }

    fn validate_input(owner_id: Uuid, request_id: &str) -> ValidateUsage {
        ValidateUsage {
            owner_id,
            request_id: request_id.to_string(),
            feature_key: feature_key(),
            endpoint: "/v1/extract".to_string(),
            method: "POST".to_string(),
            payload_hash: "a".repeat(64),
            usage_estimate: None,
            client_ip: Some("10.0.0.1".to_string()),
            client_user_agent: None,
        }
    }

    fn billing_context(owner_id: Uuid, plan_id: Option<Uuid>) -> BillingContext {
        let now = Utc::now();
        BillingContext {
            owner_id,
            plan_id,
            period_start: None,
            period_end: None,
            anchor_utc: now - chrono::Duration::days(1),
            credits_used: Decimal::ZERO,
            created_utc: now,
            updated_utc: now,
        }
    }

    async fn setup(
        plan: Option<UpsertPricingRule>,
    ) -> (Arc<MemoryStore>, QuotaEnforcer, Uuid, Option<Uuid>) {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_feature_cost(&UpsertFeatureCost {
                feature_key: feature_key(),
                internal_cost_credits: Decimal::new(600, 2),
            })
            .await
            .unwrap();

        let owner_id = Uuid::new_v4();
        let plan_id = plan.as_ref().map(|p| p.plan_id);
        if let Some(rule) = plan {
            store.upsert_pricing_rule(&rule).await.unwrap();
        }
        store
            .put_billing_context(billing_context(owner_id, plan_id))
            .unwrap();

        let cache = Arc::new(QuotaCache::new(Arc::new(MemoryQuotaCache::new())));
        cache.init(store.as_ref()).await.unwrap();

        let limiter = RateLimiter::new(Arc::new(MemoryRateLimit::new()));
        let enforcer = QuotaEnforcer::new(store.clone() as Arc<dyn QuotaStore>, cache, limiter);
        (store, enforcer, owner_id, plan_id)
    }

    fn plan_rule(credits: Decimal, per_minute: Option<i32>, per_day: Option<i32>) -> UpsertPricingRule {
        UpsertPricingRule {
            plan_id: Uuid::new_v4(),
            multiplier: Decimal::new(200, 2),
            credits_allocation: credits,
            rate_limit_per_minute: per_minute,
            rate_limit_per_day: per_day,
        }
    }

    #[tokio::test]
    async fn grants_and_reserves_billable_cost() {
        let (store, enforcer, owner_id, _) =
            setup(Some(plan_rule(Decimal::new(100_00, 2), None, None))).await;

        let outcome = enforcer
            .validate_and_reserve(validate_input(owner_id, "req-1"))
            .await
            .unwrap();

        assert_eq!(outcome.access, AccessStatus::Granted);
        assert!(!outcome.replayed);
        // 6.00 cost * 2.00 multiplier
        assert_eq!(outcome.credits_reserved, Decimal::new(12_00, 2));
        assert!(outcome.message.contains("88.00 credits remaining"));

        let row = store.get_usage_log(outcome.usage_id).await.unwrap().unwrap();
        assert_eq!(row.status(), crate::models::UsageLogStatus::Pending);
        assert_eq!(row.credits_reserved, Decimal::new(12_00, 2));
    }

    #[tokio::test]
    async fn duplicate_request_replays_original_decision() {
        let (_, enforcer, owner_id, _) =
            setup(Some(plan_rule(Decimal::new(100_00, 2), None, None))).await;

        let first = enforcer
            .validate_and_reserve(validate_input(owner_id, "req-1"))
            .await
            .unwrap();
        let second = enforcer
            .validate_and_reserve(validate_input(owner_id, "req-1"))
            .await
            .unwrap();

        assert!(second.replayed);
        assert_eq!(second.usage_id, first.usage_id);
        assert_eq!(second.credits_reserved, first.credits_reserved);
    }

    #[tokio::test]
    async fn different_payload_is_not_a_replay() {
        let (_, enforcer, owner_id, _) =
            setup(Some(plan_rule(Decimal::new(100_00, 2), None, None))).await;

        let first = enforcer
            .validate_and_reserve(validate_input(owner_id, "req-1"))
            .await
            .unwrap();
        let mut other = validate_input(owner_id, "req-1");
        other.payload_hash = "b".repeat(64);
        let second = enforcer.validate_and_reserve(other).await.unwrap();

        assert!(!second.replayed);
        assert_ne!(second.usage_id, first.usage_id);
    }

    #[tokio::test]
    async fn different_feature_is_not_a_replay() {
        let (_, enforcer, owner_id, _) =
            setup(Some(plan_rule(Decimal::new(100_00, 2), None, None))).await;

        let first = enforcer
            .validate_and_reserve(validate_input(owner_id, "req-1"))
            .await
            .unwrap();
        let mut other = validate_input(owner_id, "req-1");
        other.feature_key = FeatureKey::from_str("api.classify").unwrap();
        let second = enforcer.validate_and_reserve(other).await.unwrap();

        assert!(!second.replayed);
        assert_ne!(second.usage_id, first.usage_id);
    }

    #[tokio::test]
    async fn fourth_request_of_three_per_minute_is_denied() {
        let (store, enforcer, owner_id, _) =
            setup(Some(plan_rule(Decimal::new(1000_00, 2), Some(3), None))).await;

        for i in 0..3 {
            let outcome = enforcer
                .validate_and_reserve(validate_input(owner_id, &format!("req-{}", i)))
                .await
                .unwrap();
            assert_eq!(outcome.access, AccessStatus::Granted);
        }

        let denied = enforcer
            .validate_and_reserve(validate_input(owner_id, "req-3"))
            .await
            .unwrap();
        assert_eq!(denied.access, AccessStatus::Denied);
        assert!(denied.message.contains("requests/minute"));
        assert!(denied.retry_after.is_some());
        assert_eq!(denied.credits_reserved, Decimal::ZERO);

        // The denial itself is in the ledger.
        let row = store.get_usage_log(denied.usage_id).await.unwrap().unwrap();
        assert_eq!(row.access_status(), AccessStatus::Denied);
    }

    #[tokio::test]
    async fn day_limit_is_enforced_after_minute_limit_passes() {
        let (_, enforcer, owner_id, _) =
            setup(Some(plan_rule(Decimal::new(1000_00, 2), None, Some(2)))).await;

        for i in 0..2 {
            let outcome = enforcer
                .validate_and_reserve(validate_input(owner_id, &format!("req-{}", i)))
                .await
                .unwrap();
            assert_eq!(outcome.access, AccessStatus::Granted);
        }

        let denied = enforcer
            .validate_and_reserve(validate_input(owner_id, "req-2"))
            .await
            .unwrap();
        assert_eq!(denied.access, AccessStatus::Denied);
        assert!(denied.message.contains("requests/day"));
    }

    #[tokio::test]
    async fn quota_exhaustion_denies_and_records_requested_cost() {
        // Allocation fits exactly one 12.00-credit request.
        let (store, enforcer, owner_id, _) =
            setup(Some(plan_rule(Decimal::new(12_00, 2), None, None))).await;

        let first = enforcer
            .validate_and_reserve(validate_input(owner_id, "req-1"))
            .await
            .unwrap();
        assert_eq!(first.access, AccessStatus::Granted);
        enforcer
            .commit(first.usage_id, owner_id, true, None, None)
            .await
            .unwrap();

        let denied = enforcer
            .validate_and_reserve(validate_input(owner_id, "req-2"))
            .await
            .unwrap();
        assert_eq!(denied.access, AccessStatus::Denied);
        assert!(denied.message.contains("Quota exceeded"));
        assert!(denied.message.contains("12.00/12.00"));
        assert!(denied.retry_after.is_none());

        let row = store.get_usage_log(denied.usage_id).await.unwrap().unwrap();
        assert_eq!(row.credits_reserved, Decimal::new(12_00, 2));
    }

    #[tokio::test]
    async fn pending_reservations_do_not_count_against_quota() {
        let (_, enforcer, owner_id, _) =
            setup(Some(plan_rule(Decimal::new(12_00, 2), None, None))).await;

        // Reserved but never committed: only SUCCESS rows count.
        let first = enforcer
            .validate_and_reserve(validate_input(owner_id, "req-1"))
            .await
            .unwrap();
        assert_eq!(first.access, AccessStatus::Granted);

        let second = enforcer
            .validate_and_reserve(validate_input(owner_id, "req-2"))
            .await
            .unwrap();
        assert_eq!(second.access, AccessStatus::Granted);
    }

    #[tokio::test]
    async fn successful_commit_charges_and_bumps_counter() {
        let (store, enforcer, owner_id, _) =
            setup(Some(plan_rule(Decimal::new(100_00, 2), None, None))).await;

        let outcome = enforcer
            .validate_and_reserve(validate_input(owner_id, "req-1"))
            .await
            .unwrap();

        let metrics = UsageMetrics {
            model_used: Some("small".to_string()),
            input_tokens: Some(120),
            output_tokens: Some(40),
            latency_ms: Some(900),
        };
        let committed = enforcer
            .commit(outcome.usage_id, owner_id, true, Some(&metrics), None)
            .await
            .unwrap();

        let CommitOutcome::Committed(row) = committed else {
            panic!("expected a committed row");
        };
        assert_eq!(row.status(), crate::models::UsageLogStatus::Success);
        assert_eq!(row.credits_charged, Some(Decimal::new(12_00, 2)));
        assert_eq!(row.model_used.as_deref(), Some("small"));

        let context = store.get_billing_context(owner_id).await.unwrap().unwrap();
        assert_eq!(context.credits_used, Decimal::new(12_00, 2));
    }

    #[tokio::test]
    async fn commit_is_idempotent() {
        let (store, enforcer, owner_id, _) =
            setup(Some(plan_rule(Decimal::new(100_00, 2), None, None))).await;

        let outcome = enforcer
            .validate_and_reserve(validate_input(owner_id, "req-1"))
            .await
            .unwrap();
        enforcer
            .commit(outcome.usage_id, owner_id, true, None, None)
            .await
            .unwrap();
        let replay = enforcer
            .commit(outcome.usage_id, owner_id, true, None, None)
            .await
            .unwrap();

        assert!(matches!(replay, CommitOutcome::Replayed(_)));
        // Counter bumped exactly once.
        let context = store.get_billing_context(owner_id).await.unwrap().unwrap();
        assert_eq!(context.credits_used, Decimal::new(12_00, 2));
    }

    #[tokio::test]
    async fn failed_commit_requires_failure_details() {
        let (_, enforcer, owner_id, _) =
            setup(Some(plan_rule(Decimal::new(100_00, 2), None, None))).await;

        let outcome = enforcer
            .validate_and_reserve(validate_input(owner_id, "req-1"))
            .await
            .unwrap();

        let missing = enforcer
            .commit(outcome.usage_id, owner_id, false, None, None)
            .await;
        assert!(matches!(missing, Err(AppError::BadRequest(_))));

        let failure = FailureDetails {
            failure_type: FailureType::Timeout,
            reason: "Upstream model timed out".to_string(),
        };
        let committed = enforcer
            .commit(outcome.usage_id, owner_id, false, None, Some(&failure))
            .await
            .unwrap();
        let CommitOutcome::Committed(row) = committed else {
            panic!("expected a committed row");
        };
        assert_eq!(row.status(), crate::models::UsageLogStatus::Failed);
        assert_eq!(row.failure_type.as_deref(), Some("timeout"));
        assert_eq!(row.credits_charged, None);
    }

    #[tokio::test]
    async fn commit_by_wrong_owner_is_forbidden() {
        let (_, enforcer, owner_id, _) =
            setup(Some(plan_rule(Decimal::new(100_00, 2), None, None))).await;

        let outcome = enforcer
            .validate_and_reserve(validate_input(owner_id, "req-1"))
            .await
            .unwrap();
        let result = enforcer
            .commit(outcome.usage_id, Uuid::new_v4(), true, None, None)
            .await;
        assert!(matches!(result, Err(AppError::Forbidden(_))));
    }

    #[tokio::test]
    async fn commit_of_unknown_reservation_is_not_found() {
        let (_, enforcer, owner_id, _) =
            setup(Some(plan_rule(Decimal::new(100_00, 2), None, None))).await;
        let _ = owner_id;

        let result = enforcer
            .commit(Uuid::new_v4(), Uuid::new_v4(), true, None, None)
            .await
            .unwrap();
        assert!(matches!(result, CommitOutcome::NotFound));
    }

    #[tokio::test]
    async fn stale_pending_rows_are_swept_to_expired() {
        let (store, enforcer, owner_id, _) =
            setup(Some(plan_rule(Decimal::new(100_00, 2), None, None))).await;

        let outcome = enforcer
            .validate_and_reserve(validate_input(owner_id, "req-1"))
            .await
            .unwrap();

        let swept = enforcer
            .expire_pending(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(swept, 1);

        let row = store.get_usage_log(outcome.usage_id).await.unwrap().unwrap();
        assert_eq!(row.status(), crate::models::UsageLogStatus::Expired);
        // Expiry is a terminal transition and stamps committed_at like
        // success and failure do.
        assert!(row.committed_at.is_some());

        // Sweeping again finds nothing.
        let swept = enforcer
            .expire_pending(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(swept, 0);
    }

    #[tokio::test]
    async fn owner_without_plan_uses_defaults() {
        let (_, enforcer, owner_id, _) = setup(None).await;

        let outcome = enforcer
            .validate_and_reserve(validate_input(owner_id, "req-1"))
            .await
            .unwrap();
        assert_eq!(outcome.access, AccessStatus::Granted);
        // 6.00 default cost * 3.00 default multiplier
        assert_eq!(outcome.credits_reserved, Decimal::new(18_00, 2));
    }
}
