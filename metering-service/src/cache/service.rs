//! Quota cache context object.

use crate::cache::{
    DEFAULT_FEATURE_COST, DEFAULT_PLAN_CREDITS, DEFAULT_PLAN_MULTIPLIER,
    DEFAULT_RATE_LIMIT_PER_DAY, DEFAULT_RATE_LIMIT_PER_MINUTE, QuotaCacheBackend, UNLIMITED,
};
use crate::models::{FeatureKey, PlanPricingRule, QuotaChange};
use crate::store::QuotaStore;
use metering_core::error::AppError;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Cache lifecycle. Only `Initialized` serves hydrated data; lookups in
/// the other states fall back to defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheState {
    Uninitialized = 0,
    Initializing = 1,
    Initialized = 2,
}

impl CacheState {
    fn from_u8(v: u8) -> Self {
        match v {
            2 => CacheState::Initialized,
            1 => CacheState::Initializing,
            _ => CacheState::Uninitialized,
        }
    }
}

/// Hydrated parameter cache handed to the enforcer and the admin write
/// path. Owns one backend for its lifetime; `refresh` re-hydrates into
/// the same backend.
pub struct QuotaCache {
    backend: Arc<dyn QuotaCacheBackend>,
    state: AtomicU8,
}

impl QuotaCache {
    pub fn new(backend: Arc<dyn QuotaCacheBackend>) -> Self {
        Self {
            backend,
            state: AtomicU8::new(CacheState::Uninitialized as u8),
        }
    }

    pub fn state(&self) -> CacheState {
        CacheState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == CacheState::Initialized
    }

    /// Hydrate the cache from the store. A second call while initialized
    /// or initializing is a no-op.
    #[instrument(skip(self, store))]
    pub async fn init(&self, store: &dyn QuotaStore) -> Result<(), AppError> {
        if self
            .state
            .compare_exchange(
                CacheState::Uninitialized as u8,
                CacheState::Initializing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!("Quota cache already initialized, skipping");
            return Ok(());
        }

        match self.hydrate(store).await {
            Ok((features, rules)) => {
                self.state
                    .store(CacheState::Initialized as u8, Ordering::Release);
                info!(
                    feature_costs = features,
                    pricing_rules = rules,
                    "Quota cache initialized"
                );
                Ok(())
            }
            Err(e) => {
                self.state
                    .store(CacheState::Uninitialized as u8, Ordering::Release);
                Err(e)
            }
        }
    }

    async fn hydrate(&self, store: &dyn QuotaStore) -> Result<(usize, usize), AppError> {
        let features = store.load_feature_costs().await?;
        for config in &features {
            self.backend
                .set_feature_cost(&config.feature_key, config.internal_cost_credits)
                .await?;
        }

        let rules = store.load_pricing_rules().await?;
        for rule in &rules {
            self.write_rule(rule).await?;
        }

        Ok((features.len(), rules.len()))
    }

    async fn write_rule(&self, rule: &PlanPricingRule) -> Result<(), AppError> {
        self.backend
            .set_plan_multiplier(rule.plan_id, rule.multiplier)
            .await?;
        self.backend
            .set_plan_credits_allocation(rule.plan_id, rule.credits_allocation)
            .await?;
        self.backend
            .set_plan_rate_limit(
                rule.plan_id,
                rule.rate_limit_per_minute.map(i64::from).unwrap_or(UNLIMITED),
            )
            .await?;
        self.backend
            .set_plan_rate_day_limit(
                rule.plan_id,
                rule.rate_limit_per_day.map(i64::from).unwrap_or(UNLIMITED),
            )
            .await?;
        Ok(())
    }

    async fn drop_rule(&self, plan_id: Uuid) -> Result<(), AppError> {
        self.backend.delete_plan_multiplier(plan_id).await?;
        self.backend.delete_plan_credits_allocation(plan_id).await?;
        self.backend.delete_plan_rate_limit(plan_id).await?;
        self.backend.delete_plan_rate_day_limit(plan_id).await?;
        Ok(())
    }

    /// Clear and re-hydrate against the same backend.
    #[instrument(skip(self, store))]
    pub async fn refresh(&self, store: &dyn QuotaStore) -> Result<(), AppError> {
        self.backend.clear().await?;
        self.state
            .store(CacheState::Uninitialized as u8, Ordering::Release);
        self.init(store).await
    }

    /// Apply one post-commit row change. Called (and awaited) by the
    /// admin write path after the persistence commit succeeds.
    #[instrument(skip(self, change))]
    pub async fn apply_change(&self, change: &QuotaChange) -> Result<(), AppError> {
        match change {
            QuotaChange::FeatureCost {
                feature_key,
                internal_cost_credits,
                is_deleted,
            } => {
                if *is_deleted {
                    self.backend.delete_feature_cost(feature_key).await?;
                    debug!(feature_key = %feature_key, "Cache: removed feature cost");
                } else {
                    self.backend
                        .set_feature_cost(feature_key, *internal_cost_credits)
                        .await?;
                    debug!(feature_key = %feature_key, "Cache: updated feature cost");
                }
            }
            QuotaChange::FeatureCostRemoved { feature_key } => {
                self.backend.delete_feature_cost(feature_key).await?;
                debug!(feature_key = %feature_key, "Cache: removed feature cost");
            }
            QuotaChange::PricingRule {
                plan_id,
                multiplier,
                credits_allocation,
                rate_limit_per_minute,
                rate_limit_per_day,
                is_deleted,
            } => {
                if *is_deleted {
                    self.drop_rule(*plan_id).await?;
                    debug!(plan_id = %plan_id, "Cache: removed pricing rule");
                } else {
                    self.write_rule(&PlanPricingRule {
                        id: Uuid::nil(),
                        plan_id: *plan_id,
                        multiplier: *multiplier,
                        credits_allocation: *credits_allocation,
                        rate_limit_per_minute: *rate_limit_per_minute,
                        rate_limit_per_day: *rate_limit_per_day,
                        is_deleted: false,
                        created_utc: chrono::Utc::now(),
                        updated_utc: chrono::Utc::now(),
                    })
                    .await?;
                    debug!(plan_id = %plan_id, "Cache: updated pricing rule");
                }
            }
            QuotaChange::PricingRuleRemoved { plan_id } => {
                self.drop_rule(*plan_id).await?;
                debug!(plan_id = %plan_id, "Cache: removed pricing rule");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookups: backend errors and misses degrade to documented defaults.
    // ------------------------------------------------------------------

    pub async fn get_feature_cost(&self, feature_key: &FeatureKey) -> Decimal {
        match self.backend.get_feature_cost(feature_key).await {
            Ok(Some(cost)) => cost,
            Ok(None) => *DEFAULT_FEATURE_COST,
            Err(e) => {
                warn!(feature_key = %feature_key, error = %e, "Feature cost lookup failed, using default");
                *DEFAULT_FEATURE_COST
            }
        }
    }

    pub async fn get_plan_multiplier(&self, plan_id: Option<Uuid>) -> Decimal {
        let Some(plan_id) = plan_id else {
            return *DEFAULT_PLAN_MULTIPLIER;
        };
        match self.backend.get_plan_multiplier(plan_id).await {
            Ok(Some(multiplier)) => multiplier,
            Ok(None) => *DEFAULT_PLAN_MULTIPLIER,
            Err(e) => {
                warn!(plan_id = %plan_id, error = %e, "Plan multiplier lookup failed, using default");
                *DEFAULT_PLAN_MULTIPLIER
            }
        }
    }

    pub async fn get_plan_credits_allocation(&self, plan_id: Option<Uuid>) -> Decimal {
        let Some(plan_id) = plan_id else {
            return *DEFAULT_PLAN_CREDITS;
        };
        match self.backend.get_plan_credits_allocation(plan_id).await {
            Ok(Some(credits)) => credits,
            Ok(None) => *DEFAULT_PLAN_CREDITS,
            Err(e) => {
                warn!(plan_id = %plan_id, error = %e, "Credits allocation lookup failed, using default");
                *DEFAULT_PLAN_CREDITS
            }
        }
    }

    /// Per-minute request limit. `None` means the plan is unlimited.
    pub async fn get_plan_rate_limit(&self, plan_id: Option<Uuid>) -> Option<i64> {
        let Some(plan_id) = plan_id else {
            return Some(DEFAULT_RATE_LIMIT_PER_MINUTE);
        };
        match self.backend.get_plan_rate_limit(plan_id).await {
            Ok(Some(UNLIMITED)) => None,
            Ok(Some(limit)) => Some(limit),
            Ok(None) => Some(DEFAULT_RATE_LIMIT_PER_MINUTE),
            Err(e) => {
                warn!(plan_id = %plan_id, error = %e, "Rate limit lookup failed, using default");
                Some(DEFAULT_RATE_LIMIT_PER_MINUTE)
            }
        }
    }

    /// Per-day request limit. `None` means the plan is unlimited.
    pub async fn get_plan_rate_day_limit(&self, plan_id: Option<Uuid>) -> Option<i64> {
        let Some(plan_id) = plan_id else {
            return Some(DEFAULT_RATE_LIMIT_PER_DAY);
        };
        match self.backend.get_plan_rate_day_limit(plan_id).await {
            Ok(Some(UNLIMITED)) => None,
            Ok(Some(limit)) => Some(limit),
            Ok(None) => Some(DEFAULT_RATE_LIMIT_PER_DAY),
            Err(e) => {
                warn!(plan_id = %plan_id, error = %e, "Day rate limit lookup failed, using default");
                Some(DEFAULT_RATE_LIMIT_PER_DAY)
            }
        }
    }

    /// Billable cost of one call: base feature cost times the plan
    /// multiplier. Pure over the two cache reads.
    pub async fn calculate_billable_cost(
        &self,
        feature_key: &FeatureKey,
        plan_id: Option<Uuid>,
    ) -> Decimal {
        let cost = self.get_feature_cost(feature_key).await;
        let multiplier = self.get_plan_multiplier(plan_id).await;
        cost * multiplier
    }

    /// Credits allocation with a direct store fallback: cache, then DB
    /// (best-effort repopulating the cache), then the default.
    pub async fn get_plan_credits_allocation_with_fallback(
        &self,
        store: &dyn QuotaStore,
        plan_id: Option<Uuid>,
    ) -> Decimal {
        let Some(plan_id) = plan_id else {
            return *DEFAULT_PLAN_CREDITS;
        };

        match self.backend.get_plan_credits_allocation(plan_id).await {
            Ok(Some(credits)) => return credits,
            Ok(None) => {}
            Err(e) => {
                warn!(plan_id = %plan_id, error = %e, "Cache lookup failed, falling back to store");
            }
        }

        match store.get_pricing_rule(plan_id).await {
            Ok(Some(rule)) => {
                // Repopulate is best-effort
                if let Err(e) = self.write_rule(&rule).await {
                    debug!(plan_id = %plan_id, error = %e, "Cache repopulation failed");
                }
                rule.credits_allocation
            }
            Ok(None) => *DEFAULT_PLAN_CREDITS,
            Err(e) => {
                warn!(plan_id = %plan_id, error = %e, "Store fallback failed, using default");
                *DEFAULT_PLAN_CREDITS
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryQuotaCache;
    use crate::models::{UpsertFeatureCost, UpsertPricingRule};
    use crate::store::MemoryStore;
    use std::str::FromStr;

    fn cache() -> QuotaCache {
        QuotaCache::new(Arc::new(MemoryQuotaCache::new()))
    }

    fn key(s: &str) -> FeatureKey {
        FeatureKey::from_str(s).unwrap()
    }

    #[tokio::test]
    async fn uninitialized_lookups_return_defaults() {
        let cache = cache();
        assert_eq!(cache.state(), CacheState::Uninitialized);
        assert_eq!(
            cache.get_feature_cost(&key("api.job_match")).await,
            *DEFAULT_FEATURE_COST
        );
        assert_eq!(cache.get_plan_multiplier(None).await, *DEFAULT_PLAN_MULTIPLIER);
        assert_eq!(
            cache.get_plan_rate_limit(Some(Uuid::new_v4())).await,
            Some(DEFAULT_RATE_LIMIT_PER_MINUTE)
        );
    }

    #[tokio::test]
    async fn init_hydrates_and_is_reentrant() {
        let store = MemoryStore::new();
        store
            .upsert_feature_cost(&UpsertFeatureCost {
                feature_key: key("api.job_match"),
                internal_cost_credits: Decimal::new(250, 2),
            })
            .await
            .unwrap();
        let plan_id = Uuid::new_v4();
        store
            .upsert_pricing_rule(&UpsertPricingRule {
                plan_id,
                multiplier: Decimal::new(200, 2),
                credits_allocation: Decimal::new(100_000, 2),
                rate_limit_per_minute: Some(5),
                rate_limit_per_day: None,
            })
            .await
            .unwrap();

        let cache = cache();
        cache.init(&store).await.unwrap();
        assert!(cache.is_initialized());

        assert_eq!(
            cache.get_feature_cost(&key("api.job_match")).await,
            Decimal::new(250, 2)
        );
        assert_eq!(cache.get_plan_rate_limit(Some(plan_id)).await, Some(5));
        // Nullable day limit maps to unlimited
        assert_eq!(cache.get_plan_rate_day_limit(Some(plan_id)).await, None);

        // Second init is a no-op
        cache.init(&store).await.unwrap();
        assert!(cache.is_initialized());
    }

    #[tokio::test]
    async fn billable_cost_multiplies_cost_and_multiplier() {
        let cache = cache();
        // All defaults: 6.0 * 3.0
        assert_eq!(
            cache.calculate_billable_cost(&key("api.job_match"), None).await,
            Decimal::new(1800, 2)
        );
    }

    #[tokio::test]
    async fn apply_change_updates_and_removes() {
        let store = MemoryStore::new();
        let cache = cache();
        cache.init(&store).await.unwrap();

        let feature = key("career.extract_keywords");
        cache
            .apply_change(&QuotaChange::FeatureCost {
                feature_key: feature.clone(),
                internal_cost_credits: Decimal::new(900, 2),
                is_deleted: false,
            })
            .await
            .unwrap();
        assert_eq!(cache.get_feature_cost(&feature).await, Decimal::new(900, 2));

        // Soft-delete removes the entry; lookups fall back to the default
        cache
            .apply_change(&QuotaChange::FeatureCost {
                feature_key: feature.clone(),
                internal_cost_credits: Decimal::new(900, 2),
                is_deleted: true,
            })
            .await
            .unwrap();
        assert_eq!(cache.get_feature_cost(&feature).await, *DEFAULT_FEATURE_COST);

        let plan_id = Uuid::new_v4();
        cache
            .apply_change(&QuotaChange::PricingRule {
                plan_id,
                multiplier: Decimal::ONE,
                credits_allocation: Decimal::new(50_000, 2),
                rate_limit_per_minute: Some(3),
                rate_limit_per_day: Some(10),
                is_deleted: false,
            })
            .await
            .unwrap();
        assert_eq!(cache.get_plan_rate_limit(Some(plan_id)).await, Some(3));

        cache
            .apply_change(&QuotaChange::PricingRuleRemoved { plan_id })
            .await
            .unwrap();
        assert_eq!(
            cache.get_plan_rate_limit(Some(plan_id)).await,
            Some(DEFAULT_RATE_LIMIT_PER_MINUTE)
        );
    }

    #[tokio::test]
    async fn refresh_rehydrates_from_store() {
        let store = MemoryStore::new();
        let cache = cache();
        cache.init(&store).await.unwrap();

        let feature = key("api.analyze");
        store
            .upsert_feature_cost(&UpsertFeatureCost {
                feature_key: feature.clone(),
                internal_cost_credits: Decimal::new(1200, 2),
            })
            .await
            .unwrap();
        // Not visible until refresh
        assert_eq!(cache.get_feature_cost(&feature).await, *DEFAULT_FEATURE_COST);

        cache.refresh(&store).await.unwrap();
        assert!(cache.is_initialized());
        assert_eq!(cache.get_feature_cost(&feature).await, Decimal::new(1200, 2));
    }

    #[tokio::test]
    async fn credits_fallback_reads_store_and_repopulates() {
        let store = MemoryStore::new();
        let plan_id = Uuid::new_v4();
        store
            .upsert_pricing_rule(&UpsertPricingRule {
                plan_id,
                multiplier: Decimal::ONE,
                credits_allocation: Decimal::new(777_00, 2),
                rate_limit_per_minute: None,
                rate_limit_per_day: None,
            })
            .await
            .unwrap();

        let cache = cache();
        // Cache miss -> store value, cache repopulated
        assert_eq!(
            cache
                .get_plan_credits_allocation_with_fallback(&store, Some(plan_id))
                .await,
            Decimal::new(777_00, 2)
        );
        assert_eq!(
            cache.get_plan_credits_allocation(Some(plan_id)).await,
            Decimal::new(777_00, 2)
        );

        // Unknown plan -> default
        assert_eq!(
            cache
                .get_plan_credits_allocation_with_fallback(&store, Some(Uuid::new_v4()))
                .await,
            *DEFAULT_PLAN_CREDITS
        );
    }
}
