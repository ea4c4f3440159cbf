//! Domain models for metering-service.

mod billing;
mod feature;
mod pricing;
mod usage;

pub use billing::{BillingContext, compute_billing_period};
pub use feature::{FeatureCostConfig, FeatureKey, ProductType, UpsertFeatureCost};
pub use pricing::{PlanPricingRule, QuotaChange, UpsertPricingRule};
pub use usage::{
    AccessStatus, CreateUsageLog, FailureDetails, FailureType, UsageLog, UsageLogStatus,
    UsageMetrics,
};
