pub mod admin;
pub mod usage;

pub use admin::{
    CacheRefreshResponse, FeatureCostRequest, FeatureCostResponse, PricingRuleRequest,
    PricingRuleResponse,
};
pub use usage::{
    UsageCommitRequest, UsageCommitResponse, UsageValidateRequest, UsageValidateResponse,
};
