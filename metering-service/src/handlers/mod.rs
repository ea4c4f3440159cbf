pub mod admin;
pub mod health;
pub mod usage;

pub use admin::{
    delete_feature_cost, delete_pricing_rule, refresh_cache, upsert_feature_cost,
    upsert_pricing_rule,
};
pub use health::{health_check, metrics_endpoint, readiness_check};
pub use usage::{commit_usage, validate_usage};
