//! Services for metering-service.

mod database;
mod enforcer;
mod fingerprint;
pub mod metrics;
mod redis;

pub use database::Database;
pub use enforcer::{CommitOutcome, QuotaEnforcer, ValidateUsage, ValidationOutcome};
pub use fingerprint::create_request_fingerprint;
pub use metrics::{get_metrics, init_metrics};
pub use redis::RedisHandle;
