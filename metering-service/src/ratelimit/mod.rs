//! Fixed-window rate limiting with pluggable backends.

mod memory;
mod redis;

pub use memory::MemoryRateLimit;
pub use redis::RedisRateLimit;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metering_core::error::AppError;
use std::sync::Arc;

/// Outcome of one rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: i64,
    pub limit: i64,
    pub reset_at: DateTime<Utc>,
    /// Seconds until the caller may retry; set only when denied.
    pub retry_after: Option<i64>,
}

/// Counter store behind the limiter. `check` both counts the request
/// and decides; limits and windows are validated by callers when they
/// are configured, not here.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    async fn check(&self, key: &str, limit: i64, window: i64) -> Result<RateLimitResult, AppError>;
    async fn reset(&self, key: &str) -> Result<(), AppError>;
    async fn get_remaining(&self, key: &str, limit: i64, window: i64) -> Result<i64, AppError>;
}

/// What a rate limit key is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    Ip,
    User,
    Email,
    Endpoint,
    Plan,
}

impl RateLimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitScope::Ip => "ip",
            RateLimitScope::User => "user",
            RateLimitScope::Email => "email",
            RateLimitScope::Endpoint => "endpoint",
            RateLimitScope::Plan => "plan",
        }
    }
}

/// Deterministic, namespaced key: `rate_limit:{scope}:{identifier}:{bucket}`.
pub fn format_rate_limit_key(scope: RateLimitScope, identifier: &str, bucket: &str) -> String {
    format!("rate_limit:{}:{}:{}", scope.as_str(), identifier, bucket)
}

/// Facade over a backend shared by all callers.
#[derive(Clone)]
pub struct RateLimiter {
    backend: Arc<dyn RateLimitBackend>,
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn RateLimitBackend>) -> Self {
        Self { backend }
    }

    pub async fn check(
        &self,
        key: &str,
        limit: i64,
        window: i64,
    ) -> Result<RateLimitResult, AppError> {
        self.backend.check(key, limit, window).await
    }

    pub async fn reset(&self, key: &str) -> Result<(), AppError> {
        self.backend.reset(key).await
    }

    pub async fn get_remaining(
        &self,
        key: &str,
        limit: i64,
        window: i64,
    ) -> Result<i64, AppError> {
        self.backend.get_remaining(key, limit, window).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_deterministic_and_namespaced() {
        assert_eq!(
            format_rate_limit_key(RateLimitScope::Ip, "192.168.1.1", "/api/test"),
            "rate_limit:ip:192.168.1.1:/api/test"
        );
        assert_eq!(
            format_rate_limit_key(RateLimitScope::Plan, "owner-1", "minute"),
            "rate_limit:plan:owner-1:minute"
        );
        // Same inputs, same key
        assert_eq!(
            format_rate_limit_key(RateLimitScope::User, "u1", "/x"),
            format_rate_limit_key(RateLimitScope::User, "u1", "/x"),
        );
    }
}
