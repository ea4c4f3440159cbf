//! Redis fixed-window backend.

use crate::ratelimit::{RateLimitBackend, RateLimitResult};
use crate::services::RedisHandle;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use metering_core::error::AppError;
use tracing::warn;

/// Shared counters for multi-instance deployments: INCR, EXPIRE on the
/// first hit, TTL for the reset time. Fails open when Redis is
/// unreachable — a metering outage must not take request traffic down
/// with it.
#[derive(Clone)]
pub struct RedisRateLimit {
    redis: RedisHandle,
}

impl RedisRateLimit {
    pub fn new(redis: RedisHandle) -> Self {
        Self { redis }
    }

    fn fail_open(&self, key: &str, limit: i64, window: i64, err: &AppError) -> RateLimitResult {
        warn!(key = %key, error = %err, "Redis error during rate limit check, allowing request");
        RateLimitResult {
            allowed: true,
            remaining: limit - 1,
            limit,
            reset_at: Utc::now() + Duration::seconds(window),
            retry_after: None,
        }
    }
}

#[async_trait]
impl RateLimitBackend for RedisRateLimit {
    async fn check(&self, key: &str, limit: i64, window: i64) -> Result<RateLimitResult, AppError> {
        let now = Utc::now();

        let count = match self.redis.incr(key).await {
            Ok(count) => count,
            Err(e) => return Ok(self.fail_open(key, limit, window, &e)),
        };

        if count == 1 {
            if let Err(e) = self.redis.expire(key, window).await {
                return Ok(self.fail_open(key, limit, window, &e));
            }
        }

        let ttl = match self.redis.ttl(key).await {
            Ok(ttl) if ttl >= 0 => ttl,
            Ok(_) => window,
            Err(e) => return Ok(self.fail_open(key, limit, window, &e)),
        };
        let reset_at = now + Duration::seconds(ttl);

        if count > limit {
            warn!(key = %key, count = count, retry_after = ttl, "Rate limit exceeded");
            return Ok(RateLimitResult {
                allowed: false,
                remaining: 0,
                limit,
                reset_at,
                retry_after: Some(ttl.max(1)),
            });
        }

        Ok(RateLimitResult {
            allowed: true,
            remaining: limit - count,
            limit,
            reset_at,
            retry_after: None,
        })
    }

    async fn reset(&self, key: &str) -> Result<(), AppError> {
        self.redis.del(key).await
    }

    async fn get_remaining(&self, key: &str, limit: i64, _window: i64) -> Result<i64, AppError> {
        let value = match self.redis.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Redis error reading rate limit counter");
                return Ok(limit);
            }
        };
        match value.and_then(|v| v.parse::<i64>().ok()) {
            Some(count) => Ok((limit - count).max(0)),
            None => Ok(limit),
        }
    }
}
