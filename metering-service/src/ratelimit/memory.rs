//! In-memory fixed-window backend.

use crate::ratelimit::{RateLimitBackend, RateLimitResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use metering_core::error::AppError;
use tracing::{debug, warn};

/// Per-key `(count, reset_at)` window state. Single-instance only;
/// counters are lost on restart.
#[derive(Default)]
pub struct MemoryRateLimit {
    store: DashMap<String, (i64, DateTime<Utc>)>,
}

impl MemoryRateLimit {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitBackend for MemoryRateLimit {
    async fn check(&self, key: &str, limit: i64, window: i64) -> Result<RateLimitResult, AppError> {
        let now = Utc::now();

        let mut entry = self
            .store
            .entry(key.to_string())
            .or_insert((0, now + Duration::seconds(window)));
        let (count, reset_at) = *entry;

        // Window expired: restart the count
        if count > 0 && now >= reset_at {
            let reset_at = now + Duration::seconds(window);
            *entry = (1, reset_at);
            debug!(key = %key, "Rate limit window reset");
            return Ok(RateLimitResult {
                allowed: true,
                remaining: limit - 1,
                limit,
                reset_at,
                retry_after: None,
            });
        }

        if count >= limit {
            let retry_after = (reset_at - now).num_seconds().max(1);
            warn!(key = %key, retry_after = retry_after, "Rate limit exceeded");
            return Ok(RateLimitResult {
                allowed: false,
                remaining: 0,
                limit,
                reset_at,
                retry_after: Some(retry_after),
            });
        }

        *entry = (count + 1, reset_at);
        Ok(RateLimitResult {
            allowed: true,
            remaining: limit - count - 1,
            limit,
            reset_at,
            retry_after: None,
        })
    }

    async fn reset(&self, key: &str) -> Result<(), AppError> {
        self.store.remove(key);
        Ok(())
    }

    async fn get_remaining(&self, key: &str, limit: i64, _window: i64) -> Result<i64, AppError> {
        let Some(entry) = self.store.get(key) else {
            return Ok(limit);
        };
        let (count, reset_at) = *entry;
        if Utc::now() >= reset_at {
            return Ok(limit);
        }
        Ok((limit - count).max(0))
    }
}
