//! Shared Redis connection handle.

use metering_core::error::AppError;
use redis::{Client, aio::ConnectionManager};

/// Thin wrapper over a reconnecting Redis connection, exposing the
/// handful of commands the cache and rate-limit backends use.
#[derive(Clone)]
pub struct RedisHandle {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisHandle {
    pub async fn connect(url: &str) -> Result<Self, AppError> {
        tracing::info!(url = %url, "Connecting to Redis");
        let client = Client::open(url)?;

        // ConnectionManager reconnects automatically
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to get Redis connection manager");
            e
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }

    pub async fn ping(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        Ok(redis::cmd("PING").query_async(&mut conn).await?)
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        Ok(redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?)
    }

    pub async fn del(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        Ok(redis::cmd("DEL").arg(key).query_async(&mut conn).await?)
    }

    pub async fn incr(&self, key: &str) -> Result<i64, AppError> {
        let mut conn = self.manager.clone();
        let count: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }

    pub async fn expire(&self, key: &str, seconds: i64) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        Ok(redis::cmd("EXPIRE")
            .arg(key)
            .arg(seconds)
            .query_async(&mut conn)
            .await?)
    }

    pub async fn ttl(&self, key: &str) -> Result<i64, AppError> {
        let mut conn = self.manager.clone();
        let ttl: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        Ok(ttl)
    }

    /// SCAN-based pattern delete. Safe but potentially slow on large
    /// keyspaces; only used for full cache clears.
    pub async fn delete_pattern(&self, pattern: &str) -> Result<u64, AppError> {
        let mut conn = self.manager.clone();
        let mut cursor: u64 = 0;
        let mut deleted = 0u64;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let removed: u64 = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await?;
                deleted += removed;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(deleted)
    }
}
