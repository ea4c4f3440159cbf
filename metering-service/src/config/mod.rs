use metering_core::config as core_config;
use metering_core::error::AppError;
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct MeteringConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub cache: CacheConfig,
    pub sweep: SweepConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub backend: CacheBackendKind,
}

/// Backing store for the quota cache and rate limit counters. Memory is
/// single-instance only; multi-instance deployments need Redis so all
/// instances share counters.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Memory,
    Redis,
}

/// Background sweep of stale PENDING reservations.
#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    /// A PENDING row older than this is considered abandoned.
    pub pending_timeout_minutes: i64,
    pub interval_seconds: u64,
}

impl MeteringConfig {
    pub fn load() -> Result<Self, AppError> {
        // Common config handles .env, the APP__ prefix and ENVIRONMENT
        let common = core_config::Config::load()?;
        let is_prod = common.is_prod();

        let config = MeteringConfig {
            common,
            service_name: get_env("SERVICE_NAME", Some("metering-service"), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", Some("postgres://localhost/metering"), is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", Some("10"), is_prod)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", Some("1"), is_prod)?,
            },
            redis: RedisConfig {
                url: get_env("REDIS_URL", Some("redis://localhost:6379"), is_prod)?,
            },
            cache: CacheConfig {
                backend: get_env("CACHE_BACKEND", Some("redis"), is_prod)?
                    .parse()
                    .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?,
            },
            sweep: SweepConfig {
                pending_timeout_minutes: parse_env("SWEEP_PENDING_TIMEOUT_MINUTES", Some("30"), is_prod)?,
                interval_seconds: parse_env("SWEEP_INTERVAL_SECONDS", Some("300"), is_prod)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.sweep.pending_timeout_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SWEEP_PENDING_TIMEOUT_MINUTES must be positive"
            )));
        }
        if self.sweep.interval_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SWEEP_INTERVAL_SECONDS must be positive"
            )));
        }
        if self.database.max_connections == 0
            || self.database.min_connections > self.database.max_connections
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DATABASE_MIN_CONNECTIONS must be <= DATABASE_MAX_CONNECTIONS and max must be positive"
            )));
        }
        Ok(())
    }
}

impl std::str::FromStr for CacheBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(CacheBackendKind::Memory),
            "redis" => Ok(CacheBackendKind::Redis),
            _ => Err(format!("Invalid cache backend: {}", s)),
        }
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T: std::str::FromStr>(
    key: &str,
    default: Option<&str>,
    is_prod: bool,
) -> Result<T, AppError>
where
    T::Err: std::fmt::Display,
{
    get_env(key, default, is_prod)?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}
