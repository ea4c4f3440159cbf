use crate::cache::{MemoryQuotaCache, QuotaCache, QuotaCacheBackend, RedisQuotaCache};
use crate::config::{CacheBackendKind, MeteringConfig, SweepConfig};
use crate::handlers;
use crate::ratelimit::{MemoryRateLimit, RateLimitBackend, RateLimiter, RedisRateLimit};
use crate::services::{Database, QuotaEnforcer, RedisHandle};
use crate::store::QuotaStore;
use axum::{
    routing::{delete, get, post, put},
    Router,
};
use chrono::Utc;
use metering_core::error::AppError;
use metering_core::middleware::metrics::metrics_middleware;
use metering_core::middleware::tracing::request_id_middleware;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn QuotaStore>,
    pub cache: Arc<QuotaCache>,
    pub enforcer: Arc<QuotaEnforcer>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .route("/internal/usage/validate", post(handlers::validate_usage))
        .route("/internal/usage/commit", post(handlers::commit_usage))
        .route("/admin/feature-costs", put(handlers::upsert_feature_cost))
        .route(
            "/admin/feature-costs/:feature_key",
            delete(handlers::delete_feature_cost),
        )
        .route("/admin/pricing-rules", put(handlers::upsert_pricing_rule))
        .route(
            "/admin/pricing-rules/:plan_id",
            delete(handlers::delete_pricing_rule),
        )
        .route("/admin/cache/refresh", post(handlers::refresh_cache))
        .layer(axum::middleware::from_fn(metrics_middleware))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Periodic sweep of abandoned PENDING reservations.
pub fn spawn_expiry_sweep(enforcer: Arc<QuotaEnforcer>, sweep: SweepConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(sweep.interval_seconds));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let cutoff = Utc::now() - chrono::Duration::minutes(sweep.pending_timeout_minutes);
            if let Err(e) = enforcer.expire_pending(cutoff).await {
                tracing::error!(error = %e, "Pending reservation sweep failed");
            }
        }
    })
}

pub struct Application {
    port: u16,
    server: Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + Unpin>,
    state: AppState,
}

impl Application {
    pub async fn build(config: MeteringConfig) -> Result<Self, AppError> {
        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to PostgreSQL: {}", e);
            e
        })?;
        db.run_migrations().await.map_err(|e| {
            tracing::error!("Failed to run migrations: {}", e);
            e
        })?;
        let store: Arc<dyn QuotaStore> = Arc::new(db);

        let (cache_backend, limit_backend): (Arc<dyn QuotaCacheBackend>, Arc<dyn RateLimitBackend>) =
            match config.cache.backend {
                CacheBackendKind::Memory => (
                    Arc::new(MemoryQuotaCache::new()),
                    Arc::new(MemoryRateLimit::new()),
                ),
                CacheBackendKind::Redis => {
                    let redis = RedisHandle::connect(&config.redis.url).await.map_err(|e| {
                        tracing::error!("Failed to connect to Redis: {}", e);
                        e
                    })?;
                    (
                        Arc::new(RedisQuotaCache::new(redis.clone())),
                        Arc::new(RedisRateLimit::new(redis)),
                    )
                }
            };

        let cache = Arc::new(QuotaCache::new(cache_backend));
        cache.init(store.as_ref()).await?;

        let limiter = RateLimiter::new(limit_backend);
        let enforcer = Arc::new(QuotaEnforcer::new(store.clone(), cache.clone(), limiter));

        spawn_expiry_sweep(enforcer.clone(), config.sweep.clone());

        let state = AppState {
            store,
            cache,
            enforcer,
        };
        let app = build_router(state.clone());

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Listening on {}", port);

        let server = axum::serve(listener, app);

        Ok(Self {
            port,
            server: Box::new(server.into_future()),
            state,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.server.await
    }
}
