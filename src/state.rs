use std::sync::Arc;

use crate::{
    auth::jwt::JwtService,
    config::AppConfig,
    db::{PgPool, PgPooledConnection},
    error::{AppError, AppResult},
    notify::Notifier,
    rate_limit::RateLimiter,
    storage::ObjectStorage,
};

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub storage: Arc<dyn ObjectStorage>,
    pub jwt: JwtService,
    pub limiter: Arc<RateLimiter>,
    pub notifier: Arc<dyn Notifier>,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: AppConfig,
        storage: Arc<dyn ObjectStorage>,
        jwt: JwtService,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit_per_minute));
        Self {
            pool,
            config: Arc::new(config),
            storage,
            jwt,
            limiter,
            notifier,
        }
    }

    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }
}
