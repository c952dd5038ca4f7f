use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{net::TcpListener, signal};
use tracing_subscriber::EnvFilter;

use grantdesk::{
    auth::jwt::JwtService,
    config::AppConfig,
    db,
    notify::{LogNotifier, Notifier},
    rate_limit::RateLimiter,
    routes,
    state::AppState,
    storage::{LocalStorage, ObjectStorage},
};

const LIMITER_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "api",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        upload_dir = %config.upload_dir.display(),
        rate_limit_per_minute = config.rate_limit_per_minute,
        "loaded configuration"
    );

    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    if config.run_migrations {
        let migration_pool = pool.clone();
        let applied = tokio::task::spawn_blocking(move || db::run_migrations(&migration_pool))
            .await
            .context("migration task panicked")??;
        tracing::info!(applied, "database migrations applied");
    }

    let storage: Arc<dyn ObjectStorage> = Arc::new(LocalStorage::new(config.upload_dir.clone())?);
    let jwt = JwtService::from_config(&config)?;
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port)
        .parse()
        .context("SERVER_HOST and SERVER_PORT must form a socket address")?;

    let state = AppState::new(pool, config, storage, jwt, notifier);
    spawn_limiter_cleanup(state.limiter.clone());

    let app = routes::create_router(state);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    Ok(())
}

fn spawn_limiter_cleanup(limiter: Arc<RateLimiter>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(LIMITER_CLEANUP_INTERVAL);
        loop {
            ticker.tick().await;
            let removed = limiter.cleanup();
            if removed > 0 {
                tracing::debug!(removed, tracked = limiter.tracked_clients(), "rate limiter cleanup");
            }
        }
    });
}

async fn shutdown_signal() {
    if signal::ctrl_c().await.is_ok() {
        tracing::info!("received shutdown signal");
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
