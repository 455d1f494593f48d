//! Tradepost - authenticated sessions for a marketplace backend

use anyhow::Result;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tradepost::{
    api::{self, AppState},
    cache::create_cache,
    config::Config,
    db,
    services::{AccountService, SessionManager},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradepost=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Tradepost...");

    // Load configuration
    let config = Config::load_with_env(Path::new("config.yml"))?;
    tracing::info!("Configuration loaded");

    // Initialize database
    let pool = db::create_pool(&config.database).await?;
    tracing::info!("Database connected: {:?}", config.database.driver);

    // Run migrations
    let applied = db::migrations::run_migrations(&pool).await?;
    tracing::info!(applied, "Database migrations completed");

    // Initialize cache
    let cache = create_cache(&config.cache).await?;
    match &cache {
        Some(_) => tracing::info!("Cache initialized: {:?}", config.cache.driver),
        None => tracing::warn!("Cache disabled, sessions are served from the database only"),
    }
    if !config.rate_limit.fail_open {
        tracing::info!("Rate limiter fails closed when the counter store is unreachable");
    }

    let cleanup_interval = Duration::from_secs(config.session.cleanup_interval_seconds);
    let addr = format!("{}:{}", config.server.host, config.server.port);

    // Build application state
    let state = AppState::new(config, pool, cache);

    // Expired session and reset token sweep
    spawn_cleanup(state.sessions.clone(), state.accounts.clone(), cleanup_interval);
    let pool = state.pool.clone();

    // Build router
    let app = api::build_router(state)?;

    // Start server
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on http://{}", addr);

    // Peer addresses key the per-IP rate limits
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    pool.close().await;
    tracing::info!("Server stopped");
    Ok(())
}

fn spawn_cleanup(sessions: Arc<SessionManager>, accounts: Arc<AccountService>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            if let Err(e) = sessions.cleanup().await {
                tracing::warn!(error = %e, "Session cleanup failed");
            }
            if let Err(e) = accounts.cleanup_expired_resets().await {
                tracing::warn!(error = %e, "Password reset cleanup failed");
            }
        }
    });
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
