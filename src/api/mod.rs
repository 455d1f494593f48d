//! API layer - HTTP handlers and routing
//!
//! This module contains all HTTP API endpoints for Tradepost.
//! It includes:
//! - Auth and session endpoints
//! - Contact form endpoint
//! - Health check

pub mod auth;
pub mod contact;
pub mod middleware;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, HeaderValue, Method},
    middleware as axum_middleware,
    routing::{get, post},
    Json, Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use middleware::{ApiError, AppState, AuthenticatedUser};

/// Build the main API router
pub fn build_api_router(state: AppState) -> Router<AppState> {
    // Protected routes (need a live session)
    let protected_routes = Router::new()
        .nest("/auth", auth::protected_router())
        .route_layer(axum_middleware::from_fn_with_state(
            state,
            middleware::require_auth,
        ));

    // Public routes
    Router::new()
        .route("/health", get(health))
        .nest("/auth", auth::public_router())
        .route("/contact", post(contact::submit))
        .merge(protected_routes)
}

/// Build the complete router with middleware
pub fn build_router(state: AppState) -> Result<Router> {
    let origin = state
        .config
        .server
        .cors_origin
        .parse::<HeaderValue>()
        .context("Invalid server.cors_origin")?;

    // Cookie auth needs credentials and an explicit origin
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::COOKIE])
        .allow_credentials(true);

    Ok(Router::new()
        .nest("/api/v1", build_api_router(state.clone()))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

/// GET /api/v1/health
///
/// Pings the database under the store timeout; 503 when it does not answer.
async fn health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let ping = tokio::time::timeout(state.config.session.store_timeout(), state.pool.ping()).await;

    match ping {
        Ok(Ok(())) => Ok(Json(serde_json::json!({ "status": "ok", "database": "ok" }))),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Health check: database ping failed");
            Err(ApiError::service_unavailable("Database unavailable"))
        }
        Err(_) => {
            tracing::error!("Health check: database ping timed out");
            Err(ApiError::service_unavailable("Database unavailable"))
        }
    }
}
