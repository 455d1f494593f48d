//! Authentication API endpoints
//!
//! Handles HTTP requests for accounts and sessions:
//! - POST /api/v1/auth/signup - Account registration
//! - POST /api/v1/auth/login - Login, sets the session cookie
//! - POST /api/v1/auth/logout - Revoke the current session
//! - GET /api/v1/auth/me - Get current user
//! - GET /api/v1/auth/sessions - List live sessions
//! - DELETE /api/v1/auth/sessions - Revoke every session
//! - POST /api/v1/auth/password-reset - Request a reset token
//! - POST /api/v1/auth/password-reset/confirm - Redeem a reset token

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::middleware::{ApiError, AppState, AuthenticatedUser, ClientAddress};
use crate::config::{CookieConfig, SameSite};
use crate::models::{Session, User};
use crate::services::token::fingerprint;
use crate::services::{AuthError, ClientInfo, FormSignals};

/// Request body for account registration
#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    #[serde(flatten)]
    pub signals: FormSignals,
}

/// Request body for login
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    #[serde(flatten)]
    pub signals: FormSignals,
}

/// Request body for starting a password reset
#[derive(Debug, Deserialize)]
pub struct PasswordResetRequest {
    pub email: String,
    #[serde(flatten)]
    pub signals: FormSignals,
}

/// Request body for redeeming a reset token
#[derive(Debug, Deserialize)]
pub struct PasswordResetConfirmRequest {
    pub token: String,
    pub password: String,
}

/// Response for successful authentication
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub user: UserResponse,
    pub token: String,
    pub expires_at: String,
}

/// Response for user info
#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: i64,
    pub email: String,
    pub is_active: bool,
    pub last_login_at: Option<String>,
    pub created_at: String,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            is_active: user.is_active,
            last_login_at: user.last_login_at.map(|t| t.to_rfc3339()),
            created_at: user.created_at.to_rfc3339(),
        }
    }
}

/// One live session, identified by fingerprint rather than token
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub id: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: String,
    pub expires_at: String,
    pub current: bool,
}

impl SessionResponse {
    fn new(session: Session, current_token: &str) -> Self {
        Self {
            id: fingerprint(&session.id),
            current: session.id == current_token,
            ip_address: session.ip_address,
            user_agent: session.user_agent,
            created_at: session.created_at.to_rfc3339(),
            expires_at: session.expires_at.to_rfc3339(),
        }
    }
}

/// Build protected auth routes (requires auth middleware)
pub fn protected_router() -> Router<AppState> {
    Router::new()
        .route("/logout", post(logout))
        .route("/me", get(get_current_user))
        .route("/sessions", get(list_sessions).delete(revoke_all_sessions))
}

/// Build public auth routes (no auth required)
pub fn public_router() -> Router<AppState> {
    Router::new()
        .route("/signup", post(signup))
        .route("/login", post(login))
        .route("/password-reset", post(request_password_reset))
        .route("/password-reset/confirm", post(confirm_password_reset))
}

/// POST /api/v1/auth/signup - Account registration
///
/// The account starts inactive; no session is issued.
async fn signup(
    State(state): State<AppState>,
    ClientAddress(ip_address): ClientAddress,
    Json(body): Json<SignupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state
        .accounts
        .register(
            &body.email,
            &body.password,
            &body.signals,
            ip_address.as_deref(),
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "user": UserResponse::from(user) })),
    ))
}

/// POST /api/v1/auth/login - Login
///
/// Anti-bot checks run before the login guard sees the credentials.
async fn login(
    State(state): State<AppState>,
    ClientAddress(ip_address): ClientAddress,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if let Err(reason) = state.forms.check(&body.signals, state.sessions.now()) {
        tracing::info!(form = "login", reason = %reason, "Rejected automated submission");
        return Err(AuthError::from(reason).into());
    }

    let client = ClientInfo {
        ip_address,
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .map(String::from),
    };

    let (user, session) = state
        .login_guard
        .login(&body.email, &body.password, client)
        .await?;

    let cookie = session_cookie(
        &state.config.cookie,
        &session.id,
        state.config.session.max_age_seconds(),
    );

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::SET_COOKIE, header_value(&cookie)?);

    Ok((
        response_headers,
        Json(AuthResponse {
            user: user.into(),
            expires_at: session.expires_at.to_rfc3339(),
            token: session.id,
        }),
    ))
}

/// POST /api/v1/auth/logout - Revoke the current session
async fn logout(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
) -> Result<impl IntoResponse, ApiError> {
    state.login_guard.logout(&auth.session.id).await?;

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::SET_COOKIE,
        header_value(&clear_cookie(&state.config.cookie))?,
    );

    Ok((StatusCode::NO_CONTENT, response_headers))
}

/// GET /api/v1/auth/me - Get current user
async fn get_current_user(auth: AuthenticatedUser) -> Json<UserResponse> {
    Json(auth.user.into())
}

/// GET /api/v1/auth/sessions - Live sessions of the current user, newest first
async fn list_sessions(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, ApiError> {
    let sessions: Vec<SessionResponse> = state
        .sessions
        .list_active(auth.user.id)
        .await?
        .into_iter()
        .map(|s| SessionResponse::new(s, &auth.session.id))
        .collect();

    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

/// DELETE /api/v1/auth/sessions - Sign out everywhere
async fn revoke_all_sessions(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
) -> Result<impl IntoResponse, ApiError> {
    let report = state.sessions.revoke_all(auth.user.id).await?;

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::SET_COOKIE,
        header_value(&clear_cookie(&state.config.cookie))?,
    );

    Ok((response_headers, Json(report)))
}

/// POST /api/v1/auth/password-reset - Request a reset token
///
/// Answers the same way whether or not the email is registered.
async fn request_password_reset(
    State(state): State<AppState>,
    Json(body): Json<PasswordResetRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .accounts
        .request_password_reset(&body.email, &body.signals)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "message": "If the address is registered, reset instructions have been sent"
        })),
    ))
}

/// POST /api/v1/auth/password-reset/confirm - Redeem a reset token
async fn confirm_password_reset(
    State(state): State<AppState>,
    Json(body): Json<PasswordResetConfirmRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state
        .accounts
        .confirm_password_reset(&body.token, &body.password)
        .await?;

    Ok(Json(serde_json::json!({ "revoked_sessions": report.revoked })))
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Render the session cookie
pub fn session_cookie(config: &CookieConfig, token: &str, max_age: i64) -> String {
    let mut cookie = format!("{}={}; Path=/", config.name, token);

    if config.http_only {
        cookie.push_str("; HttpOnly");
    }
    // Browsers drop SameSite=None cookies that are not Secure
    if config.secure || config.same_site == SameSite::None {
        cookie.push_str("; Secure");
    }
    cookie.push_str("; SameSite=");
    cookie.push_str(config.same_site.as_str());
    if let Some(domain) = &config.domain {
        cookie.push_str("; Domain=");
        cookie.push_str(domain);
    }
    cookie.push_str(&format!("; Max-Age={}", max_age));

    cookie
}

/// Render a cookie that clears the session cookie
pub fn clear_cookie(config: &CookieConfig) -> String {
    session_cookie(config, "", 0)
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|e| {
        tracing::error!(error = %e, "Invalid Set-Cookie value");
        ApiError::internal_error("Failed to build session cookie")
    })
}
