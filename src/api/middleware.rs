//! API middleware
//!
//! Contains:
//! - Shared application state
//! - The JSON error envelope and its mapping from service errors
//! - Client address resolution
//! - Authentication (session token validation)

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::cache::SharedCache;
use crate::config::{Config, ServerConfig};
use crate::db::repositories::{SqlxPasswordResetRepository, SqlxSessionRepository, SqlxUserRepository};
use crate::db::DynDatabasePool;
use crate::models::{Session, User};
use crate::services::{
    AccountService, AuthError, FormGuard, LoginGuard, RateLimiter, SessionError, SessionManager,
    SystemClock,
};

/// Application state containing shared services
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: DynDatabasePool,
    pub sessions: Arc<SessionManager>,
    pub limiter: Arc<RateLimiter>,
    pub login_guard: Arc<LoginGuard>,
    pub accounts: Arc<AccountService>,
    pub forms: FormGuard,
}

impl AppState {
    /// Wire every service from configuration and the two stores.
    pub fn new(config: Config, pool: DynDatabasePool, cache: Option<SharedCache>) -> Self {
        let users = SqlxUserRepository::boxed(pool.clone());
        let forms = FormGuard::new(&config.anti_bot);

        let sessions = Arc::new(SessionManager::new(
            SqlxSessionRepository::boxed(pool.clone()),
            cache.clone(),
            Arc::new(SystemClock),
            config.session.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(
            cache,
            config.rate_limit.clone(),
            config.session.cache_timeout(),
        ));
        let login_guard = Arc::new(LoginGuard::new(
            users.clone(),
            sessions.clone(),
            limiter.clone(),
            config.login.clone(),
        ));
        let accounts = Arc::new(AccountService::new(
            users,
            SqlxPasswordResetRepository::boxed(pool.clone()),
            sessions.clone(),
            limiter.clone(),
            forms.clone(),
            config.password_reset.clone(),
        ));

        Self {
            config: Arc::new(config),
            pool,
            sessions,
            limiter,
            login_guard,
            accounts,
            forms,
        }
    }
}

/// Authenticated user and the session that proved it
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user: User,
    pub session: Session,
}

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedUser>()
            .cloned()
            .ok_or_else(|| ApiError::unauthorized("Authentication required"))
    }
}

/// Address of the client behind a request
///
/// The socket peer, unless the peer is a configured trusted proxy, in which
/// case the forwarding headers name the client. `None` only when the server
/// was started without connection info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAddress(pub Option<String>);

impl FromRequestParts<AppState> for ClientAddress {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = ConnectInfo::<SocketAddr>::from_request_parts(parts, state)
            .await
            .ok()
            .map(|ConnectInfo(addr)| addr.ip());

        Ok(Self(
            resolve_client_ip(peer, &parts.headers, &state.config.server).map(|ip| ip.to_string()),
        ))
    }
}

/// Pick the client IP for a request arriving from `peer`.
///
/// Forwarding headers are ignored unless `peer` is a trusted proxy. In
/// `X-Forwarded-For` the rightmost address that is not itself a trusted
/// proxy wins, since everything left of it is client supplied.
pub fn resolve_client_ip(
    peer: Option<IpAddr>,
    headers: &HeaderMap,
    server: &ServerConfig,
) -> Option<IpAddr> {
    let peer = peer?;
    if !server.is_trusted_proxy(peer) {
        return Some(peer);
    }

    let forwarded = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|ip| ip.trim().parse::<IpAddr>().ok())
        .collect::<Vec<_>>();
    if let Some(ip) = forwarded
        .into_iter()
        .rev()
        .find(|ip| !server.is_trusted_proxy(*ip))
    {
        return Some(ip);
    }

    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<IpAddr>().ok())
        .or(Some(peer))
}

/// Error response for API errors
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ApiErrorDetail,
    /// Emitted as the `Retry-After` header
    #[serde(skip)]
    pub retry_after: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ApiErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
            retry_after: None,
        }
    }

    pub fn with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error: ApiErrorDetail {
                code: code.into(),
                message: message.into(),
                details: Some(details),
            },
            retry_after: None,
        }
    }

    /// Attach a retry hint, both as a header and in `details`.
    pub fn retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self.error.details = Some(serde_json::json!({ "retry_after": seconds }));
        self
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("UNAUTHORIZED", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("BAD_REQUEST", message)
    }

    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::new("VALIDATION_ERROR", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("CONFLICT", message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new("SERVICE_UNAVAILABLE", message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new("INTERNAL_ERROR", message)
    }

    pub fn status(&self) -> StatusCode {
        match self.error.code.as_str() {
            "UNAUTHORIZED" => StatusCode::UNAUTHORIZED,
            "FORBIDDEN" | "ACCOUNT_UNVERIFIED" => StatusCode::FORBIDDEN,
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "BAD_REQUEST" | "VALIDATION_ERROR" => StatusCode::BAD_REQUEST,
            "CONFLICT" => StatusCode::CONFLICT,
            "ACCOUNT_LOCKED" => StatusCode::LOCKED,
            "RATE_LIMIT" => StatusCode::TOO_MANY_REQUESTS,
            "SERVICE_UNAVAILABLE" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, Json(&self)).into_response();

        if let Some(seconds) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound => ApiError::unauthorized("Authentication required"),
            SessionError::StoreUnavailable(e) => {
                tracing::error!(error = %e, "Session store unavailable");
                ApiError::service_unavailable("Service temporarily unavailable")
            }
            SessionError::PartialRevocation {
                cache_cleared,
                store_cleared,
            } => {
                tracing::error!(cache_cleared, store_cleared, "Session only partially revoked");
                ApiError::service_unavailable("Session could not be fully revoked, try again")
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials => ApiError::unauthorized("Invalid email or password"),
            AuthError::AccountLocked { retry_after } => ApiError::new(
                "ACCOUNT_LOCKED",
                "Too many failed login attempts, try again later",
            )
            .retry_after(retry_after),
            AuthError::AccountUnverified => {
                ApiError::new("ACCOUNT_UNVERIFIED", "Account has not been activated")
            }
            AuthError::RateLimited { retry_after } => {
                ApiError::new("RATE_LIMIT", "Too many requests, try again later")
                    .retry_after(retry_after)
            }
            AuthError::BotDetected => ApiError::bad_request("Request could not be processed"),
            AuthError::Validation(msg) => ApiError::validation_error(msg),
            AuthError::EmailTaken => ApiError::conflict("Email already registered"),
            AuthError::InvalidResetToken => {
                ApiError::validation_error("Invalid or expired reset token")
            }
            AuthError::Session(e) => e.into(),
            AuthError::Internal(e) => {
                tracing::error!(error = %e, "Internal error");
                ApiError::internal_error("Internal server error")
            }
        }
    }
}

/// Extract the session token: `Authorization: Bearer` first, then the cookie.
pub fn extract_session_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    if let Some(auth_header) = headers.get(header::AUTHORIZATION) {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                let token = token.trim();
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }

    for cookie_header in headers.get_all(header::COOKIE) {
        let Ok(cookie_str) = cookie_header.to_str() else {
            continue;
        };
        for cookie in cookie_str.split(';') {
            if let Some((name, value)) = cookie.trim().split_once('=') {
                if name == cookie_name && !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }

    None
}

/// Authentication middleware
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_session_token(request.headers(), &state.config.cookie.name)
        .ok_or_else(|| ApiError::unauthorized("Authentication required"))?;

    let (user, session) = state.login_guard.authenticate(&token).await?;

    request
        .extensions_mut()
        .insert(AuthenticatedUser { user, session });
    Ok(next.run(request).await)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_extract_session_token_from_bearer() {
        let h = headers(&[(header::AUTHORIZATION, "Bearer test-token-123")]);
        assert_eq!(
            extract_session_token(&h, "session"),
            Some("test-token-123".to_string())
        );
    }

    #[test]
    fn test_extract_session_token_from_cookie() {
        let h = headers(&[(header::COOKIE, "theme=dark; session=test-token-456")]);
        assert_eq!(
            extract_session_token(&h, "session"),
            Some("test-token-456".to_string())
        );
    }

    #[test]
    fn test_extract_session_token_bearer_priority() {
        let h = headers(&[
            (header::AUTHORIZATION, "Bearer bearer-token"),
            (header::COOKIE, "session=cookie-token"),
        ]);
        assert_eq!(
            extract_session_token(&h, "session"),
            Some("bearer-token".to_string())
        );
    }

    #[test]
    fn test_extract_session_token_custom_cookie_name() {
        let h = headers(&[(header::COOKIE, "session=wrong; tp_sid=right")]);
        assert_eq!(extract_session_token(&h, "tp_sid"), Some("right".to_string()));
        // Prefix of another cookie name does not match
        let h = headers(&[(header::COOKIE, "my_session=nope")]);
        assert_eq!(extract_session_token(&h, "session"), None);
    }

    #[test]
    fn test_extract_session_token_missing() {
        assert_eq!(extract_session_token(&HeaderMap::new(), "session"), None);
        let h = headers(&[
            (header::AUTHORIZATION, "Basic dXNlcjpwYXNz"),
            (header::COOKIE, "session="),
        ]);
        assert_eq!(extract_session_token(&h, "session"), None);
    }

    fn server(trusted: &[&str]) -> ServerConfig {
        ServerConfig {
            trusted_proxies: trusted.iter().map(|ip| ip.parse().unwrap()).collect(),
            ..ServerConfig::default()
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_client_ip_ignores_headers_from_untrusted_peer() {
        let h = headers(&[
            (header::HeaderName::from_static("x-forwarded-for"), "10.9.9.9"),
            (header::HeaderName::from_static("x-real-ip"), "10.8.8.8"),
        ]);

        assert_eq!(
            resolve_client_ip(Some(ip("203.0.113.5")), &h, &server(&[])),
            Some(ip("203.0.113.5"))
        );
        assert_eq!(resolve_client_ip(None, &h, &server(&[])), None);
    }

    #[test]
    fn test_client_ip_behind_trusted_proxy() {
        let proxies = server(&["10.0.0.1", "10.0.0.2"]);

        // Rightmost untrusted hop wins; the spoofed leftmost entry is ignored
        let h = headers(&[(
            header::HeaderName::from_static("x-forwarded-for"),
            "1.1.1.1, 198.51.100.7, 10.0.0.2",
        )]);
        assert_eq!(
            resolve_client_ip(Some(ip("10.0.0.1")), &h, &proxies),
            Some(ip("198.51.100.7"))
        );

        let h = headers(&[(header::HeaderName::from_static("x-real-ip"), "198.51.100.8")]);
        assert_eq!(
            resolve_client_ip(Some(ip("10.0.0.1")), &h, &proxies),
            Some(ip("198.51.100.8"))
        );

        // Garbage headers fall back to the proxy itself
        let h = headers(&[(header::HeaderName::from_static("x-forwarded-for"), "not-an-ip")]);
        assert_eq!(
            resolve_client_ip(Some(ip("10.0.0.1")), &h, &proxies),
            Some(ip("10.0.0.1"))
        );
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (AuthError::InvalidCredentials, StatusCode::UNAUTHORIZED),
            (AuthError::AccountLocked { retry_after: 900 }, StatusCode::LOCKED),
            (AuthError::AccountUnverified, StatusCode::FORBIDDEN),
            (AuthError::RateLimited { retry_after: 60 }, StatusCode::TOO_MANY_REQUESTS),
            (AuthError::BotDetected, StatusCode::BAD_REQUEST),
            (AuthError::EmailTaken, StatusCode::CONFLICT),
            (
                AuthError::Session(SessionError::NotFound),
                StatusCode::UNAUTHORIZED,
            ),
            (
                AuthError::Session(SessionError::StoreUnavailable(anyhow::anyhow!("down"))),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                AuthError::Internal(anyhow::anyhow!("boom")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn test_retry_after_header() {
        let response = ApiError::from(AuthError::AccountLocked { retry_after: 900 }).into_response();

        assert_eq!(response.status(), StatusCode::LOCKED);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "900");
    }

    #[test]
    fn test_bot_and_credential_messages_are_generic() {
        let bot = ApiError::from(AuthError::BotDetected);
        let creds = ApiError::from(AuthError::InvalidCredentials);

        assert!(!bot.error.message.to_lowercase().contains("honeypot"));
        assert_eq!(creds.error.message, "Invalid email or password");
        assert_eq!(
            ApiError::from(SessionError::NotFound).error.message,
            "Authentication required"
        );
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn cookie_token_is_found_among_others(
            token in "[0-9a-f]{64}",
            other in "[a-z]{1,8}",
            value in "[a-zA-Z0-9]{0,16}",
        ) {
            prop_assume!(other != "session");
            let raw = format!("{}={}; session={}", other, value, token);
            let mut h = HeaderMap::new();
            h.insert(header::COOKIE, HeaderValue::from_str(&raw).unwrap());

            prop_assert_eq!(extract_session_token(&h, "session"), Some(token));
        }
    }
}
