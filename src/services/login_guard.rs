//! Login guard
//!
//! Wraps credential verification with brute-force protection:
//!
//! 1. per-IP rate limit on login attempts; requests without a known address
//!    share one bucket rather than bypassing the limit
//! 2. per-email lockout once `login.max_attempts` failures accumulate inside
//!    the lockout window, enforced even when the password is correct
//! 3. user lookup; unknown emails count as failures and burn a dummy argon2
//!    verification so timing does not reveal registration
//! 4. activation check
//! 5. password verification
//! 6. session issue
//!
//! A successful login does not reset the failure counter; it ages out with
//! its window. User lookups run under the same store timeout as session
//! calls and fail closed.

use std::sync::Arc;

use crate::config::LoginConfig;
use crate::db::repositories::UserRepository;
use crate::models::{normalize_email, Session, User};
use crate::services::anti_bot::BotRejection;
use crate::services::password::{dummy_verify_blocking, verify_password_blocking};
use crate::services::rate_limiter::{RateLimitAction, RateLimited, RateLimiter};
use crate::services::session::{SessionError, SessionManager};

/// Errors surfaced by login, signup and password reset
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Account temporarily locked")]
    AccountLocked { retry_after: u64 },

    #[error("Account not activated")]
    AccountUnverified,

    #[error("Too many requests")]
    RateLimited { retry_after: u64 },

    #[error("Request rejected")]
    BotDetected,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Email already registered")]
    EmailTaken,

    #[error("Invalid or expired reset token")]
    InvalidResetToken,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<RateLimited> for AuthError {
    fn from(limited: RateLimited) -> Self {
        AuthError::RateLimited {
            retry_after: limited.retry_after,
        }
    }
}

impl From<BotRejection> for AuthError {
    fn from(_: BotRejection) -> Self {
        AuthError::BotDetected
    }
}

/// Request metadata recorded on the session
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Credential check plus lockout, in front of the session manager
pub struct LoginGuard {
    users: Arc<dyn UserRepository>,
    sessions: Arc<SessionManager>,
    limiter: Arc<RateLimiter>,
    config: LoginConfig,
}

/// Rate limit key for requests whose client address could not be determined
pub const UNKNOWN_CLIENT: &str = "unknown";

fn failed_key(email: &str) -> String {
    format!("login_failed:{}", email)
}

impl LoginGuard {
    pub fn new(
        users: Arc<dyn UserRepository>,
        sessions: Arc<SessionManager>,
        limiter: Arc<RateLimiter>,
        config: LoginConfig,
    ) -> Self {
        Self {
            users,
            sessions,
            limiter,
            config,
        }
    }

    /// Verify credentials and issue a session.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        client: ClientInfo,
    ) -> Result<(User, Session), AuthError> {
        let ip = client.ip_address.as_deref().unwrap_or(UNKNOWN_CLIENT);
        self.limiter.check(RateLimitAction::Login, ip).await?;

        let email = normalize_email(email);
        self.ensure_not_locked(&email).await?;

        let lookup = self
            .sessions
            .durable("user_by_email", self.users.get_by_email(&email))
            .await?;
        let Some(user) = lookup else {
            self.record_failure(&email).await;
            dummy_verify_blocking(password.to_string()).await;
            tracing::info!("Login failed: unknown account");
            return Err(AuthError::InvalidCredentials);
        };

        if !user.is_active {
            tracing::info!(user_id = user.id, "Login refused: account not activated");
            return Err(AuthError::AccountUnverified);
        }

        let valid =
            verify_password_blocking(password.to_string(), user.password_hash.clone()).await?;
        if !valid {
            self.record_failure(&email).await;
            tracing::info!(user_id = user.id, "Login failed: wrong password");
            return Err(AuthError::InvalidCredentials);
        }

        let session = self
            .sessions
            .create(user.id, client.ip_address, client.user_agent)
            .await?;

        let users = self.users.clone();
        let sessions = self.sessions.clone();
        let user_id = user.id;
        let at = session.created_at;
        tokio::spawn(async move {
            let update = users.update_last_login(user_id, at);
            if let Err(e) = sessions.durable("update_last_login", update).await {
                tracing::warn!(user_id, error = %e, "Failed to record last login");
            }
        });

        Ok((user, session))
    }

    /// Resolve a session token to its session and owner.
    pub async fn authenticate(&self, token: &str) -> Result<(User, Session), AuthError> {
        let session = self.sessions.get(token).await?;

        let owner = self
            .sessions
            .durable("user_by_id", self.users.get_by_id(session.user_id))
            .await?;
        match owner {
            Some(user) => Ok((user, session)),
            None => {
                // Owner is gone; the session must not outlive it
                if let Err(e) = self.sessions.revoke(token).await {
                    tracing::warn!(
                        user_id = session.user_id,
                        error = %e,
                        "Failed to revoke session of deleted user"
                    );
                }
                Err(AuthError::Session(SessionError::NotFound))
            }
        }
    }

    /// Revoke the session behind `token`.
    pub async fn logout(&self, token: &str) -> Result<(), AuthError> {
        self.sessions.revoke(token).await?;
        Ok(())
    }

    async fn ensure_not_locked(&self, email: &str) -> Result<(), AuthError> {
        let retry_after = self.config.lockout().as_secs();

        match self.limiter.count(&failed_key(email)).await {
            Ok(Some(failures)) if failures >= self.config.max_attempts => {
                tracing::info!(failures, "Login refused: account locked");
                Err(AuthError::AccountLocked { retry_after })
            }
            Ok(_) => Ok(()),
            Err(e) if self.limiter.fail_open() => {
                tracing::warn!(error = %e, "Lockout counter unavailable, allowing attempt");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Lockout counter unavailable, refusing attempt");
                Err(AuthError::RateLimited { retry_after })
            }
        }
    }

    async fn record_failure(&self, email: &str) {
        if let Err(e) = self
            .limiter
            .record(&failed_key(email), self.config.lockout())
            .await
        {
            tracing::warn!(error = %e, "Failed to record failed login attempt");
        }
    }
}
