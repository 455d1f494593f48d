//! Account service
//!
//! Signup, activation and password reset. Public entry points run the
//! anti-bot checks before any rate limit slot is consumed or any store is
//! touched. Database calls share the session store timeout.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, OnceLock};

use crate::config::PasswordResetConfig;
use crate::db::repositories::{is_unique_violation, PasswordResetRepository, UserRepository};
use crate::models::{normalize_email, PasswordReset, User};
use crate::services::anti_bot::{FormGuard, FormSignals};
use crate::services::login_guard::{AuthError, UNKNOWN_CLIENT};
use crate::services::password::{hash_password_blocking, validate_password_length};
use crate::services::rate_limiter::{RateLimitAction, RateLimiter};
use crate::services::session::{RevokeAllReport, SessionError, SessionManager};
use crate::services::token::{fingerprint, generate_token, hash_token, is_well_formed};

const MAX_EMAIL_LEN: usize = 254;

fn email_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$"))
        .as_ref()
        .map_err(|e| anyhow!("Invalid email pattern: {}", e))
}

/// Validate an already normalized email address.
pub fn validate_email(email: &str) -> Result<(), AuthError> {
    if email.is_empty() {
        return Err(AuthError::Validation("Email is required".to_string()));
    }
    if email.len() > MAX_EMAIL_LEN || !email_pattern()?.is_match(email) {
        return Err(AuthError::Validation("Invalid email format".to_string()));
    }
    Ok(())
}

/// Delivers password reset tokens to their owners
#[async_trait]
pub trait ResetNotifier: Send + Sync {
    async fn send_reset(&self, user: &User, token: &str) -> Result<()>;
}

/// Notifier that only logs that a reset was issued.
///
/// Stands in until a mail transport is wired up; the token itself is never
/// written out.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl ResetNotifier for LogNotifier {
    async fn send_reset(&self, user: &User, token: &str) -> Result<()> {
        tracing::info!(
            user_id = user.id,
            token_fingerprint = %fingerprint(token),
            "Password reset issued"
        );
        Ok(())
    }
}

/// Account lifecycle operations
pub struct AccountService {
    users: Arc<dyn UserRepository>,
    resets: Arc<dyn PasswordResetRepository>,
    sessions: Arc<SessionManager>,
    limiter: Arc<RateLimiter>,
    forms: FormGuard,
    notifier: Arc<dyn ResetNotifier>,
    reset_config: PasswordResetConfig,
}

impl AccountService {
    pub fn new(
        users: Arc<dyn UserRepository>,
        resets: Arc<dyn PasswordResetRepository>,
        sessions: Arc<SessionManager>,
        limiter: Arc<RateLimiter>,
        forms: FormGuard,
        reset_config: PasswordResetConfig,
    ) -> Self {
        Self {
            users,
            resets,
            sessions,
            limiter,
            forms,
            notifier: Arc::new(LogNotifier),
            reset_config,
        }
    }

    /// Replace the reset notifier.
    pub fn with_notifier(mut self, notifier: Arc<dyn ResetNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Register a new, inactive account.
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        signals: &FormSignals,
        ip_address: Option<&str>,
    ) -> Result<User, AuthError> {
        self.check_form(signals, "signup")?;
        self.limiter
            .check(RateLimitAction::Signup, ip_address.unwrap_or(UNKNOWN_CLIENT))
            .await?;

        let email = normalize_email(email);
        validate_email(&email)?;
        validate_password_length(password).map_err(AuthError::Validation)?;

        let existing = self
            .sessions
            .durable("user_by_email", self.users.get_by_email(&email))
            .await?;
        if existing.is_some() {
            return Err(AuthError::EmailTaken);
        }

        let hash = hash_password_blocking(password.to_string()).await?;
        let new_user = User::new(email, hash);
        let user = match self
            .sessions
            .durable("create_user", self.users.create(&new_user))
            .await
        {
            Ok(user) => user,
            // Lost a race with a concurrent signup for the same address
            Err(SessionError::StoreUnavailable(e)) if is_unique_violation(&e) => {
                return Err(AuthError::EmailTaken)
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(user_id = user.id, "Account registered");
        Ok(user)
    }

    /// Mark an account as activated.
    pub async fn activate(&self, user_id: i64) -> Result<User, AuthError> {
        let lookup = self
            .sessions
            .durable("user_by_id", self.users.get_by_id(user_id))
            .await?;
        let Some(mut user) = lookup else {
            return Err(AuthError::Validation("User not found".to_string()));
        };

        if !user.is_active {
            self.sessions
                .durable("activate_user", self.users.set_active(user_id, true))
                .await?;
            user.is_active = true;
            tracing::info!(user_id, "Account activated");
        }
        Ok(user)
    }

    /// Start a password reset.
    ///
    /// Succeeds the same way whether or not the email belongs to an account.
    pub async fn request_password_reset(
        &self,
        email: &str,
        signals: &FormSignals,
    ) -> Result<(), AuthError> {
        self.check_form(signals, "password_reset")?;

        let email = normalize_email(email);
        validate_email(&email)?;
        self.limiter
            .check(RateLimitAction::PasswordReset, &email)
            .await?;

        let lookup = self
            .sessions
            .durable("user_by_email", self.users.get_by_email(&email))
            .await?;
        let Some(user) = lookup else {
            tracing::debug!("Password reset requested for unknown email");
            return Ok(());
        };

        if let Err(e) = self.issue_reset(&user).await {
            tracing::error!(user_id = user.id, error = %e, "Failed to issue password reset");
        }
        Ok(())
    }

    /// Redeem a reset token, set the new password and sign out everywhere.
    pub async fn confirm_password_reset(
        &self,
        token: &str,
        new_password: &str,
    ) -> Result<RevokeAllReport, AuthError> {
        if !is_well_formed(token) {
            return Err(AuthError::InvalidResetToken);
        }
        validate_password_length(new_password).map_err(AuthError::Validation)?;

        let token_hash = hash_token(token);
        let taken = self
            .sessions
            .durable("take_reset", self.resets.take(&token_hash))
            .await?;
        let Some(reset) = taken else {
            return Err(AuthError::InvalidResetToken);
        };
        if reset.is_expired_at(self.sessions.now()) {
            tracing::info!(user_id = reset.user_id, "Expired password reset token redeemed");
            return Err(AuthError::InvalidResetToken);
        }

        let hash = hash_password_blocking(new_password.to_string()).await?;
        self.sessions
            .durable(
                "update_password",
                self.users.update_password(reset.user_id, &hash),
            )
            .await?;

        let report = self.sessions.revoke_all(reset.user_id).await?;
        tracing::info!(
            user_id = reset.user_id,
            revoked = report.revoked,
            "Password reset completed"
        );
        Ok(report)
    }

    /// Drop expired reset tokens; returns how many were removed.
    pub async fn cleanup_expired_resets(&self) -> Result<u64> {
        let removed = self
            .sessions
            .durable("reset_cleanup", self.resets.delete_expired(self.sessions.now()))
            .await?;
        if removed > 0 {
            tracing::info!(removed, "Cleaned up expired password resets");
        }
        Ok(removed)
    }

    async fn issue_reset(&self, user: &User) -> Result<()> {
        let token = generate_token()?;
        let now = self.sessions.now();
        let reset = PasswordReset {
            token_hash: hash_token(&token),
            user_id: user.id,
            expires_at: now + chrono::Duration::minutes(self.reset_config.ttl_minutes),
            created_at: now,
        };

        self.sessions
            .durable("create_reset", self.resets.create(&reset))
            .await?;
        self.notifier.send_reset(user, &token).await
    }

    fn check_form(&self, signals: &FormSignals, form: &'static str) -> Result<(), AuthError> {
        self.forms
            .check(signals, self.sessions.now())
            .map_err(|reason| {
                tracing::info!(form, reason = %reason, "Rejected automated submission");
                AuthError::from(reason)
            })
    }
}
