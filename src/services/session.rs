//! Session manager
//!
//! Sessions live in two places: the database, which decides whether a
//! session exists, and an optional volatile cache that mirrors it to keep
//! lookups off the database. There is no transaction spanning both.
//!
//! - Writes go to the database first; the cache mirror is best effort.
//! - Reads try the cache, re-check expiry, then fall back to the database
//!   and repopulate the cache.
//! - Revocation is attempted on both tiers independently and reports which
//!   one failed.
//!
//! Any cache failure or timeout degrades to the database path. A database
//! failure or timeout is surfaced as [`SessionError::StoreUnavailable`];
//! lookups fail closed.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;

use crate::cache::SharedCache;
use crate::config::SessionConfig;
use crate::db::repositories::SessionRepository;
use crate::models::Session;
use crate::services::clock::Clock;
use crate::services::token::{fingerprint, generate_token, is_well_formed};

/// Errors surfaced by the session manager
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The durable store failed or timed out
    #[error("Session store unavailable: {0}")]
    StoreUnavailable(#[from] anyhow::Error),

    /// No valid session for this token
    #[error("Session not found")]
    NotFound,

    /// Exactly one tier was cleared during revocation
    #[error("Session partially revoked (cache cleared: {cache_cleared}, store cleared: {store_cleared})")]
    PartialRevocation {
        cache_cleared: bool,
        store_cleared: bool,
    },
}

/// Outcome of revoking every session of a user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RevokeAllReport {
    pub revoked: usize,
    pub failed: usize,
}

/// Creates, resolves and revokes sessions across cache and database
pub struct SessionManager {
    store: Arc<dyn SessionRepository>,
    cache: Option<SharedCache>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
}

fn cache_key(token: &str) -> String {
    format!("session:{}", token)
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionRepository>,
        cache: Option<SharedCache>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            config,
        }
    }

    /// Issue a new session for `user_id`.
    ///
    /// Nothing is issued unless the database insert succeeds.
    pub async fn create(
        &self,
        user_id: i64,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Result<Session, SessionError> {
        let token = generate_token()?;
        let now = self.clock.now();
        let session = Session::new(
            token,
            user_id,
            ip_address,
            user_agent,
            now,
            now + self.config.ttl(),
        );

        self.durable("create", self.store.create(&session)).await?;
        self.mirror(&session, now).await;

        tracing::info!(
            user_id,
            token_fingerprint = %fingerprint(&session.id),
            expires_at = %session.expires_at,
            "Session created"
        );

        Ok(session)
    }

    /// Resolve a token to a live session.
    pub async fn get(&self, token: &str) -> Result<Session, SessionError> {
        if !is_well_formed(token) {
            return Err(SessionError::NotFound);
        }

        let now = self.clock.now();

        if let Some(cache) = &self.cache {
            let lookup = self
                .cached("get", token, cache.get_fields(&cache_key(token)))
                .await;

            match lookup {
                Some(Some(fields)) => match Session::from_cache_fields(token, &fields) {
                    Some(session) if session.is_expired_at(now) => {
                        tracing::debug!(
                            token_fingerprint = %fingerprint(token),
                            "Cached session expired, revoking"
                        );
                        if let Err(e) = self.revoke(token).await {
                            tracing::warn!(
                                token_fingerprint = %fingerprint(token),
                                error = %e,
                                "Failed to revoke expired session"
                            );
                        }
                        return Err(SessionError::NotFound);
                    }
                    Some(session) => return Ok(session),
                    None => {
                        tracing::warn!(
                            token_fingerprint = %fingerprint(token),
                            "Malformed cached session, treating as miss"
                        );
                    }
                },
                Some(None) | None => {}
            }
        }

        let session = self
            .durable("get", self.store.get_active(token, now))
            .await?
            .ok_or(SessionError::NotFound)?;

        self.mirror(&session, now).await;
        Ok(session)
    }

    /// Remove a session from both tiers.
    ///
    /// Revoking a session that does not exist succeeds.
    pub async fn revoke(&self, token: &str) -> Result<(), SessionError> {
        let key = cache_key(token);
        let cache_delete = async {
            match &self.cache {
                Some(cache) => self
                    .cached("delete", token, cache.delete(&key))
                    .await
                    .is_some(),
                None => true,
            }
        };
        let store_delete = self.durable("delete", self.store.delete(token));

        let (cache_cleared, store_result) = tokio::join!(cache_delete, store_delete);

        match (cache_cleared, store_result) {
            (true, Ok(())) => {
                tracing::info!(token_fingerprint = %fingerprint(token), "Session revoked");
                Ok(())
            }
            (false, Err(e)) => Err(e),
            // Nothing was mirrored to a cache that does not exist
            (true, Err(e)) if self.cache.is_none() => Err(e),
            (cache_cleared, store_result) => {
                let store_cleared = store_result.is_ok();
                tracing::warn!(
                    token_fingerprint = %fingerprint(token),
                    cache_cleared,
                    store_cleared,
                    "Session partially revoked"
                );
                Err(SessionError::PartialRevocation {
                    cache_cleared,
                    store_cleared,
                })
            }
        }
    }

    /// Live sessions of a user, newest first. Reads the database only.
    pub async fn list_active(&self, user_id: i64) -> Result<Vec<Session>, SessionError> {
        let now = self.clock.now();
        self.durable("list", self.store.list_active_by_user(user_id, now))
            .await
    }

    /// Revoke every live session of a user, continuing past individual failures.
    pub async fn revoke_all(&self, user_id: i64) -> Result<RevokeAllReport, SessionError> {
        let sessions = self.list_active(user_id).await?;
        let mut report = RevokeAllReport::default();

        for session in sessions {
            match self.revoke(&session.id).await {
                Ok(()) => report.revoked += 1,
                Err(e) => {
                    tracing::warn!(
                        user_id,
                        token_fingerprint = %fingerprint(&session.id),
                        error = %e,
                        "Failed to revoke session"
                    );
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            user_id,
            revoked = report.revoked,
            failed = report.failed,
            "Revoked all sessions"
        );
        Ok(report)
    }

    /// Delete expired rows from the database; returns how many were removed.
    pub async fn cleanup(&self) -> Result<u64, SessionError> {
        let now = self.clock.now();
        let removed = self
            .durable("cleanup", self.store.delete_expired(now))
            .await?;

        if removed > 0 {
            tracing::info!(removed, "Cleaned up expired sessions");
        }
        Ok(removed)
    }

    /// Current time according to the injected clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Best-effort copy of a session into the cache, expiring with the session.
    async fn mirror(&self, session: &Session, now: DateTime<Utc>) {
        let (Some(cache), Some(ttl)) = (&self.cache, session.remaining(now)) else {
            return;
        };

        let fields = session.to_cache_fields();
        self.cached(
            "set",
            &session.id,
            cache.set_fields(&cache_key(&session.id), &fields, ttl),
        )
        .await;
    }

    /// Run a cache call under the cache timeout. `None` means the call failed.
    async fn cached<T>(
        &self,
        op: &'static str,
        token: &str,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> Option<T> {
        match tokio::time::timeout(self.config.cache_timeout(), call).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                tracing::warn!(
                    op,
                    token_fingerprint = %fingerprint(token),
                    error = %e,
                    "CacheUnavailable: session cache call failed"
                );
                None
            }
            Err(_) => {
                tracing::warn!(
                    op,
                    token_fingerprint = %fingerprint(token),
                    "CacheUnavailable: session cache call timed out"
                );
                None
            }
        }
    }

    /// Run a database call under the store timeout.
    ///
    /// Shared with the services that read users and reset tokens, so every
    /// durable call on a request path is bounded the same way.
    pub(crate) async fn durable<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, SessionError> {
        match tokio::time::timeout(self.config.store_timeout(), call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::error!(op, error = %e, "Database call failed");
                Err(SessionError::StoreUnavailable(e))
            }
            Err(_) => {
                tracing::error!(op, "Database call timed out");
                Err(SessionError::StoreUnavailable(anyhow!(
                    "database {} timed out",
                    op
                )))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Session store wrapper whose failures can be switched on per operation
    pub struct FlakyStore {
        inner: Arc<dyn SessionRepository>,
        pub fail_all: AtomicBool,
        pub fail_deletes: AtomicBool,
    }

    impl FlakyStore {
        pub fn new(inner: Arc<dyn SessionRepository>) -> Self {
            Self {
                inner,
                fail_all: AtomicBool::new(false),
                fail_deletes: AtomicBool::new(false),
            }
        }

        fn check(&self) -> Result<()> {
            if self.fail_all.load(Ordering::SeqCst) {
                bail!("database down");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SessionRepository for FlakyStore {
        async fn create(&self, session: &Session) -> Result<()> {
            self.check()?;
            self.inner.create(session).await
        }

        async fn get_active(&self, token: &str, now: DateTime<Utc>) -> Result<Option<Session>> {
            self.check()?;
            self.inner.get_active(token, now).await
        }

        async fn list_active_by_user(
            &self,
            user_id: i64,
            now: DateTime<Utc>,
        ) -> Result<Vec<Session>> {
            self.check()?;
            self.inner.list_active_by_user(user_id, now).await
        }

        async fn delete(&self, token: &str) -> Result<()> {
            self.check()?;
            if self.fail_deletes.load(Ordering::SeqCst) {
                bail!("delete rejected");
            }
            self.inner.delete(token).await
        }

        async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
            self.check()?;
            self.inner.delete_expired(now).await
        }
    }
}
