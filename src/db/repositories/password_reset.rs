//! Password reset repository
//!
//! Reset tokens are single use: `take` removes the row in the same call that
//! reads it, so a token can never be redeemed twice.

use crate::config::DatabaseDriver;
use crate::db::pool::{mysql, sqlite};
use crate::db::DynDatabasePool;
use crate::models::PasswordReset;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::sync::Arc;

/// Password reset repository trait
#[async_trait]
pub trait PasswordResetRepository: Send + Sync {
    /// Store a new reset request
    async fn create(&self, reset: &PasswordReset) -> Result<()>;

    /// Remove and return the reset request with this digest, if any
    async fn take(&self, token_hash: &str) -> Result<Option<PasswordReset>>;

    /// Drop every reset request that expired at or before `now`
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// SQLx-based password reset repository
pub struct SqlxPasswordResetRepository {
    pool: DynDatabasePool,
}

impl SqlxPasswordResetRepository {
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn PasswordResetRepository> {
        Arc::new(Self::new(pool))
    }
}

const INSERT: &str =
    "INSERT INTO password_resets (token_hash, user_id, expires_at, created_at) VALUES (?, ?, ?, ?)";
const SELECT: &str =
    "SELECT token_hash, user_id, expires_at, created_at FROM password_resets WHERE token_hash = ?";
const DELETE: &str = "DELETE FROM password_resets WHERE token_hash = ?";
const DELETE_EXPIRED: &str = "DELETE FROM password_resets WHERE expires_at <= ?";

#[async_trait]
impl PasswordResetRepository for SqlxPasswordResetRepository {
    async fn create(&self, reset: &PasswordReset) -> Result<()> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                sqlx::query(INSERT)
                    .bind(&reset.token_hash)
                    .bind(reset.user_id)
                    .bind(reset.expires_at)
                    .bind(reset.created_at)
                    .execute(sqlite(&self.pool)?)
                    .await
                    .context("Failed to create password reset")?;
            }
            DatabaseDriver::Mysql => {
                sqlx::query(INSERT)
                    .bind(&reset.token_hash)
                    .bind(reset.user_id)
                    .bind(reset.expires_at)
                    .bind(reset.created_at)
                    .execute(mysql(&self.pool)?)
                    .await
                    .context("Failed to create password reset")?;
            }
        }
        Ok(())
    }

    async fn take(&self, token_hash: &str) -> Result<Option<PasswordReset>> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                let mut tx = sqlite(&self.pool)?.begin().await?;
                let row = sqlx::query(SELECT)
                    .bind(token_hash)
                    .fetch_optional(&mut *tx)
                    .await
                    .context("Failed to read password reset")?;
                let Some(row) = row else {
                    return Ok(None);
                };
                let reset = PasswordReset {
                    token_hash: row.try_get("token_hash")?,
                    user_id: row.try_get("user_id")?,
                    expires_at: row.try_get("expires_at")?,
                    created_at: row.try_get("created_at")?,
                };
                let deleted = sqlx::query(DELETE)
                    .bind(token_hash)
                    .execute(&mut *tx)
                    .await
                    .context("Failed to consume password reset")?;
                tx.commit().await?;
                Ok((deleted.rows_affected() == 1).then_some(reset))
            }
            DatabaseDriver::Mysql => {
                let mut tx = mysql(&self.pool)?.begin().await?;
                let row = sqlx::query(&format!("{} FOR UPDATE", SELECT))
                    .bind(token_hash)
                    .fetch_optional(&mut *tx)
                    .await
                    .context("Failed to read password reset")?;
                let Some(row) = row else {
                    return Ok(None);
                };
                let reset = PasswordReset {
                    token_hash: row.try_get("token_hash")?,
                    user_id: row.try_get("user_id")?,
                    expires_at: row.try_get("expires_at")?,
                    created_at: row.try_get("created_at")?,
                };
                let deleted = sqlx::query(DELETE)
                    .bind(token_hash)
                    .execute(&mut *tx)
                    .await
                    .context("Failed to consume password reset")?;
                tx.commit().await?;
                Ok((deleted.rows_affected() == 1).then_some(reset))
            }
        }
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = match self.pool.driver() {
            DatabaseDriver::Sqlite => sqlx::query(DELETE_EXPIRED)
                .bind(now)
                .execute(sqlite(&self.pool)?)
                .await
                .map(|r| r.rows_affected()),
            DatabaseDriver::Mysql => sqlx::query(DELETE_EXPIRED)
                .bind(now)
                .execute(mysql(&self.pool)?)
                .await
                .map(|r| r.rows_affected()),
        };

        result.context("Failed to delete expired password resets")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_test_pool, migrations};
    use chrono::Duration;

    async fn setup_test_repo() -> SqlxPasswordResetRepository {
        let pool = create_test_pool().await.expect("Failed to create test pool");
        migrations::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");
        sqlx::query("INSERT INTO users (id, email, password_hash) VALUES (1, 'r@example.com', 'hash')")
            .execute(pool.as_sqlite().unwrap())
            .await
            .expect("Failed to create test user");
        SqlxPasswordResetRepository::new(pool)
    }

    fn reset(hash: &str, expires_in: Duration) -> PasswordReset {
        let now = Utc::now();
        PasswordReset {
            token_hash: hash.to_string(),
            user_id: 1,
            expires_at: now + expires_in,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn test_take_is_single_use() {
        let repo = setup_test_repo().await;
        repo.create(&reset("digest-1", Duration::minutes(30)))
            .await
            .expect("Failed to create reset");

        let first = repo.take("digest-1").await.unwrap();
        assert_eq!(first.map(|r| r.user_id), Some(1));

        assert!(repo.take("digest-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_take_unknown() {
        let repo = setup_test_repo().await;
        assert!(repo.take("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_expired() {
        let repo = setup_test_repo().await;
        repo.create(&reset("live", Duration::minutes(30))).await.unwrap();
        repo.create(&reset("dead", Duration::minutes(-5))).await.unwrap();

        assert_eq!(repo.delete_expired(Utc::now()).await.unwrap(), 1);
        assert!(repo.take("live").await.unwrap().is_some());
    }
}
