//! User repository
//!
//! The credential store consumed by the login layer.
//!
//! This module provides:
//! - `UserRepository` trait defining the interface for user data access
//! - `SqlxUserRepository` implementing the trait for SQLite and MySQL

use crate::config::DatabaseDriver;
use crate::db::pool::{mysql, sqlite};
use crate::db::DynDatabasePool;
use crate::models::User;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{MySqlPool, Row, SqlitePool};
use std::sync::Arc;

/// User repository trait
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Create a new user and return it with its assigned ID
    async fn create(&self, user: &User) -> Result<User>;

    /// Get user by ID
    async fn get_by_id(&self, id: i64) -> Result<Option<User>>;

    /// Get user by (normalized) email
    async fn get_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Set the activation flag
    async fn set_active(&self, id: i64, active: bool) -> Result<()>;

    /// Replace the stored password hash
    async fn update_password(&self, id: i64, password_hash: &str) -> Result<()>;

    /// Record a successful login
    async fn update_last_login(&self, id: i64, at: DateTime<Utc>) -> Result<()>;
}

/// SQLx-based user repository implementation
///
/// Supports both SQLite and MySQL databases.
pub struct SqlxUserRepository {
    pool: DynDatabasePool,
}

impl SqlxUserRepository {
    /// Create a new SQLx user repository
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    /// Create a boxed repository for use with dependency injection
    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn UserRepository> {
        Arc::new(Self::new(pool))
    }
}

#[async_trait]
impl UserRepository for SqlxUserRepository {
    async fn create(&self, user: &User) -> Result<User> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => create_user_sqlite(sqlite(&self.pool)?, user).await,
            DatabaseDriver::Mysql => create_user_mysql(mysql(&self.pool)?, user).await,
        }
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<User>> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_COLUMNS))
                    .bind(id)
                    .fetch_optional(sqlite(&self.pool)?)
                    .await
                    .context("Failed to get user by ID")?;
                row.as_ref().map(row_to_user_sqlite).transpose()
            }
            DatabaseDriver::Mysql => {
                let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_COLUMNS))
                    .bind(id)
                    .fetch_optional(mysql(&self.pool)?)
                    .await
                    .context("Failed to get user by ID")?;
                row.as_ref().map(row_to_user_mysql).transpose()
            }
        }
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<User>> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                let row = sqlx::query(&format!("{} WHERE email = ?", SELECT_COLUMNS))
                    .bind(email)
                    .fetch_optional(sqlite(&self.pool)?)
                    .await
                    .context("Failed to get user by email")?;
                row.as_ref().map(row_to_user_sqlite).transpose()
            }
            DatabaseDriver::Mysql => {
                let row = sqlx::query(&format!("{} WHERE email = ?", SELECT_COLUMNS))
                    .bind(email)
                    .fetch_optional(mysql(&self.pool)?)
                    .await
                    .context("Failed to get user by email")?;
                row.as_ref().map(row_to_user_mysql).transpose()
            }
        }
    }

    async fn set_active(&self, id: i64, active: bool) -> Result<()> {
        let query = "UPDATE users SET is_active = ?, updated_at = ? WHERE id = ?";
        let now = Utc::now();
        let affected = match self.pool.driver() {
            DatabaseDriver::Sqlite => sqlx::query(query)
                .bind(active)
                .bind(now)
                .bind(id)
                .execute(sqlite(&self.pool)?)
                .await
                .map(|r| r.rows_affected()),
            DatabaseDriver::Mysql => sqlx::query(query)
                .bind(active)
                .bind(now)
                .bind(id)
                .execute(mysql(&self.pool)?)
                .await
                .map(|r| r.rows_affected()),
        }
        .context("Failed to update activation flag")?;

        if affected == 0 {
            anyhow::bail!("User not found: {}", id);
        }
        Ok(())
    }

    async fn update_password(&self, id: i64, password_hash: &str) -> Result<()> {
        let query = "UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?";
        let now = Utc::now();
        let affected = match self.pool.driver() {
            DatabaseDriver::Sqlite => sqlx::query(query)
                .bind(password_hash)
                .bind(now)
                .bind(id)
                .execute(sqlite(&self.pool)?)
                .await
                .map(|r| r.rows_affected()),
            DatabaseDriver::Mysql => sqlx::query(query)
                .bind(password_hash)
                .bind(now)
                .bind(id)
                .execute(mysql(&self.pool)?)
                .await
                .map(|r| r.rows_affected()),
        }
        .context("Failed to update password")?;

        if affected == 0 {
            anyhow::bail!("User not found: {}", id);
        }
        Ok(())
    }

    async fn update_last_login(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let query = "UPDATE users SET last_login_at = ? WHERE id = ?";
        let result = match self.pool.driver() {
            DatabaseDriver::Sqlite => sqlx::query(query)
                .bind(at)
                .bind(id)
                .execute(sqlite(&self.pool)?)
                .await
                .map(|_| ()),
            DatabaseDriver::Mysql => sqlx::query(query)
                .bind(at)
                .bind(id)
                .execute(mysql(&self.pool)?)
                .await
                .map(|_| ()),
        };

        result.context("Failed to update last login")
    }
}

const SELECT_COLUMNS: &str =
    "SELECT id, email, password_hash, is_active, last_login_at, created_at, updated_at FROM users";

// ============================================================================
// SQLite implementations
// ============================================================================

async fn create_user_sqlite(pool: &SqlitePool, user: &User) -> Result<User> {
    let result = sqlx::query(
        r#"
        INSERT INTO users (email, password_hash, is_active, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&user.email)
    .bind(&user.password_hash)
    .bind(user.is_active)
    .bind(user.created_at)
    .bind(user.updated_at)
    .execute(pool)
    .await
    .context("Failed to create user")?;

    Ok(User {
        id: result.last_insert_rowid(),
        ..user.clone()
    })
}

fn row_to_user_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        is_active: row.try_get("is_active")?,
        last_login_at: row.try_get("last_login_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// ============================================================================
// MySQL implementations
// ============================================================================

async fn create_user_mysql(pool: &MySqlPool, user: &User) -> Result<User> {
    let result = sqlx::query(
        r#"
        INSERT INTO users (email, password_hash, is_active, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&user.email)
    .bind(&user.password_hash)
    .bind(user.is_active)
    .bind(user.created_at)
    .bind(user.updated_at)
    .execute(pool)
    .await
    .context("Failed to create user")?;

    Ok(User {
        id: result.last_insert_id() as i64,
        ..user.clone()
    })
}

fn row_to_user_mysql(row: &sqlx::mysql::MySqlRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        is_active: row.try_get("is_active")?,
        last_login_at: row.try_get("last_login_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Whether an error from `create` was a unique-constraint violation on email
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<sqlx::Error>()
            .and_then(|e| match e {
                sqlx::Error::Database(db) => Some(db.is_unique_violation()),
                _ => None,
            })
            .unwrap_or(false)
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// User store whose calls never complete
    pub struct HangingUsers;

    #[async_trait]
    impl UserRepository for HangingUsers {
        async fn create(&self, _: &User) -> Result<User> {
            std::future::pending().await
        }
        async fn get_by_id(&self, _: i64) -> Result<Option<User>> {
            std::future::pending().await
        }
        async fn get_by_email(&self, _: &str) -> Result<Option<User>> {
            std::future::pending().await
        }
        async fn set_active(&self, _: i64, _: bool) -> Result<()> {
            std::future::pending().await
        }
        async fn update_password(&self, _: i64, _: &str) -> Result<()> {
            std::future::pending().await
        }
        async fn update_last_login(&self, _: i64, _: DateTime<Utc>) -> Result<()> {
            std::future::pending().await
        }
    }
}
