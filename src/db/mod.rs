//! Database layer
//!
//! Durable storage for users, sessions and password reset tokens.
//! It supports:
//! - SQLite (default, for single-binary deployment)
//! - MySQL (for larger deployments)
//!
//! The database is the authoritative record of which sessions exist; the
//! cache layer only mirrors it.
//!
//! # Usage
//!
//! ```ignore
//! use tradepost::config::DatabaseConfig;
//! use tradepost::db::{create_pool, migrations};
//!
//! let pool = create_pool(&DatabaseConfig::default()).await?;
//! migrations::run_migrations(&pool).await?;
//! pool.ping().await?;
//! ```

pub mod migrations;
pub mod pool;
pub mod repositories;

pub use pool::{
    create_pool, create_test_pool, DatabasePool, DynDatabasePool, MysqlDatabase, SqliteDatabase,
};
