//! Database repositories
//!
//! Repository pattern implementations for database access.
//! Each repository handles the queries for a single table.

pub mod password_reset;
pub mod session;
pub mod user;

pub use password_reset::{PasswordResetRepository, SqlxPasswordResetRepository};
pub use session::{SessionRepository, SqlxSessionRepository};
pub use user::{is_unique_violation, SqlxUserRepository, UserRepository};
