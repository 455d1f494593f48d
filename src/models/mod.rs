//! Data models
//!
//! Data structures shared by the session subsystem:
//! - Database entities (User, Session, PasswordReset)
//! - Cache boundary conversions for sessions

mod password_reset;
mod session;
mod user;

pub use password_reset::PasswordReset;
pub use session::{Session, MAX_USER_AGENT_LEN};
pub use user::{normalize_email, User};
