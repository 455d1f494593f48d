//! Services layer - Business logic
//!
//! This module contains the authentication services for Tradepost.
//! Services are responsible for:
//! - Implementing the session and login rules
//! - Coordinating between repositories and cache
//! - Handling validation and error cases

pub mod account;
pub mod anti_bot;
pub mod clock;
pub mod login_guard;
pub mod password;
pub mod rate_limiter;
pub mod session;
pub mod token;

pub use account::{validate_email, AccountService, LogNotifier, ResetNotifier};
pub use anti_bot::{BotRejection, FormGuard, FormSignals};
pub use clock::{Clock, SystemClock};
pub use login_guard::{AuthError, ClientInfo, LoginGuard};
pub use password::{hash_password, verify_password};
pub use rate_limiter::{RateLimitAction, RateLimited, RateLimiter};
pub use session::{RevokeAllReport, SessionError, SessionManager};
