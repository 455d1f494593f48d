//! Tradepost - authenticated sessions for a marketplace backend
//!
//! This library provides session management over a durable SQL store with
//! an optional volatile cache, plus the abuse protection around login and
//! public forms: rate limiting, failed-login lockout and anti-bot checks.

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod models;
pub mod services;
