//! Anti-bot form heuristics
//!
//! Two cheap signals on public forms:
//! - a honeypot field that is hidden from humans and must stay empty
//! - a render timestamp; submissions faster than a human could type are dropped
//!
//! Both failures surface to the client as the same generic message.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::config::AntiBotConfig;

/// Signals submitted alongside a public form
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormSignals {
    /// Hidden field; humans leave it empty
    #[serde(default)]
    pub honeypot: Option<String>,
    /// Unix seconds at which the form was rendered
    #[serde(default)]
    pub form_time: Option<i64>,
}

/// Why a submission was classified as automated
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BotRejection {
    #[error("honeypot field was filled")]
    Honeypot,
    #[error("form submitted too quickly")]
    TooFast,
}

/// Stateless form checker
#[derive(Debug, Clone)]
pub struct FormGuard {
    min_form_seconds: i64,
}

impl FormGuard {
    pub fn new(config: &AntiBotConfig) -> Self {
        Self {
            min_form_seconds: config.min_form_seconds,
        }
    }

    /// Classify a submission. A missing timestamp passes.
    pub fn check(&self, signals: &FormSignals, now: DateTime<Utc>) -> Result<(), BotRejection> {
        if signals
            .honeypot
            .as_deref()
            .is_some_and(|value| !value.trim().is_empty())
        {
            return Err(BotRejection::Honeypot);
        }

        if let Some(rendered_at) = signals.form_time {
            // Client-supplied; saturate instead of overflowing on extreme values
            if now.timestamp().saturating_sub(rendered_at) < self.min_form_seconds {
                return Err(BotRejection::TooFast);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> FormGuard {
        FormGuard::new(&AntiBotConfig { min_form_seconds: 3 })
    }

    fn signals(honeypot: Option<&str>, form_time: Option<i64>) -> FormSignals {
        FormSignals {
            honeypot: honeypot.map(str::to_string),
            form_time,
        }
    }

    #[test]
    fn test_clean_submission_passes() {
        let now = Utc::now();
        assert_eq!(
            guard().check(&signals(None, Some(now.timestamp() - 10)), now),
            Ok(())
        );
        assert_eq!(guard().check(&signals(Some(""), None), now), Ok(()));
        assert_eq!(guard().check(&signals(Some("   "), None), now), Ok(()));
    }

    #[test]
    fn test_honeypot_rejected() {
        let now = Utc::now();
        assert_eq!(
            guard().check(&signals(Some("http://spam.example"), None), now),
            Err(BotRejection::Honeypot)
        );
    }

    #[test]
    fn test_honeypot_checked_before_timing() {
        let now = Utc::now();
        assert_eq!(
            guard().check(&signals(Some("x"), Some(now.timestamp())), now),
            Err(BotRejection::Honeypot)
        );
    }

    #[test]
    fn test_fast_submission_rejected() {
        let now = Utc::now();
        assert_eq!(
            guard().check(&signals(None, Some(now.timestamp() - 1)), now),
            Err(BotRejection::TooFast)
        );
        // Clock skew putting the render time in the future is also too fast
        assert_eq!(
            guard().check(&signals(None, Some(now.timestamp() + 60)), now),
            Err(BotRejection::TooFast)
        );
    }

    #[test]
    fn test_threshold_is_inclusive_for_humans() {
        let now = Utc::now();
        assert_eq!(
            guard().check(&signals(None, Some(now.timestamp() - 3)), now),
            Ok(())
        );
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let now = Utc::now();
        assert_eq!(guard().check(&signals(None, Some(i64::MIN)), now), Ok(()));
        assert_eq!(
            guard().check(&signals(None, Some(i64::MAX)), now),
            Err(BotRejection::TooFast)
        );
    }

    #[test]
    fn test_missing_timestamp_passes() {
        assert_eq!(guard().check(&FormSignals::default(), Utc::now()), Ok(()));
    }
}
