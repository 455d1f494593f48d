//! Contact form endpoint
//!
//! - POST /api/v1/contact - Accept a message for the marketplace team
//!
//! Submissions pass the anti-bot checks and a per-email rate limit. Delivery
//! of the message is handled elsewhere; this endpoint only gates it.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;

use crate::api::middleware::{ApiError, AppState};
use crate::models::normalize_email;
use crate::services::{validate_email, AuthError, RateLimitAction};
use crate::services::anti_bot::FormSignals;

const MAX_MESSAGE_LEN: usize = 5000;

/// Request body for the contact form
#[derive(Debug, Deserialize)]
pub struct ContactRequest {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    pub message: String,
    #[serde(flatten)]
    pub signals: FormSignals,
}

/// POST /api/v1/contact
pub async fn submit(
    State(state): State<AppState>,
    Json(body): Json<ContactRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if let Err(reason) = state.forms.check(&body.signals, state.sessions.now()) {
        tracing::info!(form = "contact", reason = %reason, "Rejected automated submission");
        return Err(AuthError::from(reason).into());
    }

    let email = normalize_email(&body.email);
    validate_email(&email)?;

    let message = body.message.trim();
    if message.is_empty() {
        return Err(ApiError::validation_error("Message is required"));
    }
    if message.chars().count() > MAX_MESSAGE_LEN {
        return Err(ApiError::validation_error(format!(
            "Message must be at most {} characters",
            MAX_MESSAGE_LEN
        )));
    }

    state
        .limiter
        .check(RateLimitAction::Contact, &email)
        .await
        .map_err(AuthError::from)?;

    tracing::info!(
        has_name = body.name.is_some(),
        length = message.len(),
        "Contact message accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "message": "Message received" })),
    ))
}
