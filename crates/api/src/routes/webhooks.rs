//! Stripe webhook endpoint
//!
//! Verification happens synchronously over the raw body before anything is
//! stored. A forged request gets a 400 and leaves no trace. Retryable
//! processing failures return 500 so Stripe redelivers; permanent failures
//! are acknowledged with 200 because redelivery cannot fix them (the stored
//! event row carries the error for review).

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use nexus_billing::{BillingError, WebhookOutcome};

use crate::{error::ApiError, state::AppState};

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let signature = headers
        .get("Stripe-Signature")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing Stripe-Signature header".to_string()))?;

    let event = state.billing.webhooks.verify_event(&body, signature)?;

    match state.billing.webhooks.handle_event(event, &body).await {
        Ok(outcome) => {
            let outcome_str = match outcome {
                WebhookOutcome::Processed => "processed",
                WebhookOutcome::Ignored => "ignored",
                WebhookOutcome::Duplicate => "duplicate",
            };
            Ok((
                StatusCode::OK,
                Json(json!({ "received": true, "outcome": outcome_str })),
            ))
        }
        Err(e) if e.is_retryable() => {
            // 500 asks Stripe to redeliver; the event row stays claimed-free
            Err(ApiError::Internal(e.to_string()))
        }
        Err(BillingError::RetriesExhausted(event_id)) => {
            tracing::error!(event_id = %event_id, "Webhook event exhausted retries");
            Ok((
                StatusCode::OK,
                Json(json!({ "received": true, "outcome": "needs_review" })),
            ))
        }
        Err(e) => {
            // Permanent failure: acknowledge so Stripe stops redelivering,
            // the stored row carries the error for the replay job and review
            tracing::error!(error = %e, "Webhook event failed permanently");
            Ok((
                StatusCode::OK,
                Json(json!({ "received": true, "outcome": "failed" })),
            ))
        }
    }
}
