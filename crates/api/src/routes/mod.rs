//! HTTP route definitions

pub mod billing;
pub mod webhooks;

use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::{
    auth::{require_auth, AuthUser},
    error::ApiError,
    state::AppState,
};

/// Requests per minute allowed on authenticated routes, per user
const REQUESTS_PER_MINUTE: u32 = 60;

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/billing/profile", get(billing::get_profile))
        .route("/api/billing/balance", get(billing::get_balance))
        .route("/api/billing/transactions", get(billing::get_transactions))
        .route("/api/billing/subscription", get(billing::get_subscription))
        .route(
            "/api/billing/users/{user_id}/transactions",
            get(billing::get_user_transactions),
        )
        // Layer order: auth runs first (outermost), then the rate limit
        // check against the authenticated user
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .route_layer(middleware::from_fn_with_state(
            state.auth_state(),
            require_auth,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .merge(protected)
        .with_state(state)
}

/// Per-user request throttle; callers receive 429 with Retry-After and are
/// expected to back off
async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(user) = request.extensions().get::<AuthUser>() {
        let result = state.rate_limiter.check(user.user_id, REQUESTS_PER_MINUTE);
        if !result.allowed {
            return Err(ApiError::RateLimited {
                retry_after_seconds: result.retry_after_seconds.unwrap_or(60),
            });
        }
    }
    Ok(next.run(request).await)
}

/// Liveness probe
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
