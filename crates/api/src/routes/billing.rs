//! Authenticated billing endpoints
//!
//! Read-only views over the caller's own billing state. All billing writes
//! happen through webhook reconciliation, never through these routes.

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use nexus_shared::context::AccessDecision;

use crate::{auth::AuthUser, error::ApiError, state::AppState};

const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 200;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

impl HistoryQuery {
    fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT)
    }
}

pub async fn get_profile(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let profile = state.billing.profiles.get(user.user_id).await?;
    Ok(Json(json!({ "profile": profile })))
}

pub async fn get_balance(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let balance = state.billing.ledger.balance(user.user_id).await?;
    Ok(Json(json!({ "credits_balance": balance })))
}

pub async fn get_transactions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let transactions = state
        .billing
        .ledger
        .history(user.user_id, query.limit())
        .await?;
    Ok(Json(json!({ "transactions": transactions })))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let subscription = state.billing.subscriptions.get_active(user.user_id).await?;
    Ok(Json(json!({ "subscription": subscription })))
}

/// Ledger history for an explicit user. The access check is against the
/// request's actor, so a user can only read their own rows; the service
/// actor (used by internal tooling) passes for any row.
pub async fn get_user_transactions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let AccessDecision::Denied { reason } = AccessDecision::check(user.actor(), user_id) {
        return Err(ApiError::Forbidden(reason));
    }

    let transactions = state.billing.ledger.history(user_id, query.limit()).await?;
    Ok(Json(json!({ "transactions": transactions })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_limit_clamped() {
        assert_eq!(HistoryQuery { limit: None }.limit(), DEFAULT_HISTORY_LIMIT);
        assert_eq!(HistoryQuery { limit: Some(0) }.limit(), 1);
        assert_eq!(HistoryQuery { limit: Some(10_000) }.limit(), MAX_HISTORY_LIMIT);
        assert_eq!(HistoryQuery { limit: Some(25) }.limit(), 25);
    }
}
