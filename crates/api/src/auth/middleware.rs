//! Authentication middleware for Axum
//!
//! Every protected request resolves to an explicit [`Actor`] carried in
//! request extensions. Handlers check access against that actor; there is no
//! ambient identity anywhere downstream.

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

use nexus_shared::context::Actor;

use super::jwt::JwtVerifier;

/// Authenticated user extracted from a verified JWT
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: Option<String>,
}

impl AuthUser {
    /// The request-scoped actor for access checks
    pub fn actor(&self) -> Actor {
        Actor::User(self.user_id)
    }
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_verifier: JwtVerifier,
}

#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = match self {
            AuthError::MissingToken => "Missing authorization token",
            AuthError::InvalidToken => "Invalid or expired token",
        };
        (StatusCode::UNAUTHORIZED, Json(json!({ "error": message }))).into_response()
    }
}

fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
}

/// Require a valid JWT; inserts [`AuthUser`] into request extensions
pub async fn require_auth(
    State(auth): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let token = extract_bearer_token(&request).ok_or(AuthError::MissingToken)?;

    let (user_id, email) = auth
        .jwt_verifier
        .verify_user_id(token)
        .ok_or(AuthError::InvalidToken)?;

    request.extensions_mut().insert(AuthUser { user_id, email });

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_user_maps_to_user_actor() {
        let user_id = Uuid::new_v4();
        let auth_user = AuthUser {
            user_id,
            email: None,
        };
        assert_eq!(auth_user.actor().user_id(), Some(user_id));
    }
}
