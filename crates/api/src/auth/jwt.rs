//! Supabase JWT verification
//!
//! The auth service issues HS256 tokens; this side only verifies. The subject
//! claim is the profile id, which is all the billing endpoints need.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use uuid::Uuid;

/// Claims carried by a Supabase access token
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    pub email: Option<String>,
    /// Expiry, unix seconds
    pub exp: i64,
    #[serde(default)]
    pub aud: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Verifies Supabase-issued access tokens
#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let decoding_key = DecodingKey::from_secret(secret.as_bytes());
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&["authenticated"]);
        Self {
            decoding_key,
            validation,
        }
    }

    /// Verify a token and return its claims
    pub fn verify(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;
        Ok(data.claims)
    }

    /// Verify a token and parse its subject as a user id
    pub fn verify_user_id(&self, token: &str) -> Option<(Uuid, Option<String>)> {
        let claims = self.verify(token).ok()?;
        let user_id = Uuid::parse_str(&claims.sub).ok()?;
        Some((user_id, claims.email))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    const SECRET: &str = "test-jwt-secret";

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        email: Option<String>,
        exp: i64,
        aud: String,
    }

    fn issue(sub: &str, exp_offset: i64, aud: &str, secret: &str) -> String {
        let claims = TestClaims {
            sub: sub.to_string(),
            email: Some("user@example.com".to_string()),
            exp: time::OffsetDateTime::now_utc().unix_timestamp() + exp_offset,
            aud: aud.to_string(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token_verifies() {
        let verifier = JwtVerifier::new(SECRET);
        let user_id = Uuid::new_v4();
        let token = issue(&user_id.to_string(), 3600, "authenticated", SECRET);

        let (parsed_id, email) = verifier.verify_user_id(&token).unwrap();
        assert_eq!(parsed_id, user_id);
        assert_eq!(email.as_deref(), Some("user@example.com"));
    }

    #[test]
    fn test_expired_token_rejected() {
        let verifier = JwtVerifier::new(SECRET);
        let token = issue(&Uuid::new_v4().to_string(), -3600, "authenticated", SECRET);
        assert!(verifier.verify_user_id(&token).is_none());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let verifier = JwtVerifier::new(SECRET);
        let token = issue(&Uuid::new_v4().to_string(), 3600, "authenticated", "other-secret");
        assert!(verifier.verify_user_id(&token).is_none());
    }

    #[test]
    fn test_wrong_audience_rejected() {
        let verifier = JwtVerifier::new(SECRET);
        let token = issue(&Uuid::new_v4().to_string(), 3600, "anon", SECRET);
        assert!(verifier.verify_user_id(&token).is_none());
    }

    #[test]
    fn test_non_uuid_subject_rejected() {
        let verifier = JwtVerifier::new(SECRET);
        let token = issue("not-a-uuid", 3600, "authenticated", SECRET);
        assert!(verifier.verify_user_id(&token).is_none());
    }
}
