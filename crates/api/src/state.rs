//! Application state

use sqlx::PgPool;
use std::sync::Arc;

use nexus_billing::BillingService;
use nexus_shared::RateLimiter;

use crate::{
    auth::{AuthState, JwtVerifier},
    config::Config,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
    pub jwt_verifier: JwtVerifier,
    pub rate_limiter: RateLimiter,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let billing = BillingService::from_env(pool.clone())?;
        tracing::info!("Stripe billing service initialized");

        let jwt_verifier = JwtVerifier::new(&config.supabase_jwt_secret);
        tracing::info!("Supabase JWT validation enabled");

        let rate_limiter = RateLimiter::new_in_memory();
        tracing::info!("Rate limiter initialized");

        Ok(Self {
            pool,
            config,
            billing: Arc::new(billing),
            jwt_verifier,
            rate_limiter,
        })
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_verifier: self.jwt_verifier.clone(),
        }
    }
}
