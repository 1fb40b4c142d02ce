// Shared crate clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Nexus SEO Intelligence Shared Library
//!
//! Common building blocks used by the API server, the billing crate, and the
//! background worker: database pool construction, migrations, domain types
//! (tiers, subscription status), and the request-scoped actor context.

pub mod context;
pub mod rate_limit;
pub mod types;

pub use context::{AccessDecision, Actor};
pub use rate_limit::{RateLimitResult, RateLimiter};
pub use types::{SubscriptionStatus, Tier};

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Create the main database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    tracing::info!("Database pool created");
    Ok(pool)
}

/// Create a pool for running migrations
///
/// Uses a single connection with longer timeouts; migrations must bypass
/// PgBouncer-style poolers that don't support prepared statements.
pub async fn create_migration_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await
}

/// Run embedded sqlx migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}
