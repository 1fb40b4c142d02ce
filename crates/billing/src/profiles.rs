//! Profile store
//!
//! One row per authenticated user: tier, denormalized credit balance, scan
//! counters, and the Stripe customer binding. Tier transitions happen only
//! through subscription sync; balance changes only through the ledger.
//! Profiles are soft-deleted so scans and ledger rows keep referencing them.

use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use nexus_shared::Tier;

use crate::error::{BillingError, BillingResult};
use crate::ledger::{CreditLedger, CreditTransactionType};

/// A user profile row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Profile {
    pub id: Uuid,
    pub email: String,
    pub tier: String,
    pub credits_balance: i64,
    pub monthly_scan_limit: i32,
    pub monthly_scans_used: i32,
    pub stripe_customer_id: Option<String>,
    pub deleted_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// The trial grant belongs to the insert that actually created the row; a
/// replayed signup call must not grant a second time.
fn trial_grant(newly_created: bool, tier: Tier) -> Option<i64> {
    let credits = tier.signup_credits();
    (newly_created && credits > 0).then_some(credits)
}

/// Service managing user profiles
#[derive(Clone)]
pub struct ProfileService {
    pool: PgPool,
}

impl ProfileService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a profile on signup. Demo accounts receive their one-time
    /// trial credit grant through the ledger so the grant is auditable. A
    /// replayed signup call finds the row already present and grants nothing.
    pub async fn create(&self, user_id: Uuid, email: &str) -> BillingResult<Profile> {
        let tier = Tier::Demo;

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO profiles (id, email, tier, credits_balance, monthly_scan_limit, monthly_scans_used)
            VALUES ($1, $2, $3, 0, $4, 0)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(email)
        .bind(tier.as_str())
        .bind(tier.monthly_scan_limit())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if let Some(credits) = trial_grant(inserted, tier) {
            CreditLedger::post_in_tx(
                &mut tx,
                user_id,
                credits,
                CreditTransactionType::CreditBonus,
                None,
                "Signup trial credits",
            )
            .await?;
        }

        tx.commit().await?;

        if inserted {
            tracing::info!(user_id = %user_id, tier = %tier, "Profile created");
        } else {
            tracing::debug!(user_id = %user_id, "Profile already exists, signup replayed");
        }
        self.get(user_id).await
    }

    pub async fn get(&self, user_id: Uuid) -> BillingResult<Profile> {
        let profile: Option<Profile> = sqlx::query_as(
            r#"
            SELECT id, email, tier, credits_balance, monthly_scan_limit, monthly_scans_used,
                   stripe_customer_id, deleted_at, created_at, updated_at
            FROM profiles
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        profile.ok_or(BillingError::ProfileNotFound(user_id))
    }

    /// Resolve a profile by its Stripe customer ID
    pub async fn get_by_customer(&self, customer_id: &str) -> BillingResult<Profile> {
        let profile: Option<Profile> = sqlx::query_as(
            r#"
            SELECT id, email, tier, credits_balance, monthly_scan_limit, monthly_scans_used,
                   stripe_customer_id, deleted_at, created_at, updated_at
            FROM profiles
            WHERE stripe_customer_id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        profile.ok_or_else(|| BillingError::CustomerNotFound(customer_id.to_string()))
    }

    /// Bind a Stripe customer ID to a profile (checkout completion)
    pub async fn attach_customer(&self, user_id: Uuid, customer_id: &str) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE profiles
            SET stripe_customer_id = $2, updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::ProfileNotFound(user_id));
        }

        tracing::info!(user_id = %user_id, customer_id = %customer_id, "Stripe customer attached");
        Ok(())
    }

    /// Set the tier inside the caller's transaction. Returns the previous
    /// tier so callers can tell whether anything changed.
    ///
    /// Tier transitions only flow through subscription sync; nothing else in
    /// the codebase calls this.
    pub async fn set_tier_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        tier: Tier,
    ) -> BillingResult<Option<Tier>> {
        let previous: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE profiles p
            SET tier = $2, monthly_scan_limit = $3, updated_at = NOW()
            FROM (SELECT id, tier AS old_tier FROM profiles WHERE id = $1) prev
            WHERE p.id = prev.id AND p.deleted_at IS NULL
            RETURNING prev.old_tier
            "#,
        )
        .bind(user_id)
        .bind(tier.as_str())
        .bind(tier.monthly_scan_limit())
        .fetch_optional(&mut **tx)
        .await?;

        match previous {
            Some((old,)) => Ok(Tier::parse(&old)),
            None => Err(BillingError::ProfileNotFound(user_id)),
        }
    }

    /// Soft-delete a profile. The row stays while scans and ledger entries
    /// reference it.
    pub async fn soft_delete(&self, user_id: Uuid) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE profiles SET deleted_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::ProfileNotFound(user_id));
        }

        tracing::info!(user_id = %user_id, "Profile soft-deleted");
        Ok(())
    }
}
