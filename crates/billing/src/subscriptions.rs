//! Subscription synchronization
//!
//! Mirrors Stripe subscription objects into the `subscriptions` table and
//! keeps the owning profile's tier in line with the authoritative
//! subscription. Rows are created and updated only by webhook reconciliation,
//! never directly by end users.

use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use stripe::{Subscription, SubscriptionStatus as StripeSubStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use nexus_shared::{SubscriptionStatus, Tier};

use crate::client::{StripeClient, StripeConfig};
use crate::error::{BillingError, BillingResult};
use crate::profiles::ProfileService;

/// A mirrored subscription row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub stripe_subscription_id: String,
    pub stripe_customer_id: Option<String>,
    pub tier: String,
    pub status: String,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
}

/// Outcome of syncing one Stripe subscription object
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub status: SubscriptionStatus,
    pub tier: Tier,
    /// Previous tier when the sync changed the profile's tier
    pub previous_tier: Option<Tier>,
}

/// Map Stripe's subscription status onto our five-state enum
fn map_status(status: StripeSubStatus) -> SubscriptionStatus {
    match status {
        StripeSubStatus::Active => SubscriptionStatus::Active,
        StripeSubStatus::Trialing => SubscriptionStatus::Trialing,
        StripeSubStatus::PastDue | StripeSubStatus::Unpaid => SubscriptionStatus::PastDue,
        StripeSubStatus::Incomplete | StripeSubStatus::Paused => SubscriptionStatus::Incomplete,
        StripeSubStatus::Canceled | StripeSubStatus::IncompleteExpired => {
            SubscriptionStatus::Canceled
        }
    }
}

/// Subscription service for mirroring Stripe subscriptions
pub struct SubscriptionService {
    stripe: StripeClient,
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    pub fn stripe(&self) -> &StripeClient {
        &self.stripe
    }

    /// Derive the tier a Stripe subscription entitles: price-id mapping
    /// first, `metadata.tier` as fallback for manually-created prices.
    pub fn derive_tier(config: &StripeConfig, subscription: &Subscription) -> Option<Tier> {
        let from_price = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .and_then(|price| config.tier_for_price_id(price.id.as_str()));

        from_price.or_else(|| {
            subscription
                .metadata
                .get("tier")
                .and_then(|t| Tier::parse(t))
        })
    }

    /// Upsert the subscription row keyed by its Stripe subscription ID and
    /// align the profile's tier, all inside the caller's transaction.
    pub async fn sync_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        config: &StripeConfig,
        user_id: Uuid,
        subscription: &Subscription,
    ) -> BillingResult<SyncOutcome> {
        let status = map_status(subscription.status);
        let tier = Self::derive_tier(config, subscription).ok_or_else(|| {
            BillingError::EventPayloadMismatch(format!(
                "subscription {} has no recognizable price or tier metadata",
                subscription.id
            ))
        })?;

        let customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(c) => c.id.to_string(),
        };

        let current_period_start =
            OffsetDateTime::from_unix_timestamp(subscription.current_period_start).ok();
        let current_period_end =
            OffsetDateTime::from_unix_timestamp(subscription.current_period_end).ok();
        let canceled_at = subscription
            .canceled_at
            .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok());

        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, user_id, stripe_subscription_id, stripe_customer_id, tier, status,
                current_period_start, current_period_end, cancel_at_period_end, canceled_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                tier = EXCLUDED.tier,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                canceled_at = EXCLUDED.canceled_at,
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(subscription.id.as_str())
        .bind(&customer_id)
        .bind(tier.as_str())
        .bind(status.as_str())
        .bind(current_period_start)
        .bind(current_period_end)
        .bind(subscription.cancel_at_period_end)
        .bind(canceled_at)
        .execute(&mut **tx)
        .await?;

        // A terminal subscription no longer drives the tier; the profile
        // falls back to demo.
        let effective_tier = if status.is_terminal() { Tier::Demo } else { tier };

        let old_tier = ProfileService::set_tier_in_tx(tx, user_id, effective_tier).await?;
        let previous_tier = old_tier.filter(|t| *t != effective_tier);

        Ok(SyncOutcome {
            status,
            tier: effective_tier,
            previous_tier,
        })
    }

    /// Mark a subscription terminal and downgrade its owner to demo tier,
    /// inside the caller's transaction. Returns the owning user.
    pub async fn cancel_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        stripe_subscription_id: &str,
        canceled_at: Option<OffsetDateTime>,
    ) -> BillingResult<Uuid> {
        let user_id: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET status = 'canceled', canceled_at = COALESCE($2, NOW()), updated_at = NOW()
            WHERE stripe_subscription_id = $1
            RETURNING user_id
            "#,
        )
        .bind(stripe_subscription_id)
        .bind(canceled_at)
        .fetch_optional(&mut **tx)
        .await?;

        let user_id = user_id.map(|(id,)| id).ok_or_else(|| {
            BillingError::SubscriptionNotFound(stripe_subscription_id.to_string())
        })?;

        ProfileService::set_tier_in_tx(tx, user_id, Tier::Demo).await?;

        Ok(user_id)
    }

    /// Mark a subscription past_due after a failed invoice, inside the
    /// caller's transaction. The tier is left untouched until Stripe's
    /// dunning flow resolves one way or the other.
    pub async fn mark_past_due_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        stripe_subscription_id: &str,
    ) -> BillingResult<Uuid> {
        let user_id: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET status = 'past_due', updated_at = NOW()
            WHERE stripe_subscription_id = $1
            RETURNING user_id
            "#,
        )
        .bind(stripe_subscription_id)
        .fetch_optional(&mut **tx)
        .await?;

        user_id.map(|(id,)| id).ok_or_else(|| {
            BillingError::SubscriptionNotFound(stripe_subscription_id.to_string())
        })
    }

    /// The authoritative (non-terminal) subscription for a user, if any
    pub async fn get_active(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let record: Option<SubscriptionRecord> = sqlx::query_as(
            r#"
            SELECT id, user_id, stripe_subscription_id, stripe_customer_id, tier, status,
                   current_period_start, current_period_end, cancel_at_period_end, canceled_at
            FROM subscriptions
            WHERE user_id = $1 AND status != 'canceled'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Look up the owner and tier stored for a mirrored subscription
    pub async fn tier_for_subscription_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<(Uuid, Tier)>> {
        let row: Option<(Uuid, String)> = sqlx::query_as(
            "SELECT user_id, tier FROM subscriptions WHERE stripe_subscription_id = $1",
        )
        .bind(stripe_subscription_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row.and_then(|(user_id, tier)| Tier::parse(&tier).map(|t| (user_id, t))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping_collapses_stripe_states() {
        assert_eq!(map_status(StripeSubStatus::Active), SubscriptionStatus::Active);
        assert_eq!(
            map_status(StripeSubStatus::Trialing),
            SubscriptionStatus::Trialing
        );
        assert_eq!(map_status(StripeSubStatus::PastDue), SubscriptionStatus::PastDue);
        assert_eq!(map_status(StripeSubStatus::Unpaid), SubscriptionStatus::PastDue);
        assert_eq!(
            map_status(StripeSubStatus::Canceled),
            SubscriptionStatus::Canceled
        );
        assert_eq!(
            map_status(StripeSubStatus::IncompleteExpired),
            SubscriptionStatus::Canceled
        );
    }

    #[test]
    fn test_terminal_status_is_only_canceled() {
        assert!(map_status(StripeSubStatus::Canceled).is_terminal());
        assert!(!map_status(StripeSubStatus::PastDue).is_terminal());
        assert!(!map_status(StripeSubStatus::Incomplete).is_terminal());
    }
}
