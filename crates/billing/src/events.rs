//! Billing audit log
//!
//! Append-only `audit_logs` rows recording every billing-relevant state
//! change: who (actor), what (event type), and enough context to reconstruct
//! the change. Billing-state inconsistencies never silently resolve; they
//! surface here and stay queryable.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

/// Who triggered a billing event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    User,
    Stripe,
    System,
    Admin,
}

impl ActorType {
    fn as_str(&self) -> &'static str {
        match self {
            ActorType::User => "user",
            ActorType::Stripe => "stripe",
            ActorType::System => "system",
            ActorType::Admin => "admin",
        }
    }
}

/// Billing event types written to the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingEventType {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionCanceled,
    InvoicePaid,
    InvoiceFailed,
    CreditsGranted,
    CreditsPurchased,
    TierChanged,
    WebhookRetriesExhausted,
}

impl BillingEventType {
    fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::SubscriptionCreated => "subscription_created",
            BillingEventType::SubscriptionUpdated => "subscription_updated",
            BillingEventType::SubscriptionCanceled => "subscription_canceled",
            BillingEventType::InvoicePaid => "invoice_paid",
            BillingEventType::InvoiceFailed => "invoice_failed",
            BillingEventType::CreditsGranted => "credits_granted",
            BillingEventType::CreditsPurchased => "credits_purchased",
            BillingEventType::TierChanged => "tier_changed",
            BillingEventType::WebhookRetriesExhausted => "webhook_retries_exhausted",
        }
    }
}

/// Builder for a single audit log entry
pub struct BillingEventBuilder {
    user_id: Option<Uuid>,
    event_type: BillingEventType,
    actor_type: ActorType,
    data: serde_json::Value,
    stripe_event_id: Option<String>,
    stripe_subscription_id: Option<String>,
}

impl BillingEventBuilder {
    pub fn new(user_id: Option<Uuid>, event_type: BillingEventType) -> Self {
        Self {
            user_id,
            event_type,
            actor_type: ActorType::System,
            data: serde_json::Value::Null,
            stripe_event_id: None,
            stripe_subscription_id: None,
        }
    }

    pub fn actor_type(mut self, actor: ActorType) -> Self {
        self.actor_type = actor;
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn stripe_event(mut self, event_id: &str) -> Self {
        self.stripe_event_id = Some(event_id.to_string());
        self
    }

    pub fn stripe_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.stripe_subscription_id = Some(subscription_id.into());
        self
    }
}

/// Writer for billing audit log entries
#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one audit log row. Failures are reported to the caller, who
    /// typically logs and continues, since audit writes never veto the billing
    /// mutation they describe.
    pub async fn log_event(&self, event: BillingEventBuilder) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs
                (id, user_id, event_type, actor_type, data, stripe_event_id, stripe_subscription_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.user_id)
        .bind(event.event_type.as_str())
        .bind(event.actor_type.as_str())
        .bind(&event.data)
        .bind(event.stripe_event_id.as_deref())
        .bind(event.stripe_subscription_id.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names_are_stable() {
        // These strings are queried by the ops dashboard; renaming them is a
        // data migration, not a refactor.
        assert_eq!(BillingEventType::InvoicePaid.as_str(), "invoice_paid");
        assert_eq!(
            BillingEventType::SubscriptionCanceled.as_str(),
            "subscription_canceled"
        );
        assert_eq!(
            BillingEventType::WebhookRetriesExhausted.as_str(),
            "webhook_retries_exhausted"
        );
    }

    #[test]
    fn test_builder_defaults() {
        let event = BillingEventBuilder::new(None, BillingEventType::TierChanged);
        assert_eq!(event.actor_type, ActorType::System);
        assert!(event.stripe_event_id.is_none());
    }
}
