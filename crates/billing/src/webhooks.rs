//! Stripe webhook handling
//!
//! The single write path for billing state. Every event goes through the same
//! pipeline: verify the signature at the boundary, claim the event row for
//! exclusive processing, apply all effects in one database transaction, and
//! mark the event processed in that same transaction. Replay of an already
//! processed event is a no-op; a crash between effects and the processed flag
//! cannot happen because they commit together.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::{PgPool, Postgres, Transaction};
use subtle::ConstantTimeEq;
use stripe::{CheckoutSession, CheckoutSessionMode, Event, EventObject, EventType, Invoice, Subscription};
use time::OffsetDateTime;
use uuid::Uuid;

use nexus_shared::Tier;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::ledger::{CreditLedger, CreditTransactionType};
use crate::plans::Plan;
use crate::profiles::ProfileService;
use crate::subscriptions::SubscriptionService;

type HmacSha256 = Hmac<Sha256>;

/// Maximum processing attempts before an event is left for manual review
pub const MAX_ATTEMPTS: i32 = 5;

/// Signed payloads older than this are rejected outright
const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// How long a processing claim is honored before another attempt may take
/// over a stuck event
const CLAIM_TIMEOUT_MINUTES: i32 = 30;

/// Outcome of handling one webhook delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Effects applied and the event marked processed
    Processed,
    /// Event type we do not act on; stored and acknowledged
    Ignored,
    /// Event was already fully processed by an earlier delivery
    Duplicate,
}

/// A stored webhook event row
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub stripe_event_id: String,
    pub event_type: String,
    pub processed: bool,
    pub processed_at: Option<OffsetDateTime>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Summary of a replay pass over unprocessed events
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ReplaySummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Parse a `Stripe-Signature` header into its timestamp and v1 signature
fn parse_signature_header(header: &str) -> Option<(i64, String)> {
    let mut timestamp: Option<i64> = None;
    let mut v1: Option<String> = None;

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => v1 = Some(value.to_string()),
            _ => {}
        }
    }

    Some((timestamp?, v1?))
}

/// Verify a webhook signature against the signing secret at a given clock
/// reading. Compares in constant time so the check leaks nothing about how
/// much of a forged signature matched.
fn verify_signature_at(
    payload: &str,
    signature_header: &str,
    secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let (timestamp, v1_signature) =
        parse_signature_header(signature_header).ok_or(BillingError::SignatureInvalid)?;

    if (now_unix - timestamp).abs() > TIMESTAMP_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::SignatureInvalid);
    }

    let signed_payload = format!("{timestamp}.{payload}");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::SignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = mac.finalize().into_bytes();

    let received = hex::decode(&v1_signature).map_err(|_| BillingError::SignatureInvalid)?;

    if computed.ct_eq(received.as_slice()).into() {
        Ok(())
    } else {
        Err(BillingError::SignatureInvalid)
    }
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    stripe: StripeClient,
    pool: PgPool,
    profiles: ProfileService,
    event_logger: BillingEventLogger,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let profiles = ProfileService::new(pool.clone());
        let event_logger = BillingEventLogger::new(pool.clone());
        Self {
            stripe,
            pool,
            profiles,
            event_logger,
        }
    }

    /// Verify the signature over the raw request body and parse the event.
    ///
    /// Rejection happens synchronously and leaves no trace in the event
    /// store; an attacker must not be able to create rows.
    pub fn verify_event(&self, payload: &str, signature_header: &str) -> BillingResult<Event> {
        let secret = &self.stripe.config().webhook_secret;
        let now = OffsetDateTime::now_utc().unix_timestamp();

        verify_signature_at(payload, signature_header, secret, now)?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Verified webhook payload failed to parse");
            BillingError::EventPayloadMismatch(e.to_string())
        })?;

        tracing::debug!(
            event_id = %event.id,
            event_type = %event.type_,
            "Webhook signature verified"
        );

        Ok(event)
    }

    /// Handle a verified event end to end: claim, apply effects, mark
    /// processed.
    ///
    /// The claim uses INSERT .. ON CONFLICT DO NOTHING RETURNING so only one
    /// concurrent delivery of the same event can win. Losers either find the
    /// event already processed (no-op success) or an attempt in flight
    /// (retryable, the provider will redeliver).
    pub async fn handle_event(&self, event: Event, payload: &str) -> BillingResult<WebhookOutcome> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();

        let payload_json: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| BillingError::EventPayloadMismatch(e.to_string()))?;

        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_events (stripe_event_id, event_type, payload, processing_started_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (stripe_event_id) DO NOTHING
            RETURNING stripe_event_id
            "#,
        )
        .bind(&event_id)
        .bind(&event_type)
        .bind(&payload_json)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_none() {
            // The row exists. Try to take it over as a retry; that only
            // succeeds for an unprocessed event whose previous claim has
            // expired and that still has attempts left.
            let reclaimed = self.reclaim(&event_id).await?;
            if !reclaimed {
                return self.classify_unclaimable(&event_id).await;
            }
            tracing::info!(event_id = %event_id, event_type = %event_type, "Retrying webhook event");
        } else {
            tracing::info!(event_id = %event_id, event_type = %event_type, "Processing webhook event");
        }

        match self.process_claimed(&event).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.record_failure(&event_id, &e).await;
                Err(e)
            }
        }
    }

    /// Take over an existing unprocessed event row for another attempt
    async fn reclaim(&self, event_id: &str) -> BillingResult<bool> {
        let reclaimed: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE stripe_events
            SET retry_count = retry_count + 1, processing_started_at = NOW()
            WHERE stripe_event_id = $1
              AND processed = false
              AND retry_count < $2
              AND (processing_started_at IS NULL
                   OR processing_started_at < NOW() - ($3 || ' minutes')::INTERVAL)
            RETURNING retry_count
            "#,
        )
        .bind(event_id)
        .bind(MAX_ATTEMPTS)
        .bind(CLAIM_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        Ok(reclaimed.is_some())
    }

    /// Explain why an existing row could not be claimed
    async fn classify_unclaimable(&self, event_id: &str) -> BillingResult<WebhookOutcome> {
        let row: Option<(bool, i32)> = sqlx::query_as(
            "SELECT processed, retry_count FROM stripe_events WHERE stripe_event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        let outcome = classify_event_row(event_id, row);
        if matches!(outcome, Ok(WebhookOutcome::Duplicate)) {
            tracing::info!(event_id = %event_id, "Duplicate webhook delivery, already processed");
        }
        outcome
    }

    /// Apply the event's effects and flip the processed flag in one
    /// transaction, then write audit entries best-effort.
    async fn process_claimed(&self, event: &Event) -> BillingResult<WebhookOutcome> {
        let event_id = event.id.to_string();

        let mut tx = self.pool.begin().await?;

        let (outcome, audit_entries) = self.apply_effects(&mut tx, event).await?;

        sqlx::query(
            r#"
            UPDATE stripe_events
            SET processed = true, processed_at = NOW(), error_message = NULL
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(&event_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        for entry in audit_entries {
            if let Err(e) = self.event_logger.log_event(entry).await {
                tracing::warn!(event_id = %event_id, error = %e, "Audit log write failed");
            }
        }

        tracing::info!(event_id = %event_id, outcome = ?outcome, "Webhook event processed");
        Ok(outcome)
    }

    /// Record a failed attempt and release the claim so the provider's
    /// redelivery or the replay job can try again.
    async fn record_failure(&self, event_id: &str, error: &BillingError) {
        let result = sqlx::query(
            r#"
            UPDATE stripe_events
            SET error_message = $2, processing_started_at = NULL
            WHERE stripe_event_id = $1 AND processed = false
            "#,
        )
        .bind(event_id)
        .bind(error.to_string())
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::error!(event_id = %event_id, error = %e, "Failed to record webhook failure");
        }

        tracing::error!(
            event_id = %event_id,
            error = %error,
            retryable = error.is_retryable(),
            "Webhook event processing failed"
        );
    }

    /// Dispatch by event type. All writes go through the supplied
    /// transaction; audit entries are returned for logging after commit.
    async fn apply_effects(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &Event,
    ) -> BillingResult<(WebhookOutcome, Vec<BillingEventBuilder>)> {
        let event_id = event.id.to_string();

        match event.type_ {
            EventType::CustomerSubscriptionCreated | EventType::CustomerSubscriptionUpdated => {
                let subscription = expect_subscription(event)?;
                let entries = self
                    .apply_subscription_sync(tx, &event_id, event.type_, subscription)
                    .await?;
                Ok((WebhookOutcome::Processed, entries))
            }
            EventType::CustomerSubscriptionDeleted => {
                let subscription = expect_subscription(event)?;
                let entries = self
                    .apply_subscription_deleted(tx, &event_id, subscription)
                    .await?;
                Ok((WebhookOutcome::Processed, entries))
            }
            EventType::InvoicePaymentSucceeded | EventType::InvoicePaid => {
                let invoice = expect_invoice(event)?;
                let entries = self.apply_invoice_paid(tx, &event_id, invoice).await?;
                Ok((WebhookOutcome::Processed, entries))
            }
            EventType::InvoicePaymentFailed => {
                let invoice = expect_invoice(event)?;
                let entries = self.apply_invoice_failed(tx, &event_id, invoice).await?;
                Ok((WebhookOutcome::Processed, entries))
            }
            EventType::CheckoutSessionCompleted => {
                let session = expect_checkout_session(event)?;
                let entries = self.apply_checkout_completed(tx, &event_id, session).await?;
                Ok((WebhookOutcome::Processed, entries))
            }
            _ => {
                tracing::debug!(
                    event_id = %event_id,
                    event_type = %event.type_,
                    "Ignoring unhandled webhook event type"
                );
                Ok((WebhookOutcome::Ignored, Vec::new()))
            }
        }
    }

    /// customer.subscription.created / .updated: mirror the subscription and
    /// align the profile tier.
    async fn apply_subscription_sync(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: &str,
        event_type: EventType,
        subscription: &Subscription,
    ) -> BillingResult<Vec<BillingEventBuilder>> {
        let user_id = self.resolve_subscription_owner(subscription).await?;

        let outcome =
            SubscriptionService::sync_in_tx(tx, self.stripe.config(), user_id, subscription)
                .await?;

        let billing_event = if event_type == EventType::CustomerSubscriptionCreated {
            BillingEventType::SubscriptionCreated
        } else {
            BillingEventType::SubscriptionUpdated
        };

        let mut entries = vec![BillingEventBuilder::new(Some(user_id), billing_event)
            .actor_type(ActorType::Stripe)
            .stripe_event(event_id)
            .stripe_subscription(subscription.id.as_str())
            .data(serde_json::json!({
                "status": outcome.status.as_str(),
                "tier": outcome.tier.as_str(),
            }))];

        if let Some(previous) = outcome.previous_tier {
            entries.push(
                BillingEventBuilder::new(Some(user_id), BillingEventType::TierChanged)
                    .actor_type(ActorType::Stripe)
                    .stripe_event(event_id)
                    .stripe_subscription(subscription.id.as_str())
                    .data(serde_json::json!({
                        "from": previous.as_str(),
                        "to": outcome.tier.as_str(),
                    })),
            );
        }

        Ok(entries)
    }

    /// customer.subscription.deleted: terminal status plus demo downgrade
    async fn apply_subscription_deleted(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: &str,
        subscription: &Subscription,
    ) -> BillingResult<Vec<BillingEventBuilder>> {
        let canceled_at = subscription
            .canceled_at
            .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok());

        let user_id =
            SubscriptionService::cancel_in_tx(tx, subscription.id.as_str(), canceled_at).await?;

        Ok(vec![BillingEventBuilder::new(
            Some(user_id),
            BillingEventType::SubscriptionCanceled,
        )
        .actor_type(ActorType::Stripe)
        .stripe_event(event_id)
        .stripe_subscription(subscription.id.as_str())
        .data(serde_json::json!({ "tier": Tier::Demo.as_str() }))])
    }

    /// invoice.payment_succeeded / invoice.paid: grant the tier's monthly
    /// credit allotment, once per invoice even when both event types fire.
    async fn apply_invoice_paid(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: &str,
        invoice: &Invoice,
    ) -> BillingResult<Vec<BillingEventBuilder>> {
        let invoice_id = invoice.id.to_string();
        let customer_id = invoice_customer_id(invoice)?;
        let profile = self.profiles.get_by_customer(&customer_id).await?;

        // invoice.paid and invoice.payment_succeeded arrive under different
        // event ids, so the claim does not serialize them. Lock the profile
        // row first; the loser's dedupe check then sees the winner's
        // committed grant. The partial unique index on subscription_grant
        // reference ids backs this up at the schema level.
        sqlx::query("SELECT 1 FROM profiles WHERE id = $1 FOR UPDATE")
            .bind(profile.id)
            .execute(&mut **tx)
            .await?;

        // The ledger row keyed by invoice id is the dedupe.
        let (already_granted,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM credit_transactions
                WHERE reference_id = $1 AND transaction_type = 'subscription_grant'
            )
            "#,
        )
        .bind(&invoice_id)
        .fetch_one(&mut **tx)
        .await?;

        if already_granted {
            tracing::info!(
                invoice_id = %invoice_id,
                "Invoice already granted credits, skipping"
            );
            return Ok(Vec::new());
        }

        let tier = match invoice_subscription_id(invoice) {
            Some(subscription_id) => {
                SubscriptionService::tier_for_subscription_in_tx(tx, &subscription_id)
                    .await?
                    .map(|(_, tier)| tier)
                    .or_else(|| Tier::parse(&profile.tier))
            }
            None => Tier::parse(&profile.tier),
        }
        .unwrap_or(Tier::Demo);

        let allotment = Plan::for_tier(tier).monthly_credits;
        if allotment == 0 {
            tracing::warn!(
                invoice_id = %invoice_id,
                tier = %tier,
                "Paid invoice for a tier with no credit allotment"
            );
            return Ok(Vec::new());
        }

        let balance_after = CreditLedger::post_in_tx(
            tx,
            profile.id,
            allotment,
            CreditTransactionType::SubscriptionGrant,
            Some(&invoice_id),
            &format!("Monthly credit allotment ({tier})"),
        )
        .await?;

        Ok(vec![
            BillingEventBuilder::new(Some(profile.id), BillingEventType::InvoicePaid)
                .actor_type(ActorType::Stripe)
                .stripe_event(event_id)
                .data(serde_json::json!({
                    "invoice_id": invoice_id,
                    "amount_paid": invoice.amount_paid,
                })),
            BillingEventBuilder::new(Some(profile.id), BillingEventType::CreditsGranted)
                .actor_type(ActorType::Stripe)
                .stripe_event(event_id)
                .data(serde_json::json!({
                    "invoice_id": invoice_id,
                    "tier": tier.as_str(),
                    "credits": allotment,
                    "balance_after": balance_after,
                })),
        ])
    }

    /// invoice.payment_failed: mark the subscription past_due. The tier is
    /// untouched; Stripe's dunning flow decides what happens next.
    async fn apply_invoice_failed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: &str,
        invoice: &Invoice,
    ) -> BillingResult<Vec<BillingEventBuilder>> {
        let Some(subscription_id) = invoice_subscription_id(invoice) else {
            // One-off invoice failures carry no subscription to mark
            tracing::debug!(invoice_id = %invoice.id, "Failed invoice has no subscription");
            return Ok(Vec::new());
        };

        let user_id = SubscriptionService::mark_past_due_in_tx(tx, &subscription_id).await?;

        Ok(vec![BillingEventBuilder::new(
            Some(user_id),
            BillingEventType::InvoiceFailed,
        )
        .actor_type(ActorType::Stripe)
        .stripe_event(event_id)
        .stripe_subscription(subscription_id)
        .data(serde_json::json!({ "invoice_id": invoice.id.as_str() }))])
    }

    /// checkout.session.completed: bind the Stripe customer to the profile,
    /// and for one-time payment sessions grant the purchased credit pack.
    async fn apply_checkout_completed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: &str,
        session: &CheckoutSession,
    ) -> BillingResult<Vec<BillingEventBuilder>> {
        let user_id = session
            .client_reference_id
            .as_deref()
            .and_then(|r| Uuid::parse_str(r).ok())
            .ok_or_else(|| {
                BillingError::EventPayloadMismatch(format!(
                    "checkout session {} has no usable client_reference_id",
                    session.id
                ))
            })?;

        let mut entries = Vec::new();

        if let Some(customer) = &session.customer {
            let customer_id = match customer {
                stripe::Expandable::Id(id) => id.to_string(),
                stripe::Expandable::Object(c) => c.id.to_string(),
            };
            sqlx::query(
                r#"
                UPDATE profiles
                SET stripe_customer_id = $2, updated_at = NOW()
                WHERE id = $1 AND deleted_at IS NULL
                "#,
            )
            .bind(user_id)
            .bind(&customer_id)
            .execute(&mut **tx)
            .await?;
        }

        // One-time payment sessions carry the purchased credit amount in
        // metadata; subscription sessions are handled by their own events.
        if session.mode == CheckoutSessionMode::Payment {
            let credits = session
                .metadata
                .as_ref()
                .and_then(|m| m.get("credits"))
                .and_then(|c| c.parse::<i64>().ok());

            if let Some(credits) = credits.filter(|c| *c > 0) {
                let balance_after = CreditLedger::post_in_tx(
                    tx,
                    user_id,
                    credits,
                    CreditTransactionType::CreditPurchase,
                    Some(session.id.as_str()),
                    "Credit pack purchase",
                )
                .await?;

                entries.push(
                    BillingEventBuilder::new(Some(user_id), BillingEventType::CreditsPurchased)
                        .actor_type(ActorType::User)
                        .stripe_event(event_id)
                        .data(serde_json::json!({
                            "session_id": session.id.as_str(),
                            "credits": credits,
                            "balance_after": balance_after,
                        })),
                );
            }
        }

        Ok(entries)
    }

    /// Find the profile a subscription belongs to: `metadata.user_id` first,
    /// then the Stripe customer binding.
    async fn resolve_subscription_owner(&self, subscription: &Subscription) -> BillingResult<Uuid> {
        if let Some(user_id) = subscription
            .metadata
            .get("user_id")
            .and_then(|v| Uuid::parse_str(v).ok())
        {
            return Ok(user_id);
        }

        let customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(c) => c.id.to_string(),
        };

        let profile = self.profiles.get_by_customer(&customer_id).await?;
        Ok(profile.id)
    }

    /// Re-drive unprocessed events from the store, oldest first. Used by the
    /// background replay job; respects the same claim rules as live
    /// deliveries.
    pub async fn replay_unprocessed(&self, limit: i64) -> BillingResult<ReplaySummary> {
        let rows: Vec<(String, serde_json::Value)> = sqlx::query_as(
            r#"
            SELECT stripe_event_id, payload
            FROM stripe_events
            WHERE processed = false
              AND retry_count < $1
              AND (processing_started_at IS NULL
                   OR processing_started_at < NOW() - ($2 || ' minutes')::INTERVAL)
            ORDER BY created_at ASC
            LIMIT $3
            "#,
        )
        .bind(MAX_ATTEMPTS)
        .bind(CLAIM_TIMEOUT_MINUTES)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = ReplaySummary::default();

        for (event_id, payload) in rows {
            summary.attempted += 1;

            let event: Event = match serde_json::from_value(payload) {
                Ok(event) => event,
                Err(e) => {
                    tracing::error!(event_id = %event_id, error = %e, "Stored payload failed to parse");
                    self.record_failure(
                        &event_id,
                        &BillingError::EventPayloadMismatch(e.to_string()),
                    )
                    .await;
                    summary.failed += 1;
                    continue;
                }
            };

            if !self.reclaim(&event_id).await? {
                // Claimed or finished by someone else since the select
                continue;
            }

            match self.process_claimed(&event).await {
                Ok(_) => summary.succeeded += 1,
                Err(e) => {
                    self.record_failure(&event_id, &e).await;
                    summary.failed += 1;
                }
            }
        }

        if summary.attempted > 0 {
            tracing::info!(
                attempted = summary.attempted,
                succeeded = summary.succeeded,
                failed = summary.failed,
                "Webhook replay pass complete"
            );
        }

        Ok(summary)
    }

    /// Flag events that have exhausted their attempts for manual review.
    /// Each event is flagged once; returns the newly flagged rows.
    pub async fn flag_exhausted_events(&self) -> BillingResult<Vec<WebhookEventRecord>> {
        let rows: Vec<WebhookEventRecord> = sqlx::query_as(
            r#"
            UPDATE stripe_events
            SET review_flagged_at = NOW()
            WHERE processed = false
              AND retry_count >= $1
              AND review_flagged_at IS NULL
            RETURNING stripe_event_id, event_type, processed, processed_at,
                      retry_count, error_message, created_at
            "#,
        )
        .bind(MAX_ATTEMPTS)
        .fetch_all(&self.pool)
        .await?;

        for record in &rows {
            tracing::error!(
                event_id = %record.stripe_event_id,
                event_type = %record.event_type,
                retry_count = record.retry_count,
                error = record.error_message.as_deref().unwrap_or("unknown"),
                "Webhook event exhausted retries, needs manual review"
            );

            let entry = BillingEventBuilder::new(None, BillingEventType::WebhookRetriesExhausted)
                .actor_type(ActorType::System)
                .stripe_event(&record.stripe_event_id)
                .data(serde_json::json!({
                    "event_type": record.event_type,
                    "retry_count": record.retry_count,
                    "error": record.error_message,
                }));

            if let Err(e) = self.event_logger.log_event(entry).await {
                tracing::warn!(error = %e, "Audit log write failed for exhausted event");
            }
        }

        Ok(rows)
    }

    /// Look up a stored event row
    pub async fn get_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        let record: Option<WebhookEventRecord> = sqlx::query_as(
            r#"
            SELECT stripe_event_id, event_type, processed, processed_at,
                   retry_count, error_message, created_at
            FROM stripe_events
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}

/// Decide what an unclaimable row means from its processed flag and attempt
/// count. A processed row is a duplicate delivery; an unprocessed one is
/// either mid-flight elsewhere or out of attempts.
fn classify_event_row(
    event_id: &str,
    row: Option<(bool, i32)>,
) -> BillingResult<WebhookOutcome> {
    match row {
        Some((true, _)) => Ok(WebhookOutcome::Duplicate),
        Some((false, retry_count)) if retry_count >= MAX_ATTEMPTS => {
            Err(BillingError::RetriesExhausted(event_id.to_string()))
        }
        Some((false, _)) => Err(BillingError::ProcessingInFlight(event_id.to_string())),
        None => Err(BillingError::Database(format!(
            "event row for {event_id} vanished during claim"
        ))),
    }
}

fn expect_subscription(event: &Event) -> BillingResult<&Subscription> {
    match &event.data.object {
        EventObject::Subscription(subscription) => Ok(subscription),
        other => Err(BillingError::EventPayloadMismatch(format!(
            "expected subscription object in {}, got {:?}",
            event.type_,
            std::mem::discriminant(other)
        ))),
    }
}

fn expect_invoice(event: &Event) -> BillingResult<&Invoice> {
    match &event.data.object {
        EventObject::Invoice(invoice) => Ok(invoice),
        other => Err(BillingError::EventPayloadMismatch(format!(
            "expected invoice object in {}, got {:?}",
            event.type_,
            std::mem::discriminant(other)
        ))),
    }
}

fn expect_checkout_session(event: &Event) -> BillingResult<&CheckoutSession> {
    match &event.data.object {
        EventObject::CheckoutSession(session) => Ok(session),
        other => Err(BillingError::EventPayloadMismatch(format!(
            "expected checkout session object in {}, got {:?}",
            event.type_,
            std::mem::discriminant(other)
        ))),
    }
}

fn invoice_customer_id(invoice: &Invoice) -> BillingResult<String> {
    match &invoice.customer {
        Some(stripe::Expandable::Id(id)) => Ok(id.to_string()),
        Some(stripe::Expandable::Object(c)) => Ok(c.id.to_string()),
        None => Err(BillingError::EventPayloadMismatch(format!(
            "invoice {} has no customer",
            invoice.id
        ))),
    }
}

fn invoice_subscription_id(invoice: &Invoice) -> Option<String> {
    invoice.subscription.as_ref().map(|s| match s {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(sub) => sub.id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    const SECRET: &str = "whsec_test_secret";

    fn sign(payload: &str, timestamp: i64, secret: &str) -> String {
        let signed_payload = format!("{timestamp}.{payload}");
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(signed_payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_valid_signature_verifies() {
        let payload = r#"{"id":"evt_1","type":"invoice.payment_succeeded"}"#;
        let now = 1_700_000_000;
        let sig = sign(payload, now, SECRET);
        let header = format!("t={now},v1={sig}");

        assert!(verify_signature_at(payload, &header, SECRET, now).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let sig = sign(payload, now, SECRET);
        let header = format!("t={now},v1={sig}");

        let result = verify_signature_at(r#"{"id":"evt_2"}"#, &header, SECRET, now);
        assert!(matches!(result, Err(BillingError::SignatureInvalid)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let sig = sign(payload, now, "whsec_other");
        let header = format!("t={now},v1={sig}");

        let result = verify_signature_at(payload, &header, SECRET, now);
        assert!(matches!(result, Err(BillingError::SignatureInvalid)));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let signed_at = 1_700_000_000;
        let sig = sign(payload, signed_at, SECRET);
        let header = format!("t={signed_at},v1={sig}");

        // 301 seconds later the signature is out of tolerance
        let result = verify_signature_at(payload, &header, SECRET, signed_at + 301);
        assert!(matches!(result, Err(BillingError::SignatureInvalid)));

        // At exactly the tolerance boundary it still passes
        assert!(verify_signature_at(payload, &header, SECRET, signed_at + 300).is_ok());
    }

    #[test]
    fn test_malformed_signature_header_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;

        for header in ["", "t=abc,v1=00", "v1=deadbeef", "t=1700000000", "nonsense"] {
            let result = verify_signature_at(payload, header, SECRET, now);
            assert!(
                matches!(result, Err(BillingError::SignatureInvalid)),
                "header {header:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_non_hex_signature_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let header = format!("t={now},v1=not-hex-at-all");

        let result = verify_signature_at(payload, &header, SECRET, now);
        assert!(matches!(result, Err(BillingError::SignatureInvalid)));
    }

    #[test]
    fn test_signature_header_parsing() {
        let (ts, v1) = parse_signature_header("t=1700000000,v1=abcdef,v0=legacy").unwrap();
        assert_eq!(ts, 1_700_000_000);
        assert_eq!(v1, "abcdef");

        assert!(parse_signature_header("t=1700000000").is_none());
        assert!(parse_signature_header("v1=abcdef").is_none());
    }

    // Fixture payloads shaped like real Stripe deliveries, exercised through
    // the same parse and dispatch helpers the handler uses.

    use crate::client::{PriceIds, StripeConfig};

    const USER_ID: &str = "a4f7b8d2-3c61-4e9a-9f2b-1d5c8e7a6b30";

    fn test_stripe_config() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: SECRET.to_string(),
            price_ids: PriceIds {
                pro_monthly: "price_pro_m".to_string(),
                ..PriceIds::default()
            },
        }
    }

    fn subscription_event_payload(event_type: &str, status: &str) -> String {
        format!(
            r#"{{
              "id": "evt_1SubFixture01",
              "object": "event",
              "created": 1700000000,
              "livemode": false,
              "pending_webhooks": 1,
              "type": "{event_type}",
              "data": {{
                "object": {{
                  "id": "sub_1Fixture01",
                  "object": "subscription",
                  "automatic_tax": {{"enabled": false}},
                  "billing_cycle_anchor": 1700000000,
                  "cancel_at_period_end": false,
                  "created": 1700000000,
                  "currency": "usd",
                  "current_period_start": 1700000000,
                  "current_period_end": 1702592000,
                  "customer": "cus_fixture1",
                  "items": {{
                    "object": "list",
                    "data": [{{
                      "id": "si_fixture1",
                      "object": "subscription_item",
                      "created": 1700000000,
                      "metadata": {{}},
                      "price": {{"id": "price_pro_m", "object": "price"}},
                      "quantity": 1
                    }}],
                    "has_more": false,
                    "url": "/v1/subscription_items?subscription=sub_1Fixture01"
                  }},
                  "livemode": false,
                  "metadata": {{"user_id": "{USER_ID}"}},
                  "start_date": 1700000000,
                  "status": "{status}"
                }}
              }}
            }}"#
        )
    }

    fn invoice_event_payload(event_type: &str) -> String {
        format!(
            r#"{{
              "id": "evt_1InvFixture01",
              "object": "event",
              "created": 1700000000,
              "livemode": false,
              "pending_webhooks": 1,
              "type": "{event_type}",
              "data": {{
                "object": {{
                  "id": "in_fixture1",
                  "object": "invoice",
                  "amount_due": 4900,
                  "amount_paid": 4900,
                  "created": 1700000000,
                  "currency": "usd",
                  "customer": "cus_fixture1",
                  "livemode": false,
                  "paid": true,
                  "period_end": 1702592000,
                  "period_start": 1700000000,
                  "status": "paid",
                  "subscription": "sub_1Fixture01",
                  "total": 4900
                }}
              }}
            }}"#
        )
    }

    fn checkout_event_payload() -> String {
        format!(
            r#"{{
              "id": "evt_1CsFixture01",
              "object": "event",
              "created": 1700000000,
              "livemode": false,
              "pending_webhooks": 1,
              "type": "checkout.session.completed",
              "data": {{
                "object": {{
                  "id": "cs_test_fixture1",
                  "object": "checkout.session",
                  "automatic_tax": {{"enabled": false}},
                  "client_reference_id": "{USER_ID}",
                  "created": 1700000000,
                  "currency": "usd",
                  "custom_fields": [],
                  "custom_text": {{}},
                  "customer": "cus_fixture1",
                  "expires_at": 1700086400,
                  "livemode": false,
                  "metadata": {{"credits": "50000"}},
                  "mode": "payment",
                  "payment_method_types": ["card"],
                  "payment_status": "paid",
                  "shipping_options": [],
                  "status": "complete",
                  "success_url": "https://example.com/done"
                }}
              }}
            }}"#
        )
    }

    #[test]
    fn test_subscription_fixture_parses_and_dispatches() {
        let payload = subscription_event_payload("customer.subscription.created", "active");
        let event: Event = serde_json::from_str(&payload).unwrap();

        assert_eq!(event.type_, EventType::CustomerSubscriptionCreated);
        let subscription = expect_subscription(&event).unwrap();
        assert_eq!(subscription.id.as_str(), "sub_1Fixture01");
        assert_eq!(
            subscription.metadata.get("user_id").map(String::as_str),
            Some(USER_ID)
        );

        let config = test_stripe_config();
        assert_eq!(
            SubscriptionService::derive_tier(&config, subscription),
            Some(Tier::Pro)
        );
    }

    #[test]
    fn test_invoice_fixture_parses_for_both_paid_event_types() {
        // Both deliveries reference the same invoice id, the grant dedupe key
        for event_type in ["invoice.payment_succeeded", "invoice.paid"] {
            let payload = invoice_event_payload(event_type);
            let event: Event = serde_json::from_str(&payload).unwrap();

            let invoice = expect_invoice(&event).unwrap();
            assert_eq!(invoice_customer_id(invoice).unwrap(), "cus_fixture1");
            assert_eq!(
                invoice_subscription_id(invoice).as_deref(),
                Some("sub_1Fixture01")
            );
            assert_eq!(invoice.amount_paid, Some(4900));
        }
    }

    #[test]
    fn test_checkout_fixture_parses_credit_pack_purchase() {
        let payload = checkout_event_payload();
        let event: Event = serde_json::from_str(&payload).unwrap();
        assert_eq!(event.type_, EventType::CheckoutSessionCompleted);

        let session = expect_checkout_session(&event).unwrap();
        assert_eq!(session.mode, CheckoutSessionMode::Payment);

        let user_id = session
            .client_reference_id
            .as_deref()
            .and_then(|r| Uuid::parse_str(r).ok());
        assert_eq!(user_id, Some(Uuid::parse_str(USER_ID).unwrap()));

        let credits = session
            .metadata
            .as_ref()
            .and_then(|m| m.get("credits"))
            .and_then(|c| c.parse::<i64>().ok());
        assert_eq!(credits, Some(50_000));
    }

    #[test]
    fn test_mismatched_event_object_rejected() {
        // Type tag says subscription but the nested object is an invoice
        let payload = invoice_event_payload("customer.subscription.created");
        let event: Event = serde_json::from_str(&payload).unwrap();
        assert!(matches!(
            expect_subscription(&event),
            Err(BillingError::EventPayloadMismatch(_))
        ));

        // And the other way around
        let payload = subscription_event_payload("invoice.paid", "active");
        let event: Event = serde_json::from_str(&payload).unwrap();
        assert!(matches!(
            expect_invoice(&event),
            Err(BillingError::EventPayloadMismatch(_))
        ));
    }

    #[test]
    fn test_signed_fixture_verifies_then_parses() {
        let payload = subscription_event_payload("customer.subscription.updated", "past_due");
        let now = 1_700_000_000;
        let sig = sign(&payload, now, SECRET);
        let header = format!("t={now},v1={sig}");

        verify_signature_at(&payload, &header, SECRET, now).unwrap();

        let event: Event = serde_json::from_str(&payload).unwrap();
        assert_eq!(event.type_, EventType::CustomerSubscriptionUpdated);
        assert!(expect_subscription(&event).is_ok());
    }

    #[test]
    fn test_unclaimable_row_classification() {
        assert_eq!(
            classify_event_row("evt_1", Some((true, 0))).unwrap(),
            WebhookOutcome::Duplicate
        );
        assert!(matches!(
            classify_event_row("evt_1", Some((false, MAX_ATTEMPTS))),
            Err(BillingError::RetriesExhausted(_))
        ));
        assert!(matches!(
            classify_event_row("evt_1", Some((false, 1))),
            Err(BillingError::ProcessingInFlight(_))
        ));
        assert!(matches!(
            classify_event_row("evt_1", None),
            Err(BillingError::Database(_))
        ));
    }

    #[test]
    fn test_processed_row_is_duplicate_even_with_exhausted_attempts() {
        // The processed flag wins over the attempt count
        assert_eq!(
            classify_event_row("evt_1", Some((true, MAX_ATTEMPTS))).unwrap(),
            WebhookOutcome::Duplicate
        );
    }
}
