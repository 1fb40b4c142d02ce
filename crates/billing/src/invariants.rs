//! Billing invariants
//!
//! Runnable consistency checks over the billing tables. The worker runs them
//! on a schedule and after webhook replay; operators can run a single check
//! by name when investigating.
//!
//! Checks only read, never write. Violations carry enough context to debug
//! without re-querying.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::webhooks::MAX_ATTEMPTS;

/// A single invariant violation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Affected users
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money or credits may be wrong
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of one invariant run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerMismatchRow {
    user_id: Uuid,
    credits_balance: i64,
    ledger_sum: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeBalanceAfterRow {
    id: Uuid,
    user_id: Uuid,
    balance_after: i64,
    transaction_type: String,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleSubsRow {
    user_id: Uuid,
    sub_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct CanceledTierRow {
    user_id: Uuid,
    tier: String,
    stripe_subscription_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct ExhaustedEventRow {
    stripe_event_id: String,
    event_type: String,
    retry_count: i32,
    error_message: Option<String>,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Names accepted by [`run_check`](Self::run_check)
    pub fn available_checks() -> &'static [&'static str] {
        &[
            "ledger_matches_balance",
            "balance_after_non_negative",
            "single_active_subscription",
            "canceled_implies_demo_tier",
            "exhausted_webhook_events",
        ]
    }

    /// Run every check and summarize
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_ledger_matches_balance().await?);
        violations.extend(self.check_balance_after_non_negative().await?);
        violations.extend(self.check_single_active_subscription().await?);
        violations.extend(self.check_canceled_implies_demo_tier().await?);
        violations.extend(self.check_exhausted_webhook_events().await?);

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        if !violations.is_empty() {
            tracing::error!(
                violations = violations.len(),
                checks_failed = checks_failed,
                "Billing invariant violations found"
            );
        }

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run one check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "ledger_matches_balance" => self.check_ledger_matches_balance().await,
            "balance_after_non_negative" => self.check_balance_after_non_negative().await,
            "single_active_subscription" => self.check_single_active_subscription().await,
            "canceled_implies_demo_tier" => self.check_canceled_implies_demo_tier().await,
            "exhausted_webhook_events" => self.check_exhausted_webhook_events().await,
            other => Err(BillingError::Internal(format!(
                "unknown invariant check: {other}"
            ))),
        }
    }

    /// The ledger must sum to the denormalized balance for every profile.
    /// A mismatch means a balance mutation escaped the ledger.
    async fn check_ledger_matches_balance(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<LedgerMismatchRow> = sqlx::query_as(
            r#"
            SELECT p.id AS user_id,
                   p.credits_balance,
                   COALESCE(SUM(ct.amount), 0)::BIGINT AS ledger_sum
            FROM profiles p
            LEFT JOIN credit_transactions ct ON ct.user_id = p.id
            WHERE p.deleted_at IS NULL
            GROUP BY p.id, p.credits_balance
            HAVING p.credits_balance != COALESCE(SUM(ct.amount), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "ledger_matches_balance".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Ledger sums to {} but profile balance is {}",
                    row.ledger_sum, row.credits_balance
                ),
                context: serde_json::json!({
                    "credits_balance": row.credits_balance,
                    "ledger_sum": row.ledger_sum,
                    "drift": row.credits_balance - row.ledger_sum,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// No ledger row may record a negative post-transaction balance
    async fn check_balance_after_non_negative(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeBalanceAfterRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, balance_after, transaction_type
            FROM credit_transactions
            WHERE balance_after < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "balance_after_non_negative".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Ledger row {} records negative balance {}",
                    row.id, row.balance_after
                ),
                context: serde_json::json!({
                    "transaction_id": row.id,
                    "balance_after": row.balance_after,
                    "transaction_type": row.transaction_type,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// At most one non-terminal subscription per user. More than one means
    /// double-billing or entitlement confusion.
    async fn check_single_active_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleSubsRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) AS sub_count
            FROM subscriptions
            WHERE status != 'canceled'
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} non-terminal subscriptions (expected at most 1)",
                    row.sub_count
                ),
                context: serde_json::json!({ "subscription_count": row.sub_count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// A user whose only subscriptions are canceled must sit on the demo
    /// tier. A paid tier without a live subscription is free service.
    async fn check_canceled_implies_demo_tier(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledTierRow> = sqlx::query_as(
            r#"
            SELECT p.id AS user_id, p.tier, s.stripe_subscription_id
            FROM profiles p
            JOIN subscriptions s ON s.user_id = p.id
            WHERE p.deleted_at IS NULL
              AND p.tier != 'demo'
              AND s.status = 'canceled'
              AND NOT EXISTS (
                  SELECT 1 FROM subscriptions s2
                  WHERE s2.user_id = p.id AND s2.status != 'canceled'
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_implies_demo_tier".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User is on tier '{}' but their subscription {} is canceled",
                    row.tier, row.stripe_subscription_id
                ),
                context: serde_json::json!({
                    "tier": row.tier,
                    "stripe_subscription_id": row.stripe_subscription_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Surface events that exhausted their attempts and still sit
    /// unprocessed. These need a human.
    async fn check_exhausted_webhook_events(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ExhaustedEventRow> = sqlx::query_as(
            r#"
            SELECT stripe_event_id, event_type, retry_count, error_message
            FROM stripe_events
            WHERE processed = false AND retry_count >= $1
            "#,
        )
        .bind(MAX_ATTEMPTS)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "exhausted_webhook_events".to_string(),
                user_ids: Vec::new(),
                description: format!(
                    "Event {} ({}) unprocessed after {} attempts",
                    row.stripe_event_id, row.event_type, row.retry_count
                ),
                context: serde_json::json!({
                    "stripe_event_id": row.stripe_event_id,
                    "event_type": row.event_type,
                    "retry_count": row.retry_count,
                    "error": row.error_message,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_checks_are_unique() {
        let checks = InvariantChecker::available_checks();
        let unique: std::collections::HashSet<_> = checks.iter().collect();
        assert_eq!(checks.len(), unique.len());
    }

    #[test]
    fn test_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_summary_health_reflects_violations() {
        let summary = InvariantCheckSummary {
            checked_at: OffsetDateTime::now_utc(),
            checks_run: 5,
            checks_passed: 5,
            checks_failed: 0,
            violations: Vec::new(),
            healthy: true,
        };
        assert!(summary.healthy);
        assert_eq!(summary.checks_run, summary.checks_passed + summary.checks_failed);
    }
}
