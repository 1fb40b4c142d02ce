//! Credit ledger
//!
//! Append-only record of every balance change. Each mutation of
//! `profiles.credits_balance` happens in the same transaction as exactly one
//! ledger row whose `balance_after` matches the post-mutation balance. Rows
//! are never updated or deleted; corrections are offsetting entries.
//!
//! The denormalized balance on the profile is the read path; the ledger is
//! the source of truth for audit and must independently sum to the same
//! value (see [`CreditLedger::verify_balance`]).

use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// What caused a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditTransactionType {
    /// Monthly allotment granted on a paid subscription invoice
    SubscriptionGrant,
    /// One-time credit pack purchase
    CreditPurchase,
    /// Debit for a completed scan
    ScanDeduction,
    /// Debit for an AI operation
    AiDeduction,
    /// Offsetting correction: money returned
    CreditRefund,
    /// Offsetting correction: goodwill grant
    CreditBonus,
    /// Manual adjustment by an administrator
    AdminAdjustment,
}

impl CreditTransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditTransactionType::SubscriptionGrant => "subscription_grant",
            CreditTransactionType::CreditPurchase => "credit_purchase",
            CreditTransactionType::ScanDeduction => "scan_deduction",
            CreditTransactionType::AiDeduction => "ai_deduction",
            CreditTransactionType::CreditRefund => "credit_refund",
            CreditTransactionType::CreditBonus => "credit_bonus",
            CreditTransactionType::AdminAdjustment => "admin_adjustment",
        }
    }
}

/// A single immutable ledger row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    pub balance_after: i64,
    pub transaction_type: String,
    pub reference_id: Option<String>,
    pub description: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Result of replaying the ledger against the denormalized balance
#[derive(Debug, Clone, Serialize)]
pub struct LedgerAudit {
    pub user_id: Uuid,
    pub profile_balance: i64,
    pub ledger_sum: i64,
    pub consistent: bool,
}

/// Service maintaining the append-only credit ledger
#[derive(Clone)]
pub struct CreditLedger {
    pool: PgPool,
}

impl CreditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Post a balance delta inside the caller's transaction.
    ///
    /// Applies the conditional profile update first (the `credits_balance +
    /// delta >= 0` guard keeps the balance non-negative under concurrency),
    /// then inserts the ledger row carrying the resulting balance. Returns
    /// `balance_after`.
    pub async fn post_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        amount: i64,
        transaction_type: CreditTransactionType,
        reference_id: Option<&str>,
        description: &str,
    ) -> BillingResult<i64> {
        let balance_after: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE profiles
            SET credits_balance = credits_balance + $2, updated_at = NOW()
            WHERE id = $1
              AND deleted_at IS NULL
              AND credits_balance + $2 >= 0
            RETURNING credits_balance
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .fetch_optional(&mut **tx)
        .await?;

        let balance_after = match balance_after {
            Some((balance,)) => balance,
            None => {
                // Distinguish a missing profile from an overdraw
                let current: Option<(i64,)> = sqlx::query_as(
                    "SELECT credits_balance FROM profiles WHERE id = $1 AND deleted_at IS NULL",
                )
                .bind(user_id)
                .fetch_optional(&mut **tx)
                .await?;

                return match current {
                    Some((balance,)) => Err(BillingError::InsufficientCredits {
                        balance,
                        requested: amount,
                    }),
                    None => Err(BillingError::ProfileNotFound(user_id)),
                };
            }
        };

        sqlx::query(
            r#"
            INSERT INTO credit_transactions
                (id, user_id, amount, balance_after, transaction_type, reference_id, description)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(amount)
        .bind(balance_after)
        .bind(transaction_type.as_str())
        .bind(reference_id)
        .bind(description)
        .execute(&mut **tx)
        .await?;

        Ok(balance_after)
    }

    /// Post a standalone balance change in its own transaction
    pub async fn post(
        &self,
        user_id: Uuid,
        amount: i64,
        transaction_type: CreditTransactionType,
        reference_id: Option<&str>,
        description: &str,
    ) -> BillingResult<i64> {
        let mut tx = self.pool.begin().await?;
        let balance_after = Self::post_in_tx(
            &mut tx,
            user_id,
            amount,
            transaction_type,
            reference_id,
            description,
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            amount = amount,
            balance_after = balance_after,
            transaction_type = transaction_type.as_str(),
            "Posted credit transaction"
        );

        Ok(balance_after)
    }

    /// Current balance, read from the denormalized profile column
    pub async fn balance(&self, user_id: Uuid) -> BillingResult<i64> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT credits_balance FROM profiles WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(b,)| b)
            .ok_or(BillingError::ProfileNotFound(user_id))
    }

    /// Most recent ledger rows for a user, newest first
    pub async fn history(&self, user_id: Uuid, limit: i64) -> BillingResult<Vec<CreditTransaction>> {
        let rows: Vec<CreditTransaction> = sqlx::query_as(
            r#"
            SELECT id, user_id, amount, balance_after, transaction_type,
                   reference_id, description, created_at
            FROM credit_transactions
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Audit path: replay the ledger and compare against the profile balance.
    ///
    /// This is a consistency check, not a read path. A mismatch means a
    /// balance mutation escaped the ledger (or vice versa) and needs manual
    /// reconciliation.
    pub async fn verify_balance(&self, user_id: Uuid) -> BillingResult<LedgerAudit> {
        let profile_balance = self.balance(user_id).await?;

        let (ledger_sum,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM credit_transactions WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let consistent = profile_balance == ledger_sum;
        if !consistent {
            tracing::error!(
                user_id = %user_id,
                profile_balance = profile_balance,
                ledger_sum = ledger_sum,
                "RECONCILIATION NEEDED: ledger does not sum to profile balance"
            );
        }

        Ok(LedgerAudit {
            user_id,
            profile_balance,
            ledger_sum,
            consistent,
        })
    }
}
