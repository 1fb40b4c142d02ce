//! Billing error types
//!
//! The error taxonomy distinguishes failures that must never be retried
//! (signature rejection, permanent data errors) from transient persistence
//! failures that the webhook retry path may re-drive.

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Webhook signature did not verify; rejected at the boundary, no state
    /// change, never retried.
    #[error("Webhook signature verification failed")]
    SignatureInvalid,

    /// The event was already fully processed. Callers treat this as success.
    #[error("Event {0} already processed")]
    DuplicateEvent(String),

    /// The event payload did not contain the object the type tag promised.
    #[error("Unexpected webhook payload: {0}")]
    EventPayloadMismatch(String),

    /// No profile exists for the referenced customer. Permanent; flagged
    /// for manual review rather than retried indefinitely.
    #[error("No profile found for Stripe customer {0}")]
    CustomerNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Profile not found: {0}")]
    ProfileNotFound(uuid::Uuid),

    /// A debit would have taken the balance below zero.
    #[error("Insufficient credits: balance {balance}, requested {requested}")]
    InsufficientCredits { balance: i64, requested: i64 },

    /// Event is unprocessed after the maximum number of attempts; left for
    /// manual review.
    #[error("Event {0} exhausted its retries")]
    RetriesExhausted(String),

    /// Another delivery of the same event currently holds the processing
    /// claim. Callers back off and let the provider redeliver.
    #[error("Event {0} is being processed by another attempt")]
    ProcessingInFlight(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Stripe API error: {0}")]
    Stripe(#[from] stripe::StripeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether a failed webhook processing attempt may be retried.
    ///
    /// Transient persistence failures roll the transaction back and leave the
    /// event row retryable; signature and data errors do not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::Database(_) | BillingError::Stripe(_) | BillingError::ProcessingInFlight(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_failure_is_not_retryable() {
        assert!(!BillingError::SignatureInvalid.is_retryable());
    }

    #[test]
    fn test_database_failure_is_retryable() {
        assert!(BillingError::Database("connection reset".into()).is_retryable());
    }

    #[test]
    fn test_permanent_data_errors_are_not_retryable() {
        assert!(!BillingError::CustomerNotFound("cus_123".into()).is_retryable());
        assert!(!BillingError::RetriesExhausted("evt_1".into()).is_retryable());
        assert!(!BillingError::EventPayloadMismatch("expected invoice".into()).is_retryable());
    }

    #[test]
    fn test_duplicate_event_is_not_retryable() {
        // Duplicates are a no-op success at call sites, never re-driven
        assert!(!BillingError::DuplicateEvent("evt_1".into()).is_retryable());
    }
}
