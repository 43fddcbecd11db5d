//! Billing error types

use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Customer not found: {0}")]
    CustomerNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Invalid subscription tier: {0}")]
    InvalidTier(String),

    #[error("An active or trialing subscription already exists for this customer")]
    ActiveSubscriptionExists,

    #[error("Insufficient guest list credits ({available} available)")]
    InsufficientCredits { available: i64 },

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Payment method required for this operation")]
    PaymentMethodRequired,

    #[error("No cancelled subscription found for organization: {0}")]
    NoCancelledSubscription(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

/// True when the underlying database error is a unique-constraint violation.
/// The idempotent paths (credit grants, webhook dedup) treat this as a signal,
/// not a failure.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_are_user_readable() {
        assert_eq!(
            BillingError::InsufficientCredits { available: 0 }.to_string(),
            "Insufficient guest list credits (0 available)"
        );
        assert_eq!(
            BillingError::ActiveSubscriptionExists.to_string(),
            "An active or trialing subscription already exists for this customer"
        );
    }
}
