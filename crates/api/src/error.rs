//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use doorlist_billing::BillingError;
use doorlist_tickets::TicketError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,
    #[error("Invalid or expired token")]
    InvalidToken,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,
    #[error("{0}")]
    Conflict(String),

    // Expected billing/inventory failures (user-actionable)
    #[error("{0}")]
    InsufficientResource(String),
    #[error("Payment method required")]
    PaymentRequired,

    // Upstream provider failed; detail stays in server logs
    #[error("Payment provider is temporarily unavailable, please retry")]
    Upstream,

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Authentication
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", self.to_string()),
            ApiError::InvalidToken => (StatusCode::UNAUTHORIZED, "INVALID_TOKEN", self.to_string()),

            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            // Resources
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),

            // Billing/inventory
            ApiError::InsufficientResource(msg) => {
                (StatusCode::PAYMENT_REQUIRED, "INSUFFICIENT_RESOURCE", msg.clone())
            }
            ApiError::PaymentRequired => {
                (StatusCode::PAYMENT_REQUIRED, "PAYMENT_REQUIRED", self.to_string())
            }

            // Upstream failures surface as generic retryable errors
            ApiError::Upstream => (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR", self.to_string()),

            // Internal
            ApiError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "Database error".to_string(),
            ),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound,
            sqlx::Error::Database(db_err) => {
                if let Some(code) = db_err.code() {
                    // PostgreSQL unique violation
                    if code == "23505" {
                        return ApiError::Conflict("Resource already exists".to_string());
                    }
                }
                ApiError::Database(db_err.to_string())
            }
            _ => ApiError::Database(err.to_string()),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::ActiveSubscriptionExists => ApiError::Conflict(err.to_string()),
            BillingError::InsufficientCredits { .. } => {
                ApiError::InsufficientResource(err.to_string())
            }
            BillingError::PaymentMethodRequired => ApiError::PaymentRequired,
            BillingError::CustomerNotFound(_)
            | BillingError::SubscriptionNotFound(_)
            | BillingError::NoCancelledSubscription(_)
            | BillingError::NotFound(_) => ApiError::NotFound,
            BillingError::InvalidTier(_) | BillingError::InvalidInput(_) => {
                ApiError::Validation(err.to_string())
            }
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::StripeApi(detail) => {
                tracing::error!(error = %detail, "Stripe API failure");
                ApiError::Upstream
            }
            BillingError::Database(detail) => ApiError::Database(detail),
            BillingError::Config(detail) | BillingError::Internal(detail) => {
                tracing::error!(error = %detail, "Internal billing error");
                ApiError::Internal
            }
        }
    }
}

impl From<TicketError> for ApiError {
    fn from(err: TicketError) -> Self {
        match err {
            TicketError::InsufficientInventory { .. } => {
                ApiError::InsufficientResource(err.to_string())
            }
            TicketError::AlreadyCheckedIn { .. } | TicketError::OutOfWindow { .. } => {
                ApiError::Conflict(err.to_string())
            }
            TicketError::TicketNotFound(_)
            | TicketError::EventNotFound(_)
            | TicketError::TicketTypeNotFound(_) => ApiError::NotFound,
            TicketError::TicketTypeInactive(_) | TicketError::InvalidInput(_) => {
                ApiError::Validation(err.to_string())
            }
            TicketError::Database(detail) => ApiError::Database(detail),
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
