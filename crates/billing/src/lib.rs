// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Some Stripe operations require many parameters
#![allow(clippy::field_reassign_with_default)] // Used for conditional struct field setting
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Doorlist Billing Module
//!
//! Handles Stripe integration for subscriptions, guest-list credits, and
//! ticket payments.
//!
//! ## Features
//!
//! - **Subscription Management**: Create, change tier, cancel, reactivate
//! - **Proration & Trials**: Pure quote calculator; 30-day trials for new
//!   customers below the top tier
//! - **Credit Ledger**: Prepaid guest-list credits with a race-proof balance
//! - **Payments**: Payment intents for ticket sales and credit packs
//! - **Webhooks**: Idempotent reconciliation of Stripe events

pub mod client;
pub mod credits;
pub mod customer;
pub mod error;
pub mod events;
pub mod payments;
pub mod proration;
pub mod subscriptions;
pub mod webhooks;

// Client
pub use client::{PriceIds, StripeClient, StripeConfig, DEFAULT_TRIAL_PERIOD_DAYS};

// Credits
pub use credits::{CreditBalance, CreditLedgerEntry, CreditService};

// Customer
pub use customer::{CustomerRecord, CustomerService};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    ActorType, BillingEvent, BillingEventBuilder, BillingEventLogger, BillingEventType,
};

// Payments
pub use payments::PaymentService;

// Proration
pub use proration::{
    apply_discount_cents, prorated_change_cents, trial_eligible, unused_current_cents, TierQuote,
};

// Subscriptions
pub use subscriptions::{
    CreateSubscriptionRequest, GuestListSlot, PendingTierChange, ReactivateRequest,
    SubscriptionRecord, SubscriptionService,
};

// Webhooks
pub use webhooks::WebhookHandler;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub credits: CreditService,
    pub customer: CustomerService,
    pub events: BillingEventLogger,
    pub payments: PaymentService,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::with_client(stripe, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        Self::with_client(StripeClient::new(config), pool)
    }

    fn with_client(stripe: StripeClient, pool: PgPool) -> Self {
        Self {
            credits: CreditService::new(pool.clone()),
            customer: CustomerService::new(stripe.clone(), pool.clone()),
            events: BillingEventLogger::new(pool.clone()),
            payments: PaymentService::new(stripe.clone(), pool.clone()),
            subscriptions: SubscriptionService::new(stripe.clone(), pool.clone()),
            webhooks: WebhookHandler::new(stripe, pool),
        }
    }
}
