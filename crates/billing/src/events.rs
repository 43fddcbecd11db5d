//! Billing Events Module
//!
//! Append-only billing event logging for audit trails and debugging. Events
//! capture every billing mutation and can be used to:
//! - Answer "why is this organization on this tier?" questions
//! - Reconstruct billing history after a disputed webhook
//! - Manual recovery when a provider event was lost entirely

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Types of billing events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingEventType {
    // Subscription lifecycle
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionCanceled,
    SubscriptionReactivated,

    // Tier changes
    TierChangeRequested,

    // Trial
    TrialStarted,

    // Invoicing
    InvoicePaid,

    // Credits
    CreditsAdded,
    CreditUsed,

    // Tickets
    TicketsIssued,
    PaymentRefunded,

    // Customer lifecycle
    CustomerCreated,
    CustomerUpdated,

    // Connected payout account
    AccountUpdated,
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingEventType::SubscriptionCreated => "SUBSCRIPTION_CREATED",
            BillingEventType::SubscriptionUpdated => "SUBSCRIPTION_UPDATED",
            BillingEventType::SubscriptionCanceled => "SUBSCRIPTION_CANCELED",
            BillingEventType::SubscriptionReactivated => "SUBSCRIPTION_REACTIVATED",
            BillingEventType::TierChangeRequested => "TIER_CHANGE_REQUESTED",
            BillingEventType::TrialStarted => "TRIAL_STARTED",
            BillingEventType::InvoicePaid => "INVOICE_PAID",
            BillingEventType::CreditsAdded => "CREDITS_ADDED",
            BillingEventType::CreditUsed => "CREDIT_USED",
            BillingEventType::TicketsIssued => "TICKETS_ISSUED",
            BillingEventType::PaymentRefunded => "PAYMENT_REFUNDED",
            BillingEventType::CustomerCreated => "CUSTOMER_CREATED",
            BillingEventType::CustomerUpdated => "CUSTOMER_UPDATED",
            BillingEventType::AccountUpdated => "ACCOUNT_UPDATED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// End user through the app
    User,
    /// System automation
    System,
    /// Stripe webhook
    Stripe,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::System => write!(f, "system"),
            ActorType::Stripe => write!(f, "stripe"),
        }
    }
}

/// A billing event record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillingEvent {
    pub id: Uuid,
    pub org_id: Uuid,
    pub event_type: String,
    pub event_subtype: Option<String>,
    pub event_data: serde_json::Value,
    pub stripe_event_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub actor_id: Option<Uuid>,
    pub actor_type: String,
    pub created_at: OffsetDateTime,
}

/// Builder for creating billing events
pub struct BillingEventBuilder {
    org_id: Uuid,
    event_type: BillingEventType,
    event_subtype: Option<String>,
    event_data: serde_json::Value,
    stripe_event_id: Option<String>,
    stripe_subscription_id: Option<String>,
    stripe_customer_id: Option<String>,
    actor_id: Option<Uuid>,
    actor_type: ActorType,
}

impl BillingEventBuilder {
    /// Create a new event builder
    pub fn new(org_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            org_id,
            event_type,
            event_subtype: None,
            event_data: serde_json::json!({}),
            stripe_event_id: None,
            stripe_subscription_id: None,
            stripe_customer_id: None,
            actor_id: None,
            actor_type: ActorType::System,
        }
    }

    /// Set the event subtype
    pub fn subtype(mut self, subtype: impl Into<String>) -> Self {
        self.event_subtype = Some(subtype.into());
        self
    }

    /// Set the event data
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    /// Set the Stripe event ID
    pub fn stripe_event(mut self, event_id: impl Into<String>) -> Self {
        self.stripe_event_id = Some(event_id.into());
        self
    }

    /// Set the Stripe subscription ID
    pub fn stripe_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.stripe_subscription_id = Some(subscription_id.into());
        self
    }

    /// Set the Stripe customer ID
    pub fn stripe_customer(mut self, customer_id: impl Into<String>) -> Self {
        self.stripe_customer_id = Some(customer_id.into());
        self
    }

    /// Set the actor (user who triggered the event)
    pub fn actor(mut self, actor_id: Uuid, actor_type: ActorType) -> Self {
        self.actor_id = Some(actor_id);
        self.actor_type = actor_type;
        self
    }

    /// Set the actor type without a specific user
    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }
}

/// Service for logging and querying billing events
#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Log a billing event
    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<Uuid> {
        let event_id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO billing_events (
                org_id,
                event_type,
                event_subtype,
                event_data,
                stripe_event_id,
                stripe_subscription_id,
                stripe_customer_id,
                actor_id,
                actor_type
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(builder.org_id)
        .bind(builder.event_type.to_string())
        .bind(&builder.event_subtype)
        .bind(&builder.event_data)
        .bind(&builder.stripe_event_id)
        .bind(&builder.stripe_subscription_id)
        .bind(&builder.stripe_customer_id)
        .bind(builder.actor_id)
        .bind(builder.actor_type.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(event_id.0)
    }

    /// Get recent events for an organization
    pub async fn get_events_for_org(
        &self,
        org_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        let events: Vec<BillingEvent> = sqlx::query_as(
            r#"
            SELECT
                id, org_id, event_type, event_subtype, event_data,
                stripe_event_id, stripe_subscription_id, stripe_customer_id,
                actor_id, actor_type, created_at
            FROM billing_events
            WHERE org_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(org_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}
