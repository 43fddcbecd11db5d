//! Subscription lifecycle management
//!
//! The authoritative state machine for a customer's subscription:
//!
//! `Incomplete → {Trialing | Active} → {PastDue ↔ Active} →
//! PendingCancellation → Canceled`, with `Unpaid` and `IncompleteExpired` as
//! absorbing failure states.
//!
//! Two kinds of writers exist and they are deliberately asymmetric:
//!
//! - User actions (create, change tier, cancel, reactivate) talk to Stripe.
//!   Tier changes and cancellations do NOT touch the local row; the
//!   subsequent `customer.subscription.updated` webhook is the single writer
//!   of tier/amount/period fields, which collapses the distributed update
//!   into one writer and prevents lost-update races against in-flight
//!   provider-side changes.
//! - Webhook-applied state (`apply_*` methods, called by the reconciler) is
//!   the source of truth; the row written at creation time is provisional
//!   until the provider confirms it.

use doorlist_shared::{SubscriptionStatus, SubscriptionTier};
use sqlx::PgPool;
use stripe::{
    CreateSubscription, CreateSubscriptionItems, CustomerId, Price, PriceId, PromotionCodeId,
    Subscription, SubscriptionId, SubscriptionStatus as StripeSubStatus, UpdateSubscription,
    UpdateSubscriptionItems,
};
// Import the proration behavior enum from the subscription module (not subscription_item)
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::credits::{CreditLedgerEntry, CreditService};
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::proration::{
    apply_discount_cents, quote_for_tier, trial_eligible, unused_current_cents, TierQuote,
};

/// Local subscription row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub org_id: Uuid,
    pub customer_id: Uuid,
    pub stripe_subscription_id: String,
    pub stripe_price_id: String,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub amount_cents: i64,
    pub discount_percentage: Option<f64>,
    pub stripe_promo_id: Option<String>,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub trial_end: Option<OffsetDateTime>,
    pub billing_cycle_anchor: OffsetDateTime,
    pub guest_list_events_count: i32,
}

/// Parameters for creating a new subscription
#[derive(Debug, Clone)]
pub struct CreateSubscriptionRequest {
    pub tier: SubscriptionTier,
    pub payment_method_id: String,
    pub promo_code: Option<String>,
    pub billing_email: String,
    pub org_name: String,
}

/// Parameters for reactivating after cancellation
#[derive(Debug, Clone)]
pub struct ReactivateRequest {
    pub tier: SubscriptionTier,
    pub payment_method_id: String,
}

/// Result of a user-initiated tier change. The local row is untouched; the
/// change becomes visible when the provider's update webhook lands.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PendingTierChange {
    pub from_tier: SubscriptionTier,
    pub to_tier: SubscriptionTier,
    pub stripe_subscription_id: String,
    pub message: String,
}

/// How a guest-list event was paid for
#[derive(Debug)]
pub enum GuestListSlot {
    /// Covered by the subscription's per-cycle quota
    Quota { used: i32, quota: u32 },
    /// Quota exhausted; a prepaid credit was consumed
    Credit(CreditLedgerEntry),
}

/// Map the provider's status plus its cancel flag onto the local state
/// machine. `cancel_at_period_end` on a still-usable subscription is the
/// PendingCancellation state.
fn map_status(status: StripeSubStatus, cancel_at_period_end: bool) -> SubscriptionStatus {
    if cancel_at_period_end
        && matches!(
            status,
            StripeSubStatus::Active | StripeSubStatus::Trialing | StripeSubStatus::PastDue
        )
    {
        return SubscriptionStatus::PendingCancellation;
    }

    match status {
        StripeSubStatus::Incomplete => SubscriptionStatus::Incomplete,
        StripeSubStatus::IncompleteExpired => SubscriptionStatus::IncompleteExpired,
        StripeSubStatus::Trialing => SubscriptionStatus::Trialing,
        StripeSubStatus::Active => SubscriptionStatus::Active,
        StripeSubStatus::PastDue => SubscriptionStatus::PastDue,
        StripeSubStatus::Unpaid | StripeSubStatus::Paused => SubscriptionStatus::Unpaid,
        StripeSubStatus::Canceled => SubscriptionStatus::Canceled,
    }
}

fn ts(unix: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(unix).unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// Active percentage discount on a provider subscription, if any
fn discount_percent(subscription: &Subscription) -> Option<f64> {
    subscription
        .discount
        .as_ref()
        .map(|d| &d.coupon)
        .and_then(|c| c.percent_off)
}

fn promo_id(subscription: &Subscription) -> Option<String> {
    subscription
        .discount
        .as_ref()
        .and_then(|d| d.promotion_code.as_ref())
        .map(|pc| match pc {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(promo) => promo.id.to_string(),
        })
}

/// Subscription service for managing Stripe subscriptions
pub struct SubscriptionService {
    stripe: StripeClient,
    pool: PgPool,
    event_logger: BillingEventLogger,
}

impl SubscriptionService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let event_logger = BillingEventLogger::new(pool.clone());
        Self {
            stripe,
            pool,
            event_logger,
        }
    }

    /// Get the Stripe client for config access
    pub fn stripe(&self) -> &StripeClient {
        &self.stripe
    }

    // =========================================================================
    // User actions
    // =========================================================================

    /// Create a new subscription for an organization.
    ///
    /// Trial eligibility is evaluated from durable billing history BEFORE the
    /// customer record is created, so deleting and re-subscribing cannot
    /// re-earn a trial.
    pub async fn create_subscription(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        request: CreateSubscriptionRequest,
    ) -> BillingResult<SubscriptionRecord> {
        if let Some(existing) = self.get_usable_subscription(org_id).await? {
            if existing.status.blocks_new_subscription() {
                return Err(BillingError::ActiveSubscriptionExists);
            }
            // Any other usable row (past due, pending cancellation, ...)
            // still occupies the customer's single subscription slot
            return Err(BillingError::InvalidInput(format!(
                "Existing subscription is {}; resolve it before subscribing again",
                existing.status
            )));
        }

        let customers = CustomerService::new(self.stripe.clone(), self.pool.clone());

        let has_history = customers.has_billing_history(org_id).await?;
        let with_trial = trial_eligible(has_history, request.tier);

        let customer = customers
            .get_or_create_customer(org_id, &request.billing_email, &request.org_name)
            .await?;
        customers
            .attach_payment_method(org_id, &request.payment_method_id)
            .await?;

        let customer_id = customer
            .stripe_customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;

        let price_id = self.stripe.config().price_id_for_tier(request.tier);

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("org_id".to_string(), org_id.to_string());
        metadata.insert("tier".to_string(), request.tier.to_string());

        let mut params = CreateSubscription::new(customer_id);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(price_id.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(metadata);
        params.default_payment_method = Some(&request.payment_method_id);
        if with_trial {
            params.trial_period_days = Some(self.stripe.config().trial_period_days);
        }
        if let Some(code) = &request.promo_code {
            let promo = code
                .parse::<PromotionCodeId>()
                .map_err(|e| BillingError::InvalidInput(format!("Invalid promotion code: {}", e)))?;
            params.promotion_code = Some(promo);
        }

        let subscription = Subscription::create(self.stripe.inner(), params).await?;

        // Provisional local row; the provider's webhooks are the source of
        // truth from here on
        let record = self
            .insert_local_row(org_id, customer.id, &subscription, request.tier)
            .await?;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(org_id, BillingEventType::SubscriptionCreated)
                    .data(serde_json::json!({
                        "tier": request.tier.as_str(),
                        "with_trial": with_trial,
                    }))
                    .stripe_subscription(subscription.id.to_string())
                    .stripe_customer(customer.stripe_customer_id.clone())
                    .actor(user_id, ActorType::User),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log subscription created event");
        }

        tracing::info!(
            org_id = %org_id,
            subscription_id = %subscription.id,
            tier = %request.tier,
            with_trial = with_trial,
            "Created subscription"
        );

        Ok(record)
    }

    /// Change the subscription's tier at the provider.
    ///
    /// Prorates with "always invoice" so the difference is charged
    /// immediately; any active discount object stays attached to the
    /// subscription and carries forward. The local row is NOT updated here -
    /// it waits for the `customer.subscription.updated` webhook.
    pub async fn change_tier(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        new_tier: SubscriptionTier,
    ) -> BillingResult<PendingTierChange> {
        let record = self
            .get_usable_subscription(org_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(org_id.to_string()))?;

        if record.tier == new_tier {
            return Err(BillingError::InvalidInput(format!(
                "Subscription is already on the {} tier",
                new_tier
            )));
        }

        let sub_id = record
            .stripe_subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;

        let current = Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;

        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| BillingError::Internal("No subscription items found".to_string()))?;

        let price_id = self.stripe.config().price_id_for_tier(new_tier);

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("tier".to_string(), new_tier.to_string());

        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                price: Some(price_id.to_string()),
                ..Default::default()
            }]),
            metadata: Some(metadata),
            // Invoice the prorated difference immediately
            proration_behavior: Some(SubscriptionProrationBehavior::AlwaysInvoice),
            ..Default::default()
        };

        Subscription::update(self.stripe.inner(), &sub_id, params)
            .await
            .map_err(|e| {
                let err_str = e.to_string();
                if err_str.contains("no attached payment source")
                    || err_str.contains("no default payment method")
                {
                    tracing::warn!(
                        org_id = %org_id,
                        error = %err_str,
                        "Tier change failed: customer has no payment method"
                    );
                    return BillingError::PaymentMethodRequired;
                }
                BillingError::StripeApi(err_str)
            })?;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(org_id, BillingEventType::TierChangeRequested)
                    .data(serde_json::json!({
                        "from_tier": record.tier.as_str(),
                        "to_tier": new_tier.as_str(),
                    }))
                    .stripe_subscription(record.stripe_subscription_id.clone())
                    .actor(user_id, ActorType::User),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log tier change request event");
        }

        tracing::info!(
            org_id = %org_id,
            subscription_id = %record.stripe_subscription_id,
            from_tier = %record.tier,
            to_tier = %new_tier,
            "Tier change sent to provider; awaiting update webhook"
        );

        Ok(PendingTierChange {
            from_tier: record.tier,
            to_tier: new_tier,
            stripe_subscription_id: record.stripe_subscription_id,
            message: format!(
                "Tier change to {} requested; billing will update once the provider confirms",
                new_tier
            ),
        })
    }

    /// Flag the subscription to cancel at period end. The local transition to
    /// PendingCancellation arrives via the update webhook.
    pub async fn cancel_at_period_end(&self, org_id: Uuid, user_id: Uuid) -> BillingResult<()> {
        let record = self
            .get_usable_subscription(org_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(org_id.to_string()))?;

        let sub_id = record
            .stripe_subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;

        let params = UpdateSubscription {
            cancel_at_period_end: Some(true),
            ..Default::default()
        };

        Subscription::update(self.stripe.inner(), &sub_id, params).await?;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(org_id, BillingEventType::SubscriptionUpdated)
                    .subtype("cancel_at_period_end")
                    .stripe_subscription(record.stripe_subscription_id.clone())
                    .actor(user_id, ActorType::User),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log cancellation request event");
        }

        tracing::info!(
            org_id = %org_id,
            subscription_id = %record.stripe_subscription_id,
            "Cancellation at period end requested"
        );

        Ok(())
    }

    /// Reactivate after cancellation: a new payment method, a brand-new
    /// subscription row, and never a trial (reactivation is excluded from
    /// trial eligibility).
    pub async fn reactivate(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        request: ReactivateRequest,
    ) -> BillingResult<SubscriptionRecord> {
        let latest = self
            .latest_subscription(org_id)
            .await?
            .ok_or_else(|| BillingError::NoCancelledSubscription(org_id.to_string()))?;

        if latest.status.blocks_new_subscription() {
            return Err(BillingError::ActiveSubscriptionExists);
        }
        if latest.status != SubscriptionStatus::Canceled {
            return Err(BillingError::InvalidInput(format!(
                "Subscription is {}, not canceled",
                latest.status
            )));
        }

        let customers = CustomerService::new(self.stripe.clone(), self.pool.clone());
        let customer = customers
            .get_customer(org_id)
            .await?
            .ok_or_else(|| BillingError::CustomerNotFound(org_id.to_string()))?;

        customers
            .attach_payment_method(org_id, &request.payment_method_id)
            .await?;

        let customer_id = customer
            .stripe_customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;

        let price_id = self.stripe.config().price_id_for_tier(request.tier);

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("org_id".to_string(), org_id.to_string());
        metadata.insert("tier".to_string(), request.tier.to_string());
        metadata.insert("reactivation".to_string(), "true".to_string());

        let mut params = CreateSubscription::new(customer_id);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(price_id.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(metadata);
        params.default_payment_method = Some(&request.payment_method_id);

        let subscription = Subscription::create(self.stripe.inner(), params).await?;

        let record = self
            .insert_local_row(org_id, customer.id, &subscription, request.tier)
            .await?;

        // Reactivation brings the owning organization and its billing
        // identity back to life
        sqlx::query("UPDATE organizations SET is_active = TRUE, updated_at = NOW() WHERE id = $1")
            .bind(org_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("UPDATE customers SET is_active = TRUE, updated_at = NOW() WHERE org_id = $1")
            .bind(org_id)
            .execute(&self.pool)
            .await?;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(org_id, BillingEventType::SubscriptionReactivated)
                    .data(serde_json::json!({ "tier": request.tier.as_str() }))
                    .stripe_subscription(subscription.id.to_string())
                    .actor(user_id, ActorType::User),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log reactivation event");
        }

        tracing::info!(
            org_id = %org_id,
            subscription_id = %subscription.id,
            tier = %request.tier,
            "Reactivated subscription"
        );

        Ok(record)
    }

    /// Quote every candidate tier for a mid-cycle change.
    ///
    /// The provider supplies the upcoming-invoice amount per candidate price;
    /// the arithmetic (unamortized subtraction, zero floor, discount) is the
    /// pure calculator's.
    pub async fn preview_tier_change(&self, org_id: Uuid) -> BillingResult<Vec<TierQuote>> {
        let record = self
            .get_usable_subscription(org_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(org_id.to_string()))?;

        let sub_id = record
            .stripe_subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;

        let current = Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;
        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| BillingError::Internal("No subscription items found".to_string()))?;

        let now = OffsetDateTime::now_utc();
        let period_seconds = (record.current_period_end - record.current_period_start)
            .whole_seconds()
            .max(1);
        let remaining_seconds = (record.current_period_end - now)
            .whole_seconds()
            .clamp(0, period_seconds);
        let remaining_fraction = remaining_seconds as f64 / period_seconds as f64;

        let current_list_cents = self.price_unit_amount(&record.stripe_price_id).await?;
        let unused_current = unused_current_cents(current_list_cents, remaining_fraction);

        let mut quotes = Vec::with_capacity(3);
        for tier in [
            SubscriptionTier::Standard,
            SubscriptionTier::Plus,
            SubscriptionTier::Elite,
        ] {
            let price_id = self.stripe.config().price_id_for_tier(tier).to_string();
            let monthly_list_cents = self.price_unit_amount(&price_id).await?;

            let upcoming = if tier == record.tier {
                0
            } else {
                self.upcoming_invoice_for_price(&record, &item_id, &price_id)
                    .await?
            };

            quotes.push(quote_for_tier(
                tier,
                record.tier,
                monthly_list_cents,
                upcoming,
                unused_current,
                record.discount_percentage,
            ));
        }

        Ok(quotes)
    }

    /// Consume a guest-list slot: the per-cycle quota first, then a prepaid
    /// credit. The quota increment is a single conditional UPDATE so
    /// concurrent event creations cannot exceed the quota together.
    pub async fn use_guest_list_slot(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        event_id: Uuid,
    ) -> BillingResult<GuestListSlot> {
        let record = self
            .get_usable_subscription(org_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(org_id.to_string()))?;

        if !record.status.blocks_new_subscription() {
            // Only active/trialing subscriptions may run guest lists
            return Err(BillingError::SubscriptionNotFound(format!(
                "no active subscription for organization {}",
                org_id
            )));
        }

        let quota = record.tier.guest_list_quota();
        let quota_bound = quota.min(i32::MAX as u32) as i32;

        let updated: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET guest_list_events_count = guest_list_events_count + 1, updated_at = NOW()
            WHERE id = $1 AND status IN ('active', 'trialing')
              AND guest_list_events_count < $2
            RETURNING guest_list_events_count
            "#,
        )
        .bind(record.id)
        .bind(quota_bound)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((used,)) = updated {
            tracing::info!(
                org_id = %org_id,
                event_id = %event_id,
                used = used,
                quota = quota_bound,
                "Guest list event covered by subscription quota"
            );
            return Ok(GuestListSlot::Quota { used, quota });
        }

        let credits = CreditService::new(self.pool.clone());
        let entry = credits.use_credit(org_id, user_id, event_id).await?;
        Ok(GuestListSlot::Credit(entry))
    }

    // =========================================================================
    // Webhook-applied transitions (reconciler is the only caller)
    // =========================================================================

    /// Apply a paid invoice: status back to active, fresh period bounds, and
    /// the per-cycle guest-list quota reset to zero. The invoice that
    /// accompanies initial creation is excluded - creation already wrote the
    /// provisional row and the quota starts at zero.
    pub async fn apply_invoice_paid(
        &self,
        stripe_event_id: &str,
        invoice: &stripe::Invoice,
    ) -> BillingResult<()> {
        if matches!(
            invoice.billing_reason,
            Some(stripe::InvoiceBillingReason::SubscriptionCreate)
        ) {
            tracing::info!(
                invoice_id = %invoice.id,
                "Skipping creation invoice - subscription row already provisioned"
            );
            return Ok(());
        }

        let subscription_id = match invoice.subscription.as_ref() {
            Some(stripe::Expandable::Id(id)) => id.to_string(),
            Some(stripe::Expandable::Object(sub)) => sub.id.to_string(),
            None => {
                tracing::info!(
                    invoice_id = %invoice.id,
                    "Invoice is not tied to a subscription - nothing to apply"
                );
                return Ok(());
            }
        };

        // Fresh period bounds come from the renewal line item; fall back to a
        // provider retrieve when the invoice carries none.
        let period = invoice
            .lines
            .as_ref()
            .map(|lines| lines.data.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|line| line.period.as_ref())
            .filter_map(|p| Some((p.start?, p.end?)))
            .max_by_key(|(_, end)| *end);

        let (period_start, period_end) = match period {
            Some(bounds) => bounds,
            None => {
                let sub_id = subscription_id
                    .parse::<SubscriptionId>()
                    .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;
                let sub = Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;
                (sub.current_period_start, sub.current_period_end)
            }
        };

        let rows = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'active',
                current_period_start = $1,
                current_period_end = $2,
                guest_list_events_count = 0,
                updated_at = NOW()
            WHERE stripe_subscription_id = $3
              AND status NOT IN ('canceled', 'incomplete_expired')
            "#,
        )
        .bind(ts(period_start))
        .bind(ts(period_end))
        .bind(&subscription_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            tracing::warn!(
                subscription_id = %subscription_id,
                invoice_id = %invoice.id,
                "invoice paid for unknown or terminal subscription - no row updated"
            );
            return Ok(());
        }

        if let Some(org_id) = self.org_id_for_stripe_subscription(&subscription_id).await? {
            if let Err(e) = self
                .event_logger
                .log_event(
                    BillingEventBuilder::new(org_id, BillingEventType::InvoicePaid)
                        .data(serde_json::json!({
                            "amount_paid_cents": invoice.amount_paid,
                        }))
                        .stripe_event(stripe_event_id)
                        .stripe_subscription(subscription_id.clone())
                        .actor_type(ActorType::Stripe),
                )
                .await
            {
                tracing::warn!(error = %e, "Failed to log invoice paid event");
            }
        }

        tracing::info!(
            subscription_id = %subscription_id,
            "Invoice paid applied: period refreshed, guest list quota reset"
        );

        Ok(())
    }

    /// Apply a provider-side subscription update. This is the single place
    /// where externally-initiated tier and discount changes become visible
    /// locally.
    pub async fn apply_subscription_updated(
        &self,
        stripe_event_id: &str,
        subscription: &Subscription,
    ) -> BillingResult<()> {
        let price = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .ok_or_else(|| BillingError::Internal("No subscription items found".to_string()))?;

        let tier = match self.stripe.config().tier_for_price_id(price.id.as_str()) {
            Some(tier) => tier,
            None => {
                // A price we don't sell; keep the stored tier rather than
                // corrupting it, but surface the drift loudly.
                tracing::error!(
                    subscription_id = %subscription.id,
                    price_id = %price.id,
                    "subscription updated with unrecognized price - tier left unchanged"
                );
                return Err(BillingError::InvalidTier(price.id.to_string()));
            }
        };

        let pct = discount_percent(subscription);
        let amount_cents = apply_discount_cents(price.unit_amount.unwrap_or(0), pct);
        let status = map_status(subscription.status, subscription.cancel_at_period_end);
        let trial_end = subscription.trial_end.map(ts);

        let rows = sqlx::query(
            r#"
            UPDATE subscriptions
            SET tier = $1,
                stripe_price_id = $2,
                amount_cents = $3,
                discount_percentage = $4,
                stripe_promo_id = $5,
                current_period_start = $6,
                current_period_end = $7,
                trial_end = $8,
                status = $9,
                updated_at = NOW()
            WHERE stripe_subscription_id = $10
            "#,
        )
        .bind(tier)
        .bind(price.id.as_str())
        .bind(amount_cents)
        .bind(pct)
        .bind(promo_id(subscription))
        .bind(ts(subscription.current_period_start))
        .bind(ts(subscription.current_period_end))
        .bind(trial_end)
        .bind(status)
        .bind(subscription.id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            tracing::warn!(
                subscription_id = %subscription.id,
                "subscription.updated for unknown subscription - no local row"
            );
            return Ok(());
        }

        if let Some(org_id) = self.org_id_for_subscription(subscription).await? {
            if let Err(e) = self
                .event_logger
                .log_event(
                    BillingEventBuilder::new(org_id, BillingEventType::SubscriptionUpdated)
                        .data(serde_json::json!({
                            "tier": tier.as_str(),
                            "status": status.as_str(),
                            "amount_cents": amount_cents,
                            "cancel_at_period_end": subscription.cancel_at_period_end,
                        }))
                        .stripe_event(stripe_event_id)
                        .stripe_subscription(subscription.id.to_string())
                        .actor_type(ActorType::Stripe),
                )
                .await
            {
                tracing::warn!(error = %e, "Failed to log subscription updated event");
            }
        }

        tracing::info!(
            subscription_id = %subscription.id,
            tier = %tier,
            status = %status,
            "Subscription updated from provider"
        );

        Ok(())
    }

    /// Apply provider-side deletion: hard transition to canceled. The row is
    /// retained for history and reactivation.
    pub async fn apply_subscription_deleted(
        &self,
        stripe_event_id: &str,
        subscription: &Subscription,
    ) -> BillingResult<()> {
        let rows = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'canceled', updated_at = NOW()
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(subscription.id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            tracing::warn!(
                subscription_id = %subscription.id,
                "subscription.deleted for unknown subscription - no local row"
            );
            return Ok(());
        }

        if let Some(org_id) = self.org_id_for_subscription(subscription).await? {
            if let Err(e) = self
                .event_logger
                .log_event(
                    BillingEventBuilder::new(org_id, BillingEventType::SubscriptionCanceled)
                        .stripe_event(stripe_event_id)
                        .stripe_subscription(subscription.id.to_string())
                        .actor_type(ActorType::Stripe),
                )
                .await
            {
                tracing::warn!(error = %e, "Failed to log subscription canceled event");
            }
        }

        tracing::info!(
            subscription_id = %subscription.id,
            "Subscription canceled from provider"
        );

        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// The organization's single usable subscription, if any
    pub async fn get_usable_subscription(
        &self,
        org_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record: Option<SubscriptionRecord> = sqlx::query_as(
            r#"
            SELECT id, org_id, customer_id, stripe_subscription_id, stripe_price_id,
                   tier, status, amount_cents, discount_percentage, stripe_promo_id,
                   current_period_start, current_period_end, trial_end,
                   billing_cycle_anchor, guest_list_events_count
            FROM subscriptions
            WHERE org_id = $1 AND status NOT IN ('canceled', 'incomplete_expired')
            "#,
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// The most recent subscription row regardless of status
    pub async fn latest_subscription(
        &self,
        org_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record: Option<SubscriptionRecord> = sqlx::query_as(
            r#"
            SELECT id, org_id, customer_id, stripe_subscription_id, stripe_price_id,
                   tier, status, amount_cents, discount_percentage, stripe_promo_id,
                   current_period_start, current_period_end, trial_end,
                   billing_cycle_anchor, guest_list_events_count
            FROM subscriptions
            WHERE org_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn insert_local_row(
        &self,
        org_id: Uuid,
        customer_row_id: Uuid,
        subscription: &Subscription,
        tier: SubscriptionTier,
    ) -> BillingResult<SubscriptionRecord> {
        let price = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .ok_or_else(|| BillingError::Internal("No subscription items found".to_string()))?;

        let pct = discount_percent(subscription);
        let amount_cents = apply_discount_cents(price.unit_amount.unwrap_or(0), pct);
        let status = map_status(subscription.status, subscription.cancel_at_period_end);

        let record: SubscriptionRecord = sqlx::query_as(
            r#"
            INSERT INTO subscriptions
                (org_id, customer_id, stripe_subscription_id, stripe_price_id, tier,
                 status, amount_cents, discount_percentage, stripe_promo_id,
                 current_period_start, current_period_end, trial_end, billing_cycle_anchor)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING id, org_id, customer_id, stripe_subscription_id, stripe_price_id,
                      tier, status, amount_cents, discount_percentage, stripe_promo_id,
                      current_period_start, current_period_end, trial_end,
                      billing_cycle_anchor, guest_list_events_count
            "#,
        )
        .bind(org_id)
        .bind(customer_row_id)
        .bind(subscription.id.as_str())
        .bind(price.id.as_str())
        .bind(tier)
        .bind(status)
        .bind(amount_cents)
        .bind(pct)
        .bind(promo_id(subscription))
        .bind(ts(subscription.current_period_start))
        .bind(ts(subscription.current_period_end))
        .bind(subscription.trial_end.map(ts))
        .bind(ts(subscription.billing_cycle_anchor))
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn price_unit_amount(&self, price_id: &str) -> BillingResult<i64> {
        let id = price_id
            .parse::<PriceId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid price ID: {}", e)))?;
        let price = Price::retrieve(self.stripe.inner(), &id, &[]).await?;
        Ok(price.unit_amount.unwrap_or(0))
    }

    /// Quote the upcoming invoice for swapping this subscription onto a new
    /// price. Uses the POST /invoices/create_preview API directly (the
    /// async-stripe 0.39 bindings predate it).
    async fn upcoming_invoice_for_price(
        &self,
        record: &SubscriptionRecord,
        item_id: &str,
        new_price_id: &str,
    ) -> BillingResult<i64> {
        let customer: (Option<String>,) =
            sqlx::query_as("SELECT stripe_customer_id FROM customers WHERE id = $1")
                .bind(record.customer_id)
                .fetch_one(&self.pool)
                .await?;
        let customer_id = customer
            .0
            .ok_or_else(|| BillingError::CustomerNotFound(record.org_id.to_string()))?;

        let form_params = [
            ("customer", customer_id.as_str()),
            ("subscription", record.stripe_subscription_id.as_str()),
            ("subscription_details[items][0][id]", item_id),
            ("subscription_details[items][0][price]", new_price_id),
            ("subscription_details[proration_behavior]", "none"),
        ];

        let client = reqwest::Client::new();
        let response = client
            .post("https://api.stripe.com/v1/invoices/create_preview")
            .bearer_auth(&self.stripe.config().secret_key)
            .form(&form_params)
            .send()
            .await
            .map_err(|e| BillingError::StripeApi(format!("Failed to call Stripe API: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response.text().await.unwrap_or_default();
            tracing::error!(
                status = %status,
                error_body = %error_body,
                "Stripe invoices/create_preview API failed"
            );
            return Err(BillingError::StripeApi(format!(
                "Stripe API error ({}): {}",
                status, error_body
            )));
        }

        let upcoming_invoice: serde_json::Value = response.json().await.map_err(|e| {
            BillingError::StripeApi(format!("Failed to parse Stripe response: {}", e))
        })?;

        Ok(upcoming_invoice["amount_due"].as_i64().unwrap_or(0))
    }

    async fn org_id_for_subscription(
        &self,
        subscription: &Subscription,
    ) -> BillingResult<Option<Uuid>> {
        if let Some(org_id) = subscription
            .metadata
            .get("org_id")
            .and_then(|v| Uuid::parse_str(v).ok())
        {
            return Ok(Some(org_id));
        }
        self.org_id_for_stripe_subscription(subscription.id.as_str())
            .await
    }

    async fn org_id_for_stripe_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT org_id FROM subscriptions WHERE stripe_subscription_id = $1")
                .bind(stripe_subscription_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(org_id,)| org_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_status_basic() {
        assert_eq!(
            map_status(StripeSubStatus::Active, false),
            SubscriptionStatus::Active
        );
        assert_eq!(
            map_status(StripeSubStatus::Trialing, false),
            SubscriptionStatus::Trialing
        );
        assert_eq!(
            map_status(StripeSubStatus::PastDue, false),
            SubscriptionStatus::PastDue
        );
        assert_eq!(
            map_status(StripeSubStatus::Canceled, false),
            SubscriptionStatus::Canceled
        );
        assert_eq!(
            map_status(StripeSubStatus::IncompleteExpired, false),
            SubscriptionStatus::IncompleteExpired
        );
    }

    #[test]
    fn test_cancel_flag_maps_to_pending_cancellation() {
        assert_eq!(
            map_status(StripeSubStatus::Active, true),
            SubscriptionStatus::PendingCancellation
        );
        assert_eq!(
            map_status(StripeSubStatus::Trialing, true),
            SubscriptionStatus::PendingCancellation
        );
        // Terminal states stay terminal even with the flag set
        assert_eq!(
            map_status(StripeSubStatus::Canceled, true),
            SubscriptionStatus::Canceled
        );
    }

    #[test]
    fn test_ts_fallback_on_invalid_timestamp() {
        // A wildly out-of-range timestamp falls back to now rather than failing
        let converted = ts(i64::MAX);
        assert!(converted <= OffsetDateTime::now_utc());
    }
}
