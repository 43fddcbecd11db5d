//! Billing routes: subscriptions, credits, and the Stripe webhook endpoint

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use doorlist_billing::{
    CreateSubscriptionRequest, GuestListSlot, PendingTierChange, ReactivateRequest,
    SubscriptionRecord, TierQuote,
};
use doorlist_shared::SubscriptionTier;

use crate::auth::{Identity, Role};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn fmt_rfc3339(t: OffsetDateTime) -> String {
    t.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

fn parse_tier(raw: &str) -> ApiResult<SubscriptionTier> {
    SubscriptionTier::parse(raw)
        .ok_or_else(|| ApiError::Validation(format!("Unknown subscription tier: {}", raw)))
}

// ============================================================================
// Webhook endpoint
// ============================================================================

/// Handle Stripe webhook events
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    // Get signature header
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    // Verify and parse event
    let event = state
        .billing
        .webhooks
        .verify_event(&body, signature)
        .map_err(|e| {
            tracing::warn!(error = ?e, "Stripe webhook signature verification failed");
            ApiError::BadRequest("Invalid webhook signature".to_string())
        })?;

    tracing::info!(
        event_type = %event.type_,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    // Handle the event. A failure here returns a non-2xx so the provider
    // redelivers; webhook errors are never surfaced to an end user.
    state.billing.webhooks.handle_event(event).await.map_err(|e| {
        tracing::error!("Webhook handling error: {}", e);
        ApiError::Database(format!("Webhook handling error: {}", e))
    })?;

    Ok(StatusCode::OK)
}

// ============================================================================
// Subscription endpoints
// ============================================================================

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub stripe_subscription_id: String,
    pub tier: String,
    pub status: String,
    pub amount_cents: i64,
    pub discount_percentage: Option<f64>,
    pub current_period_start: String,
    pub current_period_end: String,
    pub trial_end: Option<String>,
    pub guest_list_events_count: i32,
}

impl From<SubscriptionRecord> for SubscriptionResponse {
    fn from(record: SubscriptionRecord) -> Self {
        Self {
            stripe_subscription_id: record.stripe_subscription_id,
            tier: record.tier.to_string(),
            status: record.status.to_string(),
            amount_cents: record.amount_cents,
            discount_percentage: record.discount_percentage,
            current_period_start: fmt_rfc3339(record.current_period_start),
            current_period_end: fmt_rfc3339(record.current_period_end),
            trial_end: record.trial_end.map(fmt_rfc3339),
            guest_list_events_count: record.guest_list_events_count,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub tier: String,
    pub payment_method_id: String,
    pub promo_code: Option<String>,
    pub billing_email: String,
    pub org_name: String,
}

/// Create a subscription for the caller's organization
pub async fn subscribe(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<SubscribeRequest>,
) -> ApiResult<Json<SubscriptionResponse>> {
    identity.require_role(&[Role::Owner])?;

    let tier = parse_tier(&request.tier)?;

    let record = state
        .billing
        .subscriptions
        .create_subscription(
            identity.org_id,
            identity.user_id,
            CreateSubscriptionRequest {
                tier,
                payment_method_id: request.payment_method_id,
                promo_code: request.promo_code,
                billing_email: request.billing_email,
                org_name: request.org_name,
            },
        )
        .await?;

    Ok(Json(record.into()))
}

/// Get the organization's current subscription
pub async fn get_subscription(
    State(state): State<AppState>,
    identity: Identity,
) -> ApiResult<Json<SubscriptionResponse>> {
    let record = state
        .billing
        .subscriptions
        .get_usable_subscription(identity.org_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(record.into()))
}

/// Quote the prorated cost of switching to each tier
pub async fn preview_tier_change(
    State(state): State<AppState>,
    identity: Identity,
) -> ApiResult<Json<Vec<TierQuote>>> {
    identity.require_role(&[Role::Owner, Role::Admin])?;

    let quotes = state
        .billing
        .subscriptions
        .preview_tier_change(identity.org_id)
        .await?;

    Ok(Json(quotes))
}

#[derive(Debug, Deserialize)]
pub struct ChangeTierRequest {
    pub tier: String,
}

/// Request a tier change. The local record updates when the provider's
/// confirmation webhook lands, so the response is explicitly "pending".
pub async fn change_tier(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<ChangeTierRequest>,
) -> ApiResult<Json<PendingTierChange>> {
    identity.require_role(&[Role::Owner])?;

    let tier = parse_tier(&request.tier)?;

    let pending = state
        .billing
        .subscriptions
        .change_tier(identity.org_id, identity.user_id, tier)
        .await?;

    Ok(Json(pending))
}

/// Cancel the subscription at period end
pub async fn cancel(
    State(state): State<AppState>,
    identity: Identity,
) -> ApiResult<StatusCode> {
    identity.require_role(&[Role::Owner])?;

    state
        .billing
        .subscriptions
        .cancel_at_period_end(identity.org_id, identity.user_id)
        .await?;

    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub struct ReactivateBody {
    pub tier: String,
    pub payment_method_id: String,
}

/// Reactivate a canceled subscription with a new payment method
pub async fn reactivate(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<ReactivateBody>,
) -> ApiResult<Json<SubscriptionResponse>> {
    identity.require_role(&[Role::Owner])?;

    let tier = parse_tier(&request.tier)?;

    let record = state
        .billing
        .subscriptions
        .reactivate(
            identity.org_id,
            identity.user_id,
            ReactivateRequest {
                tier,
                payment_method_id: request.payment_method_id,
            },
        )
        .await?;

    Ok(Json(record.into()))
}

// ============================================================================
// Credit endpoints
// ============================================================================

#[derive(Debug, Serialize)]
pub struct CreditBalanceResponse {
    pub total_credits: i32,
    pub credits_used: i32,
    pub available: i64,
}

/// Get the organization's guest-list credit balance
pub async fn credit_balance(
    State(state): State<AppState>,
    identity: Identity,
) -> ApiResult<Json<CreditBalanceResponse>> {
    identity.require_role(&[Role::Owner, Role::Admin])?;

    let balance = state.billing.credits.balance(identity.org_id).await?;

    let response = match balance {
        Some(b) => CreditBalanceResponse {
            total_credits: b.total_credits,
            credits_used: b.credits_used,
            available: b.available(),
        },
        None => CreditBalanceResponse {
            total_credits: 0,
            credits_used: 0,
            available: 0,
        },
    };

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct BuyCreditsRequest {
    pub credits: i32,
    pub amount_cents: i64,
}

#[derive(Debug, Serialize)]
pub struct PaymentIntentResponse {
    pub payment_intent_id: String,
    pub client_secret: Option<String>,
    pub amount_cents: i64,
}

/// Create a payment intent for a credit pack; credits land when the payment
/// confirmation webhook arrives
pub async fn buy_credits(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<BuyCreditsRequest>,
) -> ApiResult<Json<PaymentIntentResponse>> {
    identity.require_role(&[Role::Owner, Role::Admin])?;

    let payment_intent = state
        .billing
        .payments
        .create_credit_pack_payment_intent(
            identity.org_id,
            identity.user_id,
            request.credits,
            request.amount_cents,
        )
        .await?;

    Ok(Json(PaymentIntentResponse {
        payment_intent_id: payment_intent.id.to_string(),
        client_secret: payment_intent.client_secret.clone(),
        amount_cents: payment_intent.amount,
    }))
}

#[derive(Debug, Deserialize)]
pub struct GuestListSlotRequest {
    pub event_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct GuestListSlotResponse {
    pub source: String,
    pub quota_used: Option<i32>,
    pub quota: Option<u32>,
}

/// Consume a guest-list slot (subscription quota first, then a prepaid
/// credit) for a guest-list-enabled event
pub async fn use_guest_list_slot(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<GuestListSlotRequest>,
) -> ApiResult<Json<GuestListSlotResponse>> {
    identity.require_role(&[Role::Owner, Role::Admin])?;

    let slot = state
        .billing
        .subscriptions
        .use_guest_list_slot(identity.org_id, identity.user_id, request.event_id)
        .await?;

    let response = match slot {
        GuestListSlot::Quota { used, quota } => GuestListSlotResponse {
            source: "quota".to_string(),
            quota_used: Some(used),
            quota: Some(quota),
        },
        GuestListSlot::Credit(_) => GuestListSlotResponse {
            source: "credit".to_string(),
            quota_used: None,
            quota: None,
        },
    };

    Ok(Json(response))
}
