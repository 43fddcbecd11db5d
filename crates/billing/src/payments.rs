//! Payment intents for ticket sales and credit packs
//!
//! Purchases are payment-intent based: the intent carries fulfillment
//! metadata (organization, event, per-type ticket counts) and the
//! `payment_intent.succeeded` webhook performs the actual fulfillment with
//! the authoritative inventory re-check. Nothing is committed locally at
//! intent-creation time.

use sqlx::PgPool;
use stripe::{CreatePaymentIntent, Currency, PaymentIntent};
use uuid::Uuid;

use doorlist_tickets::{InventoryGuard, TicketRequest};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Payment service for creating Stripe payment intents
pub struct PaymentService {
    stripe: StripeClient,
    pool: PgPool,
}

impl PaymentService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Create a payment intent for a ticket purchase.
    ///
    /// Availability is checked here so obviously-dead purchases fail fast,
    /// but the check is advisory: the binding check runs when the payment
    /// confirmation webhook commits the ticket rows.
    pub async fn create_ticket_payment_intent(
        &self,
        org_id: Uuid,
        event_id: Uuid,
        email: &str,
        promoter_user_id: Option<Uuid>,
        requests: &[TicketRequest],
    ) -> BillingResult<PaymentIntent> {
        let guard = InventoryGuard::new(self.pool.clone());
        guard
            .validate_availability(event_id, requests)
            .await
            .map_err(|e| BillingError::InvalidInput(e.to_string()))?;

        let mut amount_cents: i64 = 0;
        for request in requests {
            let price: Option<(i64,)> = sqlx::query_as(
                "SELECT price_cents FROM event_ticket_types WHERE id = $1 AND event_id = $2",
            )
            .bind(request.ticket_type_id)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;

            let (price_cents,) = price.ok_or_else(|| {
                BillingError::NotFound(format!("ticket type {}", request.ticket_type_id))
            })?;
            amount_cents += price_cents * request.quantity;
        }

        if amount_cents <= 0 {
            return Err(BillingError::InvalidInput(
                "purchase amount must be positive".to_string(),
            ));
        }

        let counts: std::collections::HashMap<String, i64> = requests
            .iter()
            .map(|r| (r.ticket_type_id.to_string(), r.quantity))
            .collect();
        let counts_json = serde_json::to_string(&counts)
            .map_err(|e| BillingError::Internal(format!("Failed to encode ticket counts: {}", e)))?;

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("org_id".to_string(), org_id.to_string());
        metadata.insert("event_id".to_string(), event_id.to_string());
        metadata.insert("email".to_string(), email.to_string());
        metadata.insert("ticket_counts".to_string(), counts_json);
        if let Some(promoter) = promoter_user_id {
            metadata.insert("promoter_user_id".to_string(), promoter.to_string());
        }

        let mut params = CreatePaymentIntent::new(amount_cents, Currency::USD);
        params.metadata = Some(metadata);
        params.receipt_email = Some(email);

        let payment_intent = PaymentIntent::create(self.stripe.inner(), params).await?;

        tracing::info!(
            org_id = %org_id,
            event_id = %event_id,
            payment_intent_id = %payment_intent.id,
            amount_cents = amount_cents,
            "Created ticket payment intent"
        );

        Ok(payment_intent)
    }

    /// Create a payment intent for a guest-list credit pack
    pub async fn create_credit_pack_payment_intent(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        credits: i32,
        amount_cents: i64,
    ) -> BillingResult<PaymentIntent> {
        if credits <= 0 || amount_cents <= 0 {
            return Err(BillingError::InvalidInput(
                "credits and amount must be positive".to_string(),
            ));
        }

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("org_id".to_string(), org_id.to_string());
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("credits".to_string(), credits.to_string());

        let mut params = CreatePaymentIntent::new(amount_cents, Currency::USD);
        params.metadata = Some(metadata);

        let payment_intent = PaymentIntent::create(self.stripe.inner(), params).await?;

        tracing::info!(
            org_id = %org_id,
            payment_intent_id = %payment_intent.id,
            credits = credits,
            amount_cents = amount_cents,
            "Created credit pack payment intent"
        );

        Ok(payment_intent)
    }
}
