//! Stripe webhook handling
//!
//! Entry point for provider events: verifies authenticity, deduplicates via
//! the idempotency ledger, and dispatches to the subscription state machine,
//! the credit ledger, or ticket issuance.
//!
//! Dedup is insert-first: the event id is written to `stripe_webhook_events`
//! (write-once, unique) before any side effect runs. A conflicting insert
//! means the event was already applied and is acked without reapplying
//! anything. If a handler fails, the ledger row is deleted in compensation so
//! the record is withheld and provider redelivery can retry.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{Event, EventObject, EventType, Webhook};
use uuid::Uuid;

use doorlist_tickets::{InventoryGuard, IssueTicketsParams, TicketError, TicketRequest};

use crate::client::StripeClient;
use crate::credits::CreditService;
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::subscriptions::SubscriptionService;

type HmacSha256 = Hmac<Sha256>;

/// Parse a Stripe signature header (`t=timestamp,v1=signature,...`) into its
/// timestamp and v1 signature
fn parse_signature_header(signature: &str) -> (Option<i64>, Option<String>) {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    (timestamp, v1_signature)
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    stripe: StripeClient,
    pool: PgPool,
    event_logger: BillingEventLogger,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let event_logger = BillingEventLogger::new(pool.clone());
        Self {
            stripe,
            pool,
            event_logger,
        }
    }

    /// Verify and parse a Stripe webhook event
    ///
    /// Uses manual signature verification as a fallback to work around
    /// async-stripe version incompatibility with newer Stripe API versions.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::warn!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        // Manual signature verification for newer Stripe API versions
        let (timestamp, v1_signature) = parse_signature_header(signature);

        let timestamp = timestamp.ok_or_else(|| {
            tracing::error!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        let v1_signature = v1_signature.ok_or_else(|| {
            tracing::error!("Missing v1 signature in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        // Check timestamp tolerance (5 minutes)
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| {
                tracing::error!("System time error: {}", e);
                BillingError::WebhookSignatureInvalid
            })?
            .as_secs() as i64;

        if (now - timestamp).abs() > 300 {
            tracing::error!(
                timestamp = timestamp,
                now = now,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let secret_key = webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(webhook_secret);
        let signed_payload = format!("{}.{}", timestamp, payload);

        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).map_err(|_| {
            tracing::error!("Invalid webhook secret key");
            BillingError::WebhookSignatureInvalid
        })?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            tracing::error!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::Internal(format!("Failed to parse webhook event: {}", e))
        })?;

        Ok(event)
    }

    /// Handle a verified Stripe event.
    ///
    /// The insert into the idempotency ledger must be atomic with respect to
    /// concurrent deliveries of the same event id, so it relies on the unique
    /// constraint (`ON CONFLICT ... RETURNING`), never a read-then-write
    /// check.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type_str = event.type_.to_string();

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events (stripe_event_id, event_type)
            VALUES ($1, $2)
            ON CONFLICT (stripe_event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&event_id)
        .bind(&event_type_str)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to record webhook event in idempotency ledger"
            );
            BillingError::Database(e.to_string())
        })?;

        if claimed.is_none() {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type_str,
                "Duplicate webhook event - already applied, acking without side effects"
            );
            return Ok(());
        }

        tracing::info!(
            event_type = %event.type_,
            event_id = %event.id,
            "Processing Stripe webhook event"
        );

        let result = self.process_event_internal(&event).await;

        if let Err(e) = &result {
            tracing::error!(
                event_id = %event_id,
                event_type = %event_type_str,
                error = %e,
                "Webhook handler failed - withholding idempotency record for redelivery"
            );

            // Compensating delete: the record must not survive a failed
            // handler, or the provider's retry would be deduplicated away.
            if let Err(delete_err) =
                sqlx::query("DELETE FROM stripe_webhook_events WHERE stripe_event_id = $1")
                    .bind(&event_id)
                    .execute(&self.pool)
                    .await
            {
                tracing::error!(
                    event_id = %event_id,
                    error = %delete_err,
                    "CRITICAL: failed to withhold idempotency record after handler failure. \
                     Provider redelivery will be treated as a duplicate. \
                     Manual intervention may be required."
                );
            }
        }

        result
    }

    /// Whether an event id has been applied (visible in the ledger)
    pub async fn is_applied(&self, stripe_event_id: &str) -> BillingResult<bool> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM stripe_webhook_events WHERE stripe_event_id = $1")
                .bind(stripe_event_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.is_some())
    }

    /// Internal event processing logic
    async fn process_event_internal(&self, event: &Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let subscriptions = SubscriptionService::new(self.stripe.clone(), self.pool.clone());

        match event.type_ {
            EventType::InvoicePaymentSucceeded | EventType::InvoicePaid => {
                let invoice = self.extract_invoice(event)?;
                subscriptions.apply_invoice_paid(&event_id, &invoice).await?;
            }

            EventType::CustomerSubscriptionUpdated => {
                let subscription = self.extract_subscription(event)?;
                subscriptions
                    .apply_subscription_updated(&event_id, &subscription)
                    .await?;
            }

            EventType::CustomerSubscriptionDeleted => {
                let subscription = self.extract_subscription(event)?;
                subscriptions
                    .apply_subscription_deleted(&event_id, &subscription)
                    .await?;
            }

            EventType::CustomerUpdated => {
                let customer = self.extract_customer(event)?;
                let customers = CustomerService::new(self.stripe.clone(), self.pool.clone());
                customers.sync_from_provider(&customer).await?;
            }

            EventType::AccountUpdated => {
                let account = self.extract_account(event)?;
                self.handle_account_updated(&event_id, &account).await?;
            }

            EventType::PaymentIntentSucceeded => {
                let payment_intent = self.extract_payment_intent(event)?;
                self.handle_payment_intent_succeeded(&event_id, &payment_intent)
                    .await?;
            }

            _ => {
                // Ack unhandled types: a failure response would make the
                // provider retry an event we intentionally ignore, forever.
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Received unhandled Stripe event type - no handler configured"
                );
            }
        }

        Ok(())
    }

    /// Connected payout account updated: sync the charges_enabled flag onto
    /// the owning organization
    async fn handle_account_updated(
        &self,
        stripe_event_id: &str,
        account: &stripe::Account,
    ) -> BillingResult<()> {
        let charges_enabled = account.charges_enabled.unwrap_or(false);

        let org: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE organizations
            SET charges_enabled = $1, updated_at = NOW()
            WHERE stripe_account_id = $2
            RETURNING id
            "#,
        )
        .bind(charges_enabled)
        .bind(account.id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match org {
            Some((org_id,)) => {
                if let Err(e) = self
                    .event_logger
                    .log_event(
                        BillingEventBuilder::new(org_id, BillingEventType::AccountUpdated)
                            .data(serde_json::json!({ "charges_enabled": charges_enabled }))
                            .stripe_event(stripe_event_id)
                            .actor_type(ActorType::Stripe),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Failed to log account updated event");
                }

                tracing::info!(
                    org_id = %org_id,
                    account_id = %account.id,
                    charges_enabled = charges_enabled,
                    "Connected account updated"
                );
            }
            None => {
                tracing::warn!(
                    account_id = %account.id,
                    "account.updated for unknown connected account"
                );
            }
        }

        Ok(())
    }

    /// Payment confirmed: fulfill what the intent's metadata says it paid for.
    ///
    /// - Credit packs (`credits` key) go through the idempotent
    ///   `add_credits`, which guards against redelivery on the payment id.
    /// - Ticket sales (`event_id` + `ticket_counts` keys) go through the
    ///   authoritative inventory re-check. If a concurrent purchase exhausted
    ///   the inventory between payment-intent creation and now, the payment
    ///   is refunded rather than silently issuing a ticket.
    async fn handle_payment_intent_succeeded(
        &self,
        stripe_event_id: &str,
        payment_intent: &stripe::PaymentIntent,
    ) -> BillingResult<()> {
        let metadata = &payment_intent.metadata;
        let payment_id = payment_intent.id.to_string();

        if let Some(credits_str) = metadata.get("credits") {
            let org_id = self.metadata_uuid(metadata, "org_id", &payment_id)?;
            let user_id = self.metadata_uuid(metadata, "user_id", &payment_id)?;
            let credits: i32 = credits_str.parse().map_err(|_| {
                BillingError::InvalidInput(format!(
                    "payment intent {} has non-numeric credits metadata",
                    payment_id
                ))
            })?;

            let credit_service = CreditService::new(self.pool.clone());
            credit_service
                .add_credits(org_id, user_id, credits, payment_intent.amount, &payment_id)
                .await?;

            if let Err(e) = self
                .event_logger
                .log_event(
                    BillingEventBuilder::new(org_id, BillingEventType::CreditsAdded)
                        .data(serde_json::json!({
                            "credits": credits,
                            "amount_paid_cents": payment_intent.amount,
                        }))
                        .stripe_event(stripe_event_id)
                        .actor_type(ActorType::Stripe),
                )
                .await
            {
                tracing::warn!(error = %e, "Failed to log credits added event");
            }

            return Ok(());
        }

        if metadata.contains_key("event_id") {
            return self
                .fulfill_ticket_purchase(stripe_event_id, payment_intent)
                .await;
        }

        tracing::info!(
            payment_intent_id = %payment_id,
            "payment_intent.succeeded without fulfillment metadata - nothing to apply"
        );

        Ok(())
    }

    async fn fulfill_ticket_purchase(
        &self,
        stripe_event_id: &str,
        payment_intent: &stripe::PaymentIntent,
    ) -> BillingResult<()> {
        let metadata = &payment_intent.metadata;
        let payment_id = payment_intent.id.to_string();

        let event_id = self.metadata_uuid(metadata, "event_id", &payment_id)?;
        let org_id = self.metadata_uuid(metadata, "org_id", &payment_id)?;
        let email = metadata.get("email").cloned().unwrap_or_default();
        let promoter_user_id = metadata
            .get("promoter_user_id")
            .and_then(|v| Uuid::parse_str(v).ok());

        let counts: std::collections::HashMap<Uuid, i64> = metadata
            .get("ticket_counts")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .ok_or_else(|| {
                BillingError::InvalidInput(format!(
                    "payment intent {} has missing or malformed ticket_counts metadata",
                    payment_id
                ))
            })?;

        let requests: Vec<TicketRequest> = counts
            .into_iter()
            .map(|(ticket_type_id, quantity)| TicketRequest {
                ticket_type_id,
                quantity,
            })
            .collect();

        let guard = InventoryGuard::new(self.pool.clone());
        let issued = guard
            .issue_tickets(IssueTicketsParams {
                event_id,
                org_id,
                email,
                promoter_user_id,
                stripe_payment_id: Some(payment_id.clone()),
                requests,
            })
            .await;

        match issued {
            Ok(tickets) => {
                if let Err(e) = self
                    .event_logger
                    .log_event(
                        BillingEventBuilder::new(org_id, BillingEventType::TicketsIssued)
                            .data(serde_json::json!({
                                "event_id": event_id,
                                "count": tickets.len(),
                            }))
                            .stripe_event(stripe_event_id)
                            .actor_type(ActorType::Stripe),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Failed to log tickets issued event");
                }

                tracing::info!(
                    payment_intent_id = %payment_id,
                    event_id = %event_id,
                    count = tickets.len(),
                    "Tickets issued for confirmed payment"
                );

                Ok(())
            }
            Err(TicketError::InsufficientInventory {
                ticket_type_id,
                requested,
                available,
            }) => {
                // The payment won its race against our availability check but
                // lost it against a concurrent purchase. Refund instead of
                // overselling; the event is considered applied.
                tracing::warn!(
                    payment_intent_id = %payment_id,
                    ticket_type_id = %ticket_type_id,
                    requested = requested,
                    available = available,
                    "Inventory exhausted after payment - refunding"
                );

                self.refund_payment_intent(payment_intent).await?;

                if let Err(e) = self
                    .event_logger
                    .log_event(
                        BillingEventBuilder::new(org_id, BillingEventType::PaymentRefunded)
                            .subtype("oversell")
                            .data(serde_json::json!({
                                "event_id": event_id,
                                "ticket_type_id": ticket_type_id,
                                "requested": requested,
                                "available": available,
                            }))
                            .stripe_event(stripe_event_id)
                            .actor_type(ActorType::System),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Failed to log refund event");
                }

                Ok(())
            }
            Err(e) => Err(BillingError::Internal(format!(
                "Ticket issuance failed for payment {}: {}",
                payment_id, e
            ))),
        }
    }

    async fn refund_payment_intent(
        &self,
        payment_intent: &stripe::PaymentIntent,
    ) -> BillingResult<()> {
        let params = stripe::CreateRefund {
            payment_intent: Some(payment_intent.id.clone()),
            ..Default::default()
        };

        let refund = stripe::Refund::create(self.stripe.inner(), params).await?;

        tracing::info!(
            payment_intent_id = %payment_intent.id,
            refund_id = %refund.id,
            "Refunded payment intent"
        );

        Ok(())
    }

    fn metadata_uuid(
        &self,
        metadata: &std::collections::HashMap<String, String>,
        key: &str,
        payment_id: &str,
    ) -> BillingResult<Uuid> {
        metadata
            .get(key)
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or_else(|| {
                BillingError::InvalidInput(format!(
                    "payment intent {} has missing or malformed {} metadata",
                    payment_id, key
                ))
            })
    }

    fn extract_subscription(&self, event: &Event) -> BillingResult<stripe::Subscription> {
        match &event.data.object {
            EventObject::Subscription(subscription) => Ok(subscription.clone()),
            other => Err(BillingError::Internal(format!(
                "Expected subscription object in {} event, got {:?}",
                event.type_, other
            ))),
        }
    }

    fn extract_invoice(&self, event: &Event) -> BillingResult<stripe::Invoice> {
        match &event.data.object {
            EventObject::Invoice(invoice) => Ok(invoice.clone()),
            other => Err(BillingError::Internal(format!(
                "Expected invoice object in {} event, got {:?}",
                event.type_, other
            ))),
        }
    }

    fn extract_customer(&self, event: &Event) -> BillingResult<stripe::Customer> {
        match &event.data.object {
            EventObject::Customer(customer) => Ok(customer.clone()),
            other => Err(BillingError::Internal(format!(
                "Expected customer object in {} event, got {:?}",
                event.type_, other
            ))),
        }
    }

    fn extract_account(&self, event: &Event) -> BillingResult<stripe::Account> {
        match &event.data.object {
            EventObject::Account(account) => Ok(account.clone()),
            other => Err(BillingError::Internal(format!(
                "Expected account object in {} event, got {:?}",
                event.type_, other
            ))),
        }
    }

    fn extract_payment_intent(&self, event: &Event) -> BillingResult<stripe::PaymentIntent> {
        match &event.data.object {
            EventObject::PaymentIntent(payment_intent) => Ok(payment_intent.clone()),
            other => Err(BillingError::Internal(format!(
                "Expected payment intent object in {} event, got {:?}",
                event.type_, other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signature_header() {
        let (ts, v1) = parse_signature_header("t=1712000000,v1=abc123,v0=ignored");
        assert_eq!(ts, Some(1712000000));
        assert_eq!(v1, Some("abc123".to_string()));
    }

    #[test]
    fn test_parse_signature_header_missing_parts() {
        let (ts, v1) = parse_signature_header("v1=abc123");
        assert_eq!(ts, None);
        assert_eq!(v1, Some("abc123".to_string()));

        let (ts, v1) = parse_signature_header("t=notanumber");
        assert_eq!(ts, None);
        assert_eq!(v1, None);
    }
}
