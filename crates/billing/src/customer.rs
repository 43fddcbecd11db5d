//! Stripe customer management
//!
//! The local `customers` row is the durable billing identity: it is created on
//! first subscription purchase, deactivated (never deleted) on account
//! closure, and its presence is the history that trial eligibility is
//! evaluated against.

use sqlx::PgPool;
use stripe::{
    AttachPaymentMethod, CreateCustomer, Customer, CustomerId, CustomerInvoiceSettings,
    PaymentMethod, PaymentMethodId, UpdateCustomer,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Local billing identity record
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CustomerRecord {
    pub id: Uuid,
    pub org_id: Uuid,
    pub stripe_customer_id: String,
    pub default_payment_method_id: Option<String>,
    pub card_brand: Option<String>,
    pub card_last4: Option<String>,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
}

/// Customer service for managing Stripe customers and their local records
pub struct CustomerService {
    stripe: StripeClient,
    pool: PgPool,
}

impl CustomerService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Whether the organization has ever had a billing identity.
    ///
    /// Customers are deactivated rather than deleted, so a row here is durable
    /// history: a user cannot re-earn a trial by tearing down and recreating
    /// their subscription.
    pub async fn has_billing_history(&self, org_id: Uuid) -> BillingResult<bool> {
        let existing: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM customers WHERE org_id = $1")
                .bind(org_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(existing.is_some())
    }

    /// Get the local customer record for an organization
    pub async fn get_customer(&self, org_id: Uuid) -> BillingResult<Option<CustomerRecord>> {
        let record: Option<CustomerRecord> = sqlx::query_as(
            r#"
            SELECT id, org_id, stripe_customer_id, default_payment_method_id,
                   card_brand, card_last4, is_active, created_at
            FROM customers
            WHERE org_id = $1
            "#,
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Create or get the Stripe customer for an organization, persisting the
    /// local billing identity on first creation
    pub async fn get_or_create_customer(
        &self,
        org_id: Uuid,
        email: &str,
        name: &str,
    ) -> BillingResult<CustomerRecord> {
        if let Some(record) = self.get_customer(org_id).await? {
            return Ok(record);
        }

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("org_id".to_string(), org_id.to_string());
        metadata.insert("platform".to_string(), "doorlist".to_string());

        let params = CreateCustomer {
            email: Some(email),
            name: Some(name),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = Customer::create(self.stripe.inner(), params).await?;

        let record: CustomerRecord = sqlx::query_as(
            r#"
            INSERT INTO customers (org_id, stripe_customer_id)
            VALUES ($1, $2)
            RETURNING id, org_id, stripe_customer_id, default_payment_method_id,
                      card_brand, card_last4, is_active, created_at
            "#,
        )
        .bind(org_id)
        .bind(customer.id.as_str())
        .fetch_one(&self.pool)
        .await?;

        sqlx::query(
            "UPDATE organizations SET stripe_customer_id = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(customer.id.as_str())
        .bind(org_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            org_id = %org_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );

        Ok(record)
    }

    /// Attach a payment method to the organization's Stripe customer and make
    /// it the default, syncing card metadata onto the local record
    pub async fn attach_payment_method(
        &self,
        org_id: Uuid,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        let record = self
            .get_customer(org_id)
            .await?
            .ok_or_else(|| BillingError::CustomerNotFound(org_id.to_string()))?;

        let customer_id = record
            .stripe_customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;

        let pm_id = payment_method_id
            .parse::<PaymentMethodId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid payment method ID: {}", e)))?;

        let pm = PaymentMethod::attach(
            self.stripe.inner(),
            &pm_id,
            AttachPaymentMethod {
                customer: customer_id.clone(),
            },
        )
        .await?;

        let params = UpdateCustomer {
            invoice_settings: Some(CustomerInvoiceSettings {
                default_payment_method: Some(pm_id.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        Customer::update(self.stripe.inner(), &customer_id, params).await?;

        let card = pm.card.as_ref();
        sqlx::query(
            r#"
            UPDATE customers
            SET default_payment_method_id = $1,
                card_brand = $2,
                card_last4 = $3,
                updated_at = NOW()
            WHERE org_id = $4
            "#,
        )
        .bind(pm_id.as_str())
        .bind(card.map(|c| format!("{:?}", c.brand).to_lowercase()))
        .bind(card.map(|c| c.last4.clone()))
        .bind(org_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            org_id = %org_id,
            payment_method_id = %pm_id,
            "Attached default payment method"
        );

        Ok(())
    }

    /// Sync default payment method metadata from a provider-side customer
    /// update (the `customer.updated` webhook)
    pub async fn sync_from_provider(&self, customer: &Customer) -> BillingResult<()> {
        let default_pm = customer
            .invoice_settings
            .as_ref()
            .and_then(|settings| settings.default_payment_method.as_ref())
            .map(|pm| match pm {
                stripe::Expandable::Id(id) => id.to_string(),
                stripe::Expandable::Object(pm) => pm.id.to_string(),
            });

        let rows = sqlx::query(
            r#"
            UPDATE customers
            SET default_payment_method_id = $1, updated_at = NOW()
            WHERE stripe_customer_id = $2
            "#,
        )
        .bind(&default_pm)
        .bind(customer.id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            // Customers created out-of-band (e.g. in the Stripe dashboard)
            // have no local identity to sync; acknowledge and move on.
            tracing::warn!(
                customer_id = %customer.id,
                "customer.updated for unknown customer - no local record"
            );
        }

        Ok(())
    }

    /// Deactivate the billing identity on account closure. The row is
    /// retained: it is the durable history behind trial eligibility.
    pub async fn deactivate(&self, org_id: Uuid) -> BillingResult<()> {
        sqlx::query("UPDATE customers SET is_active = FALSE, updated_at = NOW() WHERE org_id = $1")
            .bind(org_id)
            .execute(&self.pool)
            .await?;

        sqlx::query("UPDATE organizations SET is_active = FALSE, updated_at = NOW() WHERE id = $1")
            .bind(org_id)
            .execute(&self.pool)
            .await?;

        tracing::info!(org_id = %org_id, "Deactivated billing identity");

        Ok(())
    }
}
