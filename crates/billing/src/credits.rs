//! Prepaid guest-list credit ledger
//!
//! Append-only transaction log plus a derived per-organization balance row.
//! Every mutation preserves the invariant `credits_used <= total_credits`,
//! including under concurrent callers: the balance check and the increment are
//! a single conditional UPDATE, never a read-compute-write across round trips.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{is_unique_violation, BillingError, BillingResult};

/// One immutable entry in the credit ledger
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CreditLedgerEntry {
    pub id: Uuid,
    pub org_id: Uuid,
    pub user_id: Uuid,
    pub entry_type: String,
    pub credits: i32,
    pub amount_paid_cents: Option<i64>,
    pub stripe_payment_id: Option<String>,
    pub event_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
}

/// Derived balance view for an organization
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CreditBalance {
    pub org_id: Uuid,
    pub total_credits: i32,
    pub credits_used: i32,
    pub updated_at: OffsetDateTime,
}

impl CreditBalance {
    /// Available credits; never stored, always derived
    pub fn available(&self) -> i64 {
        i64::from(self.total_credits) - i64::from(self.credits_used)
    }
}

/// Service for the credit ledger and balance row
pub struct CreditService {
    pool: PgPool,
}

impl CreditService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Grant purchased credits to an organization.
    ///
    /// Idempotent on `stripe_payment_id`: webhook redelivery returns the
    /// existing entry unchanged rather than double-crediting. The ledger
    /// insert and the balance increment commit in the same transaction.
    pub async fn add_credits(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        credits: i32,
        amount_paid_cents: i64,
        stripe_payment_id: &str,
    ) -> BillingResult<CreditLedgerEntry> {
        if credits <= 0 {
            return Err(BillingError::InvalidInput(
                "credits must be positive".to_string(),
            ));
        }

        if let Some(existing) = self.find_by_payment_id(stripe_payment_id).await? {
            tracing::info!(
                org_id = %org_id,
                stripe_payment_id = %stripe_payment_id,
                "Credit grant already recorded for this payment - returning existing entry"
            );
            return Ok(existing);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let inserted: Result<CreditLedgerEntry, sqlx::Error> = sqlx::query_as(
            r#"
            INSERT INTO credit_ledger
                (org_id, user_id, entry_type, credits, amount_paid_cents, stripe_payment_id)
            VALUES ($1, $2, 'added', $3, $4, $5)
            RETURNING id, org_id, user_id, entry_type, credits,
                      amount_paid_cents, stripe_payment_id, event_id, created_at
            "#,
        )
        .bind(org_id)
        .bind(user_id)
        .bind(credits)
        .bind(amount_paid_cents)
        .bind(stripe_payment_id)
        .fetch_one(&mut *tx)
        .await;

        let entry = match inserted {
            Ok(entry) => entry,
            Err(e) if is_unique_violation(&e) => {
                // A concurrent delivery of the same payment won the insert.
                // Drop our transaction and return what it wrote.
                drop(tx);
                return self
                    .find_by_payment_id(stripe_payment_id)
                    .await?
                    .ok_or_else(|| {
                        BillingError::Internal(format!(
                            "Credit entry for payment {} vanished after unique conflict",
                            stripe_payment_id
                        ))
                    });
            }
            Err(e) => return Err(BillingError::Database(e.to_string())),
        };

        sqlx::query(
            r#"
            INSERT INTO org_credit_balances (org_id, total_credits, credits_used, updated_at)
            VALUES ($1, $2, 0, NOW())
            ON CONFLICT (org_id) DO UPDATE SET
                total_credits = org_credit_balances.total_credits + EXCLUDED.total_credits,
                updated_at = NOW()
            "#,
        )
        .bind(org_id)
        .bind(credits)
        .execute(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        tracing::info!(
            org_id = %org_id,
            credits = credits,
            amount_paid_cents = amount_paid_cents,
            stripe_payment_id = %stripe_payment_id,
            "Credits added"
        );

        Ok(entry)
    }

    /// Consume one credit for a guest-list-enabled event.
    ///
    /// The availability check and the increment are one atomic conditional
    /// UPDATE; concurrent callers against the same organization serialize on
    /// the balance row, so `credits_used` can never exceed `total_credits`.
    pub async fn use_credit(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        event_id: Uuid,
    ) -> BillingResult<CreditLedgerEntry> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let rows_affected = sqlx::query(
            r#"
            UPDATE org_credit_balances
            SET credits_used = credits_used + 1, updated_at = NOW()
            WHERE org_id = $1 AND total_credits - credits_used > 0
            "#,
        )
        .bind(org_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?
        .rows_affected();

        if rows_affected == 0 {
            let available = self.balance(org_id).await?.map_or(0, |b| b.available());
            tracing::warn!(
                org_id = %org_id,
                event_id = %event_id,
                available = available,
                "Credit use rejected - balance exhausted"
            );
            return Err(BillingError::InsufficientCredits { available });
        }

        let entry: CreditLedgerEntry = sqlx::query_as(
            r#"
            INSERT INTO credit_ledger (org_id, user_id, entry_type, credits, event_id)
            VALUES ($1, $2, 'used', 1, $3)
            RETURNING id, org_id, user_id, entry_type, credits,
                      amount_paid_cents, stripe_payment_id, event_id, created_at
            "#,
        )
        .bind(org_id)
        .bind(user_id)
        .bind(event_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        tracing::info!(
            org_id = %org_id,
            event_id = %event_id,
            "Credit used for guest list event"
        );

        Ok(entry)
    }

    /// Current balance for an organization, if a balance row exists
    pub async fn balance(&self, org_id: Uuid) -> BillingResult<Option<CreditBalance>> {
        let balance: Option<CreditBalance> = sqlx::query_as(
            "SELECT org_id, total_credits, credits_used, updated_at FROM org_credit_balances WHERE org_id = $1",
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(balance)
    }

    /// Ledger history for an organization, newest first
    pub async fn history(&self, org_id: Uuid, limit: i64) -> BillingResult<Vec<CreditLedgerEntry>> {
        let entries: Vec<CreditLedgerEntry> = sqlx::query_as(
            r#"
            SELECT id, org_id, user_id, entry_type, credits,
                   amount_paid_cents, stripe_payment_id, event_id, created_at
            FROM credit_ledger
            WHERE org_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(org_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn find_by_payment_id(
        &self,
        stripe_payment_id: &str,
    ) -> BillingResult<Option<CreditLedgerEntry>> {
        let entry: Option<CreditLedgerEntry> = sqlx::query_as(
            r#"
            SELECT id, org_id, user_id, entry_type, credits,
                   amount_paid_cents, stripe_payment_id, event_id, created_at
            FROM credit_ledger
            WHERE stripe_payment_id = $1
            "#,
        )
        .bind(stripe_payment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry)
    }
}
