//! Inventory Reservation Guard
//!
//! Capacity is fixed when a ticket type is created, and the sold count is
//! always derived from committed ticket rows - there is no counter column
//! that could drift. Two checks exist:
//!
//! - `validate_availability` is advisory, run when quoting a purchase or
//!   creating a payment intent.
//! - `issue_tickets` is authoritative: it re-derives sold counts inside the
//!   same transaction that commits the ticket rows, with the ticket-type rows
//!   locked, so the window between "show remaining capacity" and "commit the
//!   purchase" cannot oversell. A payment that lands after a concurrent
//!   purchase exhausted the type gets `InsufficientInventory` back and the
//!   caller refunds it instead of issuing a ticket.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{TicketError, TicketResult};

/// One requested ticket type and quantity
#[derive(Debug, Clone, Copy)]
pub struct TicketRequest {
    pub ticket_type_id: Uuid,
    pub quantity: i64,
}

/// Parameters for committing a paid ticket purchase
#[derive(Debug, Clone)]
pub struct IssueTicketsParams {
    pub event_id: Uuid,
    pub org_id: Uuid,
    pub email: String,
    pub promoter_user_id: Option<Uuid>,
    pub stripe_payment_id: Option<String>,
    pub requests: Vec<TicketRequest>,
}

/// A committed ticket
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IssuedTicket {
    pub id: Uuid,
    pub event_ticket_type_id: Uuid,
    pub ticket_unique_id: Uuid,
}

/// Guard over ticket-type capacity
pub struct InventoryGuard {
    pool: PgPool,
}

impl InventoryGuard {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Advisory availability check against committed ticket rows.
    ///
    /// Passing here does not reserve anything: the authoritative check runs
    /// again inside `issue_tickets` at commit time.
    pub async fn validate_availability(
        &self,
        event_id: Uuid,
        requests: &[TicketRequest],
    ) -> TicketResult<()> {
        for request in requests {
            if request.quantity <= 0 {
                return Err(TicketError::InvalidInput(
                    "ticket quantity must be positive".to_string(),
                ));
            }

            let row: Option<(i32, bool)> = sqlx::query_as(
                "SELECT capacity, is_active FROM event_ticket_types WHERE id = $1 AND event_id = $2",
            )
            .bind(request.ticket_type_id)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;

            let (capacity, is_active) = row.ok_or_else(|| {
                TicketError::TicketTypeNotFound(request.ticket_type_id.to_string())
            })?;

            if !is_active {
                return Err(TicketError::TicketTypeInactive(
                    request.ticket_type_id.to_string(),
                ));
            }

            let sold: (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM tickets WHERE event_ticket_type_id = $1")
                    .bind(request.ticket_type_id)
                    .fetch_one(&self.pool)
                    .await?;

            let available = i64::from(capacity) - sold.0;
            if request.quantity > available {
                return Err(TicketError::InsufficientInventory {
                    ticket_type_id: request.ticket_type_id,
                    requested: request.quantity,
                    available: available.max(0),
                });
            }
        }

        Ok(())
    }

    /// Commit a paid purchase.
    ///
    /// Locks the requested ticket-type rows (`FOR UPDATE`), re-derives the
    /// sold counts inside the transaction, and only then inserts the ticket
    /// rows. Concurrent purchases for the same type serialize on the row
    /// lock; the loser observes the winner's committed tickets and fails with
    /// `InsufficientInventory` instead of overselling.
    pub async fn issue_tickets(
        &self,
        params: IssueTicketsParams,
    ) -> TicketResult<Vec<IssuedTicket>> {
        if params.requests.is_empty() {
            return Err(TicketError::InvalidInput(
                "at least one ticket must be requested".to_string(),
            ));
        }

        let type_ids: Vec<Uuid> = params.requests.iter().map(|r| r.ticket_type_id).collect();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| TicketError::Database(e.to_string()))?;

        let locked: Vec<(Uuid, i32)> = sqlx::query_as(
            r#"
            SELECT id, capacity
            FROM event_ticket_types
            WHERE event_id = $1 AND id = ANY($2)
            FOR UPDATE
            "#,
        )
        .bind(params.event_id)
        .bind(&type_ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| TicketError::Database(e.to_string()))?;

        for request in &params.requests {
            let capacity = locked
                .iter()
                .find(|(id, _)| *id == request.ticket_type_id)
                .map(|(_, capacity)| *capacity)
                .ok_or_else(|| {
                    TicketError::TicketTypeNotFound(request.ticket_type_id.to_string())
                })?;

            let sold: (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM tickets WHERE event_ticket_type_id = $1")
                    .bind(request.ticket_type_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| TicketError::Database(e.to_string()))?;

            let available = i64::from(capacity) - sold.0;
            if request.quantity > available {
                // Transaction rolls back on drop; nothing was issued
                return Err(TicketError::InsufficientInventory {
                    ticket_type_id: request.ticket_type_id,
                    requested: request.quantity,
                    available: available.max(0),
                });
            }
        }

        let mut issued = Vec::new();
        for request in &params.requests {
            for _ in 0..request.quantity {
                let ticket: IssuedTicket = sqlx::query_as(
                    r#"
                    INSERT INTO tickets
                        (event_id, event_ticket_type_id, org_id, email,
                         promoter_user_id, ticket_unique_id, stripe_payment_id)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    RETURNING id, event_ticket_type_id, ticket_unique_id
                    "#,
                )
                .bind(params.event_id)
                .bind(request.ticket_type_id)
                .bind(params.org_id)
                .bind(&params.email)
                .bind(params.promoter_user_id)
                .bind(Uuid::new_v4())
                .bind(&params.stripe_payment_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| TicketError::Database(e.to_string()))?;

                issued.push(ticket);
            }
        }

        tx.commit()
            .await
            .map_err(|e| TicketError::Database(e.to_string()))?;

        tracing::info!(
            event_id = %params.event_id,
            org_id = %params.org_id,
            count = issued.len(),
            "Issued tickets"
        );

        Ok(issued)
    }

    /// Sold count for a ticket type, derived from committed ticket rows
    pub async fn sold_count(&self, ticket_type_id: Uuid) -> TicketResult<i64> {
        let sold: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM tickets WHERE event_ticket_type_id = $1")
                .bind(ticket_type_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(sold.0)
    }
}
