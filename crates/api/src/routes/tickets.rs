//! Ticket routes: purchases, availability, and door check-in

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use doorlist_tickets::TicketRequest;

use crate::auth::{Identity, Role};
use crate::error::{ApiError, ApiResult};
use crate::routes::billing::PaymentIntentResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct TicketTypeAvailability {
    pub ticket_type_id: Uuid,
    pub name: String,
    pub price_cents: i64,
    pub capacity: i32,
    pub sold: i64,
    pub available: i64,
}

/// Remaining capacity per ticket type for an event. Advisory only: the
/// binding check happens when the purchase commits.
pub async fn availability(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
) -> ApiResult<Json<Vec<TicketTypeAvailability>>> {
    let types: Vec<(Uuid, String, i64, i32)> = sqlx::query_as(
        r#"
        SELECT id, name, price_cents, capacity
        FROM event_ticket_types
        WHERE event_id = $1 AND is_active = TRUE
        "#,
    )
    .bind(event_id)
    .fetch_all(&state.pool)
    .await?;

    if types.is_empty() {
        return Err(ApiError::NotFound);
    }

    let mut result = Vec::with_capacity(types.len());
    for (ticket_type_id, name, price_cents, capacity) in types {
        let sold = state.inventory.sold_count(ticket_type_id).await?;
        result.push(TicketTypeAvailability {
            ticket_type_id,
            name,
            price_cents,
            capacity,
            sold,
            available: (i64::from(capacity) - sold).max(0),
        });
    }

    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct PurchaseLineItem {
    pub ticket_type_id: Uuid,
    pub quantity: i64,
}

#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    pub email: String,
    pub tickets: Vec<PurchaseLineItem>,
    pub promoter_user_id: Option<Uuid>,
}

/// Start a ticket purchase: validates availability and creates the payment
/// intent. Tickets are issued by the payment confirmation webhook, after the
/// authoritative inventory re-check.
pub async fn purchase(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    Json(request): Json<PurchaseRequest>,
) -> ApiResult<Json<PaymentIntentResponse>> {
    if request.email.is_empty() {
        return Err(ApiError::Validation("email is required".to_string()));
    }
    if request.tickets.is_empty() {
        return Err(ApiError::Validation(
            "at least one ticket must be requested".to_string(),
        ));
    }

    let org_id: Option<(Uuid,)> = sqlx::query_as("SELECT org_id FROM events WHERE id = $1")
        .bind(event_id)
        .fetch_optional(&state.pool)
        .await?;
    let (org_id,) = org_id.ok_or(ApiError::NotFound)?;

    let requests: Vec<TicketRequest> = request
        .tickets
        .iter()
        .map(|line| TicketRequest {
            ticket_type_id: line.ticket_type_id,
            quantity: line.quantity,
        })
        .collect();

    let payment_intent = state
        .billing
        .payments
        .create_ticket_payment_intent(
            org_id,
            event_id,
            &request.email,
            request.promoter_user_id,
            &requests,
        )
        .await?;

    Ok(Json(PaymentIntentResponse {
        payment_intent_id: payment_intent.id.to_string(),
        client_secret: payment_intent.client_secret.clone(),
        amount_cents: payment_intent.amount,
    }))
}

#[derive(Debug, Serialize)]
pub struct CheckInResponse {
    pub ticket_id: Uuid,
    pub checked_in_at: String,
}

/// Check in a ticket by its unique check-in key
pub async fn check_in(
    State(state): State<AppState>,
    identity: Identity,
    Path(ticket_unique_id): Path<Uuid>,
) -> ApiResult<Json<CheckInResponse>> {
    identity.require_role(&[Role::Owner, Role::Admin, Role::Staff])?;

    let outcome = state.checkin.check_in(ticket_unique_id).await?;

    Ok(Json(CheckInResponse {
        ticket_id: outcome.ticket_id,
        checked_in_at: outcome
            .checked_in_at
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default(),
    }))
}
