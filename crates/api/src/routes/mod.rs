//! API route handlers

pub mod billing;
pub mod tickets;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        // Billing
        .route("/billing/webhook", post(billing::webhook))
        .route("/billing/subscribe", post(billing::subscribe))
        .route("/billing/subscription", get(billing::get_subscription))
        .route("/billing/tier-quotes", get(billing::preview_tier_change))
        .route("/billing/change-tier", post(billing::change_tier))
        .route("/billing/cancel", post(billing::cancel))
        .route("/billing/reactivate", post(billing::reactivate))
        .route("/billing/credits", get(billing::credit_balance))
        .route("/billing/credits/buy", post(billing::buy_credits))
        .route(
            "/billing/guest-list-slot",
            post(billing::use_guest_list_slot),
        )
        // Tickets
        .route("/events/:event_id/availability", get(tickets::availability))
        .route("/events/:event_id/purchase", post(tickets::purchase))
        .route(
            "/tickets/:ticket_unique_id/check-in",
            post(tickets::check_in),
        )
        .with_state(state)
}
