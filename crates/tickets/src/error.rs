//! Ticketing error types

use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// Ticketing-specific errors
#[derive(Debug, Error)]
pub enum TicketError {
    #[error("Insufficient inventory for ticket type {ticket_type_id}: requested {requested}, {available} remaining")]
    InsufficientInventory {
        ticket_type_id: Uuid,
        requested: i64,
        available: i64,
    },

    #[error("Ticket already checked in at {checked_in_at}")]
    AlreadyCheckedIn { checked_in_at: OffsetDateTime },

    #[error("Check-in is only open during the event ({starts_at} to {ends_at})")]
    OutOfWindow {
        starts_at: OffsetDateTime,
        ends_at: OffsetDateTime,
    },

    #[error("Ticket not found: {0}")]
    TicketNotFound(String),

    #[error("Event not found: {0}")]
    EventNotFound(String),

    #[error("Ticket type not found: {0}")]
    TicketTypeNotFound(String),

    #[error("Ticket type is no longer on sale: {0}")]
    TicketTypeInactive(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for TicketError {
    fn from(err: sqlx::Error) -> Self {
        TicketError::Database(err.to_string())
    }
}

pub type TicketResult<T> = Result<T, TicketError>;
