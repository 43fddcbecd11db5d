//! Ticket check-in
//!
//! A single forward transition (unchecked → checked-in) with no reversal.
//! The ticket row is locked for the duration of the check, so scanning the
//! same ticket at two doors cannot both succeed.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{TicketError, TicketResult};

/// Result of a successful check-in
#[derive(Debug, Clone)]
pub struct CheckInOutcome {
    pub ticket_id: Uuid,
    pub checked_in_at: OffsetDateTime,
}

/// Whether check-in is permitted at `now` for an event scheduled
/// `[starts_at, ends_at]`
pub fn within_window(
    now: OffsetDateTime,
    starts_at: OffsetDateTime,
    ends_at: OffsetDateTime,
) -> bool {
    now >= starts_at && now <= ends_at
}

/// Service for admitting ticket holders
pub struct CheckInService {
    pool: PgPool,
}

impl CheckInService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Check in the ticket identified by its globally-unique check-in key.
    ///
    /// Fails with `AlreadyCheckedIn` (carrying the prior time, for display at
    /// the door) when `check_in_time` is already set, and with `OutOfWindow`
    /// outside the event's scheduled time.
    pub async fn check_in(&self, ticket_unique_id: Uuid) -> TicketResult<CheckInOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| TicketError::Database(e.to_string()))?;

        let row: Option<(Uuid, Option<OffsetDateTime>, OffsetDateTime, OffsetDateTime)> =
            sqlx::query_as(
                r#"
                SELECT t.id, t.check_in_time, e.starts_at, e.ends_at
                FROM tickets t
                JOIN events e ON e.id = t.event_id
                WHERE t.ticket_unique_id = $1
                FOR UPDATE OF t
                "#,
            )
            .bind(ticket_unique_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| TicketError::Database(e.to_string()))?;

        let (ticket_id, check_in_time, starts_at, ends_at) =
            row.ok_or_else(|| TicketError::TicketNotFound(ticket_unique_id.to_string()))?;

        if let Some(checked_in_at) = check_in_time {
            return Err(TicketError::AlreadyCheckedIn { checked_in_at });
        }

        let now = OffsetDateTime::now_utc();
        if !within_window(now, starts_at, ends_at) {
            return Err(TicketError::OutOfWindow { starts_at, ends_at });
        }

        let checked_in_at: (OffsetDateTime,) = sqlx::query_as(
            "UPDATE tickets SET check_in_time = NOW() WHERE id = $1 RETURNING check_in_time",
        )
        .bind(ticket_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| TicketError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| TicketError::Database(e.to_string()))?;

        tracing::info!(
            ticket_id = %ticket_id,
            ticket_unique_id = %ticket_unique_id,
            "Ticket checked in"
        );

        Ok(CheckInOutcome {
            ticket_id,
            checked_in_at: checked_in_at.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn test_within_window() {
        let starts = OffsetDateTime::now_utc();
        let ends = starts + Duration::hours(4);

        assert!(within_window(starts, starts, ends));
        assert!(within_window(ends, starts, ends));
        assert!(within_window(starts + Duration::hours(2), starts, ends));
        assert!(!within_window(starts - Duration::minutes(1), starts, ends));
        assert!(!within_window(ends + Duration::minutes(1), starts, ends));
    }
}
