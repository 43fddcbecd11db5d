//! Integration tests for ticket check-in
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://..."
//! cargo test -p doorlist-tickets --test checkin -- --ignored
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use doorlist_tickets::{CheckInService, TicketError};
use sqlx::PgPool;
use uuid::Uuid;

async fn setup_pool() -> PgPool {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");

    sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database")
}

/// Create an org, an event with the given schedule offsets (hours relative to
/// now), a ticket type, and one committed ticket. Returns
/// (org_id, event_id, ticket_unique_id).
async fn create_ticket(pool: &PgPool, starts_in_hours: i32, ends_in_hours: i32) -> (Uuid, Uuid, Uuid) {
    let org_id = Uuid::new_v4();
    sqlx::query("INSERT INTO organizations (id, name) VALUES ($1, $2)")
        .bind(org_id)
        .bind(format!("Test Organization {}", org_id))
        .execute(pool)
        .await
        .expect("Failed to create test organization");

    let event_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO events (id, org_id, name, starts_at, ends_at)
        VALUES ($1, $2, 'Test Event',
                NOW() + make_interval(hours => $3),
                NOW() + make_interval(hours => $4))
        "#,
    )
    .bind(event_id)
    .bind(org_id)
    .bind(starts_in_hours)
    .bind(ends_in_hours)
    .execute(pool)
    .await
    .expect("Failed to create test event");

    let ticket_type_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO event_ticket_types (id, event_id, name, price_cents, capacity)
        VALUES ($1, $2, 'General Admission', 2500, 100)
        "#,
    )
    .bind(ticket_type_id)
    .bind(event_id)
    .execute(pool)
    .await
    .expect("Failed to create test ticket type");

    let ticket_unique_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO tickets
            (event_id, event_ticket_type_id, org_id, email, ticket_unique_id)
        VALUES ($1, $2, $3, 'holder@example.com', $4)
        "#,
    )
    .bind(event_id)
    .bind(ticket_type_id)
    .bind(org_id)
    .bind(ticket_unique_id)
    .execute(pool)
    .await
    .expect("Failed to create test ticket");

    (org_id, event_id, ticket_unique_id)
}

async fn cleanup_event(pool: &PgPool, org_id: Uuid, event_id: Uuid) {
    sqlx::query("DELETE FROM tickets WHERE event_id = $1")
        .bind(event_id)
        .execute(pool)
        .await
        .ok();
    sqlx::query("DELETE FROM event_ticket_types WHERE event_id = $1")
        .bind(event_id)
        .execute(pool)
        .await
        .ok();
    sqlx::query("DELETE FROM events WHERE id = $1")
        .bind(event_id)
        .execute(pool)
        .await
        .ok();
    sqlx::query("DELETE FROM organizations WHERE id = $1")
        .bind(org_id)
        .execute(pool)
        .await
        .ok();
}

#[tokio::test]
#[ignore] // Requires database
async fn test_double_check_in_reports_original_time() {
    let pool = setup_pool().await;
    // Event running now: started an hour ago, ends in three
    let (org_id, event_id, ticket_unique_id) = create_ticket(&pool, -1, 3).await;
    let service = CheckInService::new(pool.clone());

    let first = service
        .check_in(ticket_unique_id)
        .await
        .expect("first check-in should succeed");

    let second = service.check_in(ticket_unique_id).await;
    match second {
        Err(TicketError::AlreadyCheckedIn { checked_in_at }) => {
            assert_eq!(
                checked_in_at, first.checked_in_at,
                "the prior check-in time must be reported"
            );
        }
        other => panic!("expected AlreadyCheckedIn, got {:?}", other),
    }

    cleanup_event(&pool, org_id, event_id).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_check_in_outside_window_fails() {
    let pool = setup_pool().await;
    // Event starts tomorrow
    let (org_id, event_id, ticket_unique_id) = create_ticket(&pool, 24, 28).await;
    let service = CheckInService::new(pool.clone());

    let result = service.check_in(ticket_unique_id).await;
    assert!(
        matches!(&result, Err(TicketError::OutOfWindow { .. })),
        "expected OutOfWindow, got {:?}",
        result
    );

    cleanup_event(&pool, org_id, event_id).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_unknown_ticket_fails() {
    let pool = setup_pool().await;
    let service = CheckInService::new(pool.clone());

    let result = service.check_in(Uuid::new_v4()).await;
    assert!(matches!(result, Err(TicketError::TicketNotFound(_))));
}

#[tokio::test]
#[ignore] // Requires database
async fn test_concurrent_check_in_single_winner() {
    let pool = setup_pool().await;
    let (org_id, event_id, ticket_unique_id) = create_ticket(&pool, -1, 3).await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            CheckInService::new(pool).check_in(ticket_unique_id).await
        }));
    }

    let mut successes = 0;
    let mut already = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(TicketError::AlreadyCheckedIn { .. }) => already += 1,
            Err(other) => panic!("unexpected failure: {:?}", other),
        }
    }

    assert_eq!(successes, 1, "two doors cannot both admit the same ticket");
    assert_eq!(already, 3);

    cleanup_event(&pool, org_id, event_id).await;
}
