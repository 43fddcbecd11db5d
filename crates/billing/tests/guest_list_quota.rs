//! Integration tests for guest-list slot consumption and the
//! one-usable-subscription constraint
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://..."
//! cargo test -p doorlist-billing --test guest_list_quota -- --ignored
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use doorlist_billing::{
    BillingError, CreditService, GuestListSlot, PriceIds, StripeConfig, SubscriptionService,
    StripeClient,
};
use sqlx::PgPool;
use uuid::Uuid;

fn test_stripe_client() -> StripeClient {
    // Guest-list slot consumption is database-only; the client never makes a
    // network call in these tests.
    StripeClient::new(StripeConfig {
        secret_key: "sk_test_offline".to_string(),
        webhook_secret: "whsec_test".to_string(),
        price_ids: PriceIds {
            standard: "price_standard".to_string(),
            plus: "price_plus".to_string(),
            elite: "price_elite".to_string(),
        },
        app_base_url: "http://localhost:3000".to_string(),
        trial_period_days: 30,
    })
}

async fn setup_pool() -> PgPool {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");

    sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database")
}

/// Create an org with a customer and an active standard-tier subscription
/// (guest-list quota of 2)
async fn create_org_with_subscription(pool: &PgPool, status: &str) -> (Uuid, Uuid) {
    let org_id = Uuid::new_v4();
    sqlx::query("INSERT INTO organizations (id, name) VALUES ($1, $2)")
        .bind(org_id)
        .bind(format!("Test Organization {}", org_id))
        .execute(pool)
        .await
        .expect("Failed to create test organization");

    let customer_id = Uuid::new_v4();
    sqlx::query("INSERT INTO customers (id, org_id, stripe_customer_id) VALUES ($1, $2, $3)")
        .bind(customer_id)
        .bind(org_id)
        .bind(format!("cus_test_{}", org_id))
        .execute(pool)
        .await
        .expect("Failed to create test customer");

    let sub_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO subscriptions
            (id, org_id, customer_id, stripe_subscription_id, stripe_price_id, tier,
             status, amount_cents, current_period_start, current_period_end,
             billing_cycle_anchor)
        VALUES ($1, $2, $3, $4, 'price_standard', 'standard', $5, 2900,
                NOW() - INTERVAL '1 day', NOW() + INTERVAL '29 days', NOW() - INTERVAL '1 day')
        "#,
    )
    .bind(sub_id)
    .bind(org_id)
    .bind(customer_id)
    .bind(format!("sub_test_{}", org_id))
    .bind(status)
    .execute(pool)
    .await
    .expect("Failed to create test subscription");

    (org_id, sub_id)
}

async fn cleanup_org(pool: &PgPool, org_id: Uuid) {
    for query in [
        "DELETE FROM credit_ledger WHERE org_id = $1",
        "DELETE FROM org_credit_balances WHERE org_id = $1",
        "DELETE FROM billing_events WHERE org_id = $1",
        "DELETE FROM subscriptions WHERE org_id = $1",
        "DELETE FROM customers WHERE org_id = $1",
        "DELETE FROM organizations WHERE id = $1",
    ] {
        sqlx::query(query).bind(org_id).execute(pool).await.ok();
    }
}

#[tokio::test]
#[ignore] // Requires database
async fn test_quota_then_credit_then_insufficient() {
    let pool = setup_pool().await;
    let (org_id, _) = create_org_with_subscription(&pool, "active").await;
    let user_id = Uuid::new_v4();
    let service = SubscriptionService::new(test_stripe_client(), pool.clone());

    // Standard tier includes 2 guest-list events per cycle
    for expected_used in 1..=2 {
        let slot = service
            .use_guest_list_slot(org_id, user_id, Uuid::new_v4())
            .await
            .expect("slot within quota should succeed");
        match slot {
            GuestListSlot::Quota { used, .. } => assert_eq!(used, expected_used),
            other => panic!("expected quota slot, got {:?}", other),
        }
    }

    // Quota exhausted and no credits purchased
    let result = service
        .use_guest_list_slot(org_id, user_id, Uuid::new_v4())
        .await;
    assert!(
        matches!(&result, Err(BillingError::InsufficientCredits { .. })),
        "expected InsufficientCredits, got {:?}",
        result
    );

    // A purchased credit covers the next event
    CreditService::new(pool.clone())
        .add_credits(org_id, user_id, 1, 1000, &format!("pi_test_{}", org_id))
        .await
        .expect("add credits should succeed");

    let slot = service
        .use_guest_list_slot(org_id, user_id, Uuid::new_v4())
        .await
        .expect("credit-covered slot should succeed");
    assert!(
        matches!(&slot, GuestListSlot::Credit(_)),
        "expected credit slot, got {:?}",
        slot
    );

    cleanup_org(&pool, org_id).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_at_most_one_usable_subscription_per_org() {
    let pool = setup_pool().await;
    let (org_id, _) = create_org_with_subscription(&pool, "active").await;

    let customer: (Uuid,) = sqlx::query_as("SELECT id FROM customers WHERE org_id = $1")
        .bind(org_id)
        .fetch_one(&pool)
        .await
        .unwrap();

    // A second usable row must violate the partial unique index
    let second = sqlx::query(
        r#"
        INSERT INTO subscriptions
            (org_id, customer_id, stripe_subscription_id, stripe_price_id, tier,
             status, amount_cents, current_period_start, current_period_end,
             billing_cycle_anchor)
        VALUES ($1, $2, $3, 'price_plus', 'plus', 'trialing', 9900,
                NOW(), NOW() + INTERVAL '30 days', NOW())
        "#,
    )
    .bind(org_id)
    .bind(customer.0)
    .bind(format!("sub_test_second_{}", org_id))
    .execute(&pool)
    .await;

    assert!(second.is_err(), "second usable subscription must be rejected");

    // But a canceled row alongside is history, not a conflict
    let canceled = sqlx::query(
        r#"
        INSERT INTO subscriptions
            (org_id, customer_id, stripe_subscription_id, stripe_price_id, tier,
             status, amount_cents, current_period_start, current_period_end,
             billing_cycle_anchor)
        VALUES ($1, $2, $3, 'price_plus', 'plus', 'canceled', 9900,
                NOW() - INTERVAL '60 days', NOW() - INTERVAL '30 days', NOW() - INTERVAL '60 days')
        "#,
    )
    .bind(org_id)
    .bind(customer.0)
    .bind(format!("sub_test_canceled_{}", org_id))
    .execute(&pool)
    .await;

    assert!(canceled.is_ok(), "canceled history rows must be retained");

    cleanup_org(&pool, org_id).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_no_guest_list_slot_without_active_subscription() {
    let pool = setup_pool().await;
    let (org_id, _) = create_org_with_subscription(&pool, "past_due").await;
    let service = SubscriptionService::new(test_stripe_client(), pool.clone());

    let result = service
        .use_guest_list_slot(org_id, Uuid::new_v4(), Uuid::new_v4())
        .await;

    assert!(
        matches!(&result, Err(BillingError::SubscriptionNotFound(_))),
        "past_due subscription must not run guest lists, got {:?}",
        result
    );

    cleanup_org(&pool, org_id).await;
}
