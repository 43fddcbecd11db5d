//! Integration tests for the credit ledger
//!
//! The property under test: for every organization, at all times,
//! `total_credits - credits_used >= 0`, even when concurrent add/use calls
//! hammer the same organization.
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://..."
//! cargo test -p doorlist-billing --test credit_ledger -- --ignored
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use doorlist_billing::{BillingError, CreditService};
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

async fn create_test_org(pool: &PgPool) -> Uuid {
    let org_id = Uuid::new_v4();
    sqlx::query("INSERT INTO organizations (id, name) VALUES ($1, $2)")
        .bind(org_id)
        .bind(format!("Test Organization {}", org_id))
        .execute(pool)
        .await
        .expect("Failed to create test organization");
    org_id
}

async fn cleanup_test_org(pool: &PgPool, org_id: Uuid) {
    sqlx::query("DELETE FROM credit_ledger WHERE org_id = $1")
        .bind(org_id)
        .execute(pool)
        .await
        .ok();
    sqlx::query("DELETE FROM org_credit_balances WHERE org_id = $1")
        .bind(org_id)
        .execute(pool)
        .await
        .ok();
    sqlx::query("DELETE FROM billing_events WHERE org_id = $1")
        .bind(org_id)
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
async fn test_add_credits_is_idempotent_on_payment_id() {
    let pool = setup_pool().await;
    let org_id = create_test_org(&pool).await;
    let user_id = Uuid::new_v4();
    let credits = CreditService::new(pool.clone());

    let payment_id = format!("pi_test_{}", Uuid::new_v4());

    let first = credits
        .add_credits(org_id, user_id, 5, 5000, &payment_id)
        .await
        .expect("first add should succeed");

    // Simulated webhook redelivery: same payment id
    let second = credits
        .add_credits(org_id, user_id, 5, 5000, &payment_id)
        .await
        .expect("redelivered add should succeed");

    assert_eq!(first.id, second.id, "redelivery must return the same entry");

    let balance = credits
        .balance(org_id)
        .await
        .expect("balance query failed")
        .expect("balance row should exist");
    assert_eq!(balance.total_credits, 5, "credits must not double-apply");

    cleanup_test_org(&pool, org_id).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_use_credit_without_balance_fails() {
    let pool = setup_pool().await;
    let org_id = create_test_org(&pool).await;
    let credits = CreditService::new(pool.clone());

    let result = credits
        .use_credit(org_id, Uuid::new_v4(), Uuid::new_v4())
        .await;

    assert!(
        matches!(&result, Err(BillingError::InsufficientCredits { available: 0 })),
        "expected InsufficientCredits, got {:?}",
        result
    );

    cleanup_test_org(&pool, org_id).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_concurrent_use_credit_exactly_one_wins() {
    let pool = setup_pool().await;
    let org_id = create_test_org(&pool).await;
    let user_id = Uuid::new_v4();
    let credits = CreditService::new(pool.clone());

    credits
        .add_credits(org_id, user_id, 1, 1000, &format!("pi_test_{}", Uuid::new_v4()))
        .await
        .expect("add should succeed");

    // Two concurrent uses racing for a balance of exactly 1
    let pool_a = pool.clone();
    let pool_b = pool.clone();
    let a = tokio::spawn(async move {
        CreditService::new(pool_a)
            .use_credit(org_id, user_id, Uuid::new_v4())
            .await
    });
    let b = tokio::spawn(async move {
        CreditService::new(pool_b)
            .use_credit(org_id, user_id, Uuid::new_v4())
            .await
    });

    let (res_a, res_b) = (a.await.unwrap(), b.await.unwrap());

    let successes = [&res_a, &res_b].iter().filter(|r| r.is_ok()).count();
    let insufficient = [&res_a, &res_b]
        .iter()
        .filter(|r| matches!(r, Err(BillingError::InsufficientCredits { .. })))
        .count();

    assert_eq!(successes, 1, "exactly one concurrent use must succeed");
    assert_eq!(insufficient, 1, "the loser must see InsufficientCredits");

    let balance = credits.balance(org_id).await.unwrap().unwrap();
    assert_eq!(balance.credits_used, 1);
    assert_eq!(balance.available(), 0);

    cleanup_test_org(&pool, org_id).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_interleaved_adds_and_uses_preserve_invariant() {
    let pool = setup_pool().await;
    let org_id = create_test_org(&pool).await;
    let user_id = Uuid::new_v4();
    let credits = CreditService::new(pool.clone());

    credits
        .add_credits(org_id, user_id, 3, 3000, &format!("pi_test_{}", Uuid::new_v4()))
        .await
        .expect("seed add should succeed");

    // Hammer the same organization with interleaved adds and uses
    let mut handles = Vec::new();
    for i in 0..4 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let service = CreditService::new(pool);
            let mut used = 0i32;
            let mut added = 0i32;
            for j in 0..5 {
                if j % 2 == i % 2 {
                    let payment_id = format!("pi_test_{}_{}_{}", org_id, i, j);
                    if service
                        .add_credits(org_id, user_id, 1, 1000, &payment_id)
                        .await
                        .is_ok()
                    {
                        added += 1;
                    }
                } else if service.use_credit(org_id, user_id, Uuid::new_v4()).await.is_ok() {
                    used += 1;
                }
            }
            (added, used)
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    let balance = credits.balance(org_id).await.unwrap().unwrap();
    assert!(
        balance.available() >= 0,
        "balance invariant violated: {:?}",
        balance
    );

    // The derived balance must agree with the append-only ledger
    let ledger_added: (Option<i64>,) = sqlx::query_as(
        "SELECT SUM(credits) FROM credit_ledger WHERE org_id = $1 AND entry_type = 'added'",
    )
    .bind(org_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    let ledger_used: (Option<i64>,) = sqlx::query_as(
        "SELECT SUM(credits) FROM credit_ledger WHERE org_id = $1 AND entry_type = 'used'",
    )
    .bind(org_id)
    .fetch_one(&pool)
    .await
    .unwrap();

    assert_eq!(
        i64::from(balance.total_credits),
        ledger_added.0.unwrap_or(0),
        "balance total must equal ledger adds"
    );
    assert_eq!(
        i64::from(balance.credits_used),
        ledger_used.0.unwrap_or(0),
        "balance used must equal ledger uses"
    );

    cleanup_test_org(&pool, org_id).await;
}
