//! Two-phase accounting laws against a live Postgres.
//!
//! These tests need a scratch database and are ignored by default:
//!
//! ```text
//! DATABASE_URL=postgres://localhost/hotseat_test cargo test --test pg_accounting_laws -- --ignored --test-threads=1
//! ```
//!
//! Each test wipes the accounting tables, so point DATABASE_URL at a
//! database you do not care about.

use std::time::Duration;

use hotseat::accounting::postgres::PgAccounting;
use hotseat::accounting::{Accounting, Resource, TicketClass};
use hotseat::config::Capacities;
use hotseat::db::DbGate;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

const TTL: Duration = Duration::from_secs(300);

async fn fresh_backend(capacities: Capacities) -> (PgPool, PgAccounting) {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required for ignored tests");
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&url)
        .await
        .expect("connect test database");

    sqlx::query("DROP TABLE IF EXISTS holds, resources CASCADE")
        .execute(&pool)
        .await
        .expect("drop accounting tables");

    let backend = PgAccounting::new(pool.clone(), DbGate::new(8), capacities);
    backend.setup().await.expect("schema bootstrap");
    (pool, backend)
}

fn tiny() -> Capacities {
    Capacities {
        class_a: 1,
        class_b: 1,
        goodie: 1,
    }
}

#[tokio::test]
#[ignore]
async fn reserve_exactly_at_capacity_then_reject() {
    let (_pool, acct) = fresh_backend(tiny()).await;

    let (_first, ok) = acct.reserve(Resource::ClassA, 1, TTL).await.unwrap();
    assert!(ok, "reserve at capacity must succeed");

    let (_second, ok) = acct.reserve(Resource::ClassA, 1, TTL).await.unwrap();
    assert!(!ok, "reserve past capacity must be rejected");

    // other resources are unaffected
    let (_b, ok) = acct.reserve(Resource::ClassB, 1, TTL).await.unwrap();
    assert!(ok);
}

#[tokio::test]
#[ignore]
async fn post_is_idempotent() {
    let (_pool, acct) = fresh_backend(tiny()).await;

    let (id, ok) = acct.reserve(Resource::ClassA, 1, TTL).await.unwrap();
    assert!(ok);

    assert!(acct.post(id, Resource::ClassA, 1).await.unwrap());
    // second post is a no-op with the same outcome
    assert!(acct.post(id, Resource::ClassA, 1).await.unwrap());

    let snapshot = acct.inventory(Resource::ClassA).await.unwrap();
    assert_eq!(snapshot.posted, 1);
    assert_eq!(snapshot.pending_live, 0);
    assert_eq!(snapshot.available, 0);
}

#[tokio::test]
#[ignore]
async fn void_then_post_stays_voided() {
    let (_pool, acct) = fresh_backend(tiny()).await;

    let (id, ok) = acct.reserve(Resource::ClassA, 1, TTL).await.unwrap();
    assert!(ok);

    acct.void(id, Resource::ClassA, 1).await.unwrap();
    assert!(!acct.post(id, Resource::ClassA, 1).await.unwrap());

    // capacity is back
    let (_id2, ok) = acct.reserve(Resource::ClassA, 1, TTL).await.unwrap();
    assert!(ok);
}

#[tokio::test]
#[ignore]
async fn expired_pending_is_neither_postable_nor_counted() {
    let (_pool, acct) = fresh_backend(tiny()).await;

    let (id, ok) = acct
        .reserve(Resource::ClassA, 1, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(ok);

    tokio::time::sleep(Duration::from_millis(1300)).await;

    assert!(!acct.post(id, Resource::ClassA, 1).await.unwrap());
    let snapshot = acct.inventory(Resource::ClassA).await.unwrap();
    assert_eq!(snapshot.pending_live, 0);
    assert_eq!(snapshot.available, 1);

    // the released capacity can be reserved again
    let (_id2, ok) = acct.reserve(Resource::ClassA, 1, TTL).await.unwrap();
    assert!(ok);
}

#[tokio::test]
#[ignore]
async fn hold_pair_legs_fail_independently() {
    let (_pool, acct) = fresh_backend(Capacities {
        class_a: 2,
        class_b: 1,
        goodie: 1,
    })
    .await;

    let first = acct.hold_tickets(TicketClass::A, 1, TTL).await.unwrap();
    assert!(first.ticket_ok);
    assert!(first.goodie_ok);

    // goodie pool exhausted, ticket pool not
    let second = acct.hold_tickets(TicketClass::A, 1, TTL).await.unwrap();
    assert!(second.ticket_ok);
    assert!(!second.goodie_ok);
}

#[tokio::test]
#[ignore]
async fn fast_book_posts_without_pending() {
    let (_pool, acct) = fresh_backend(tiny()).await;

    let (_id, ok) = acct.fast_book(Resource::ClassA, 1).await.unwrap();
    assert!(ok);

    let snapshot = acct.inventory(Resource::ClassA).await.unwrap();
    assert_eq!(snapshot.posted, 1);
    assert_eq!(snapshot.pending_live, 0);
    assert!(snapshot.sold_out);

    let (_id2, ok) = acct.fast_book(Resource::ClassA, 1).await.unwrap();
    assert!(!ok, "fast-book past capacity must be rejected");
}

#[tokio::test]
#[ignore]
async fn goodies_posted_is_monotone() {
    let (_pool, acct) = fresh_backend(Capacities {
        class_a: 10,
        class_b: 10,
        goodie: 2,
    })
    .await;

    assert_eq!(acct.goodies_posted().await.unwrap(), 0);

    let hold = acct.hold_tickets(TicketClass::A, 1, TTL).await.unwrap();
    assert_eq!(acct.goodies_posted().await.unwrap(), 0, "pending is not posted");

    let (_t, g) = acct
        .commit_order(hold.ticket_id, hold.goodie_id, TicketClass::A, 1, true)
        .await
        .unwrap();
    assert!(g);
    assert_eq!(acct.goodies_posted().await.unwrap(), 1);

    // voiding another hold never decreases the counter
    let hold2 = acct.hold_tickets(TicketClass::A, 1, TTL).await.unwrap();
    acct.cancel_order(hold2.ticket_id, hold2.goodie_id, TicketClass::A, 1)
        .await
        .unwrap();
    assert_eq!(acct.goodies_posted().await.unwrap(), 1);
}

#[tokio::test]
#[ignore]
async fn concurrent_reserves_never_oversell() {
    let (_pool, acct) = fresh_backend(Capacities {
        class_a: 5,
        class_b: 5,
        goodie: 5,
    })
    .await;
    let acct = std::sync::Arc::new(acct);

    let mut handles = Vec::new();
    for _ in 0..20 {
        let acct = acct.clone();
        handles.push(tokio::spawn(async move {
            acct.reserve(Resource::ClassA, 1, TTL).await.unwrap().1
        }));
    }
    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 5, "exactly capacity many reserves may be admitted");

    let snapshot = acct.inventory(Resource::ClassA).await.unwrap();
    assert_eq!(snapshot.pending_live, 5);
    assert_eq!(snapshot.available, 0);
}
