//! End-to-end checkout/webhook scenarios over real HTTP, backed by live
//! Postgres for accounting, sessions, and orders.
//!
//! Ignored by default; run against a scratch database, serially:
//!
//! ```text
//! DATABASE_URL=postgres://localhost/hotseat_test cargo test --test e2e_checkout_flow -- --ignored --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use hotseat::accounting::postgres::PgAccounting;
use hotseat::config::{AcctBackend, AppConfig, Capacities, LogConfig, SessionBackend};
use hotseat::db::DbGate;
use hotseat::gateway::{build_router, AppState};
use hotseat::mockpay::{MockPay, PaymentAdapter, SIGNATURE_HEADER};
use hotseat::orders::OrderStore;
use hotseat::paysession::postgres::PgSessionStore;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

const SECRET: &str = "test-secret";

struct TestApp {
    base: String,
    client: reqwest::Client,
    #[allow(dead_code)]
    pool: PgPool,
}

fn test_config(database_url: String, capacities: Capacities, ttl_secs: u64) -> AppConfig {
    AppConfig {
        database_url,
        acct_backend: AcctBackend::Postgres,
        paysession_backend: SessionBackend::Postgres,
        tb_address: String::new(),
        tb_cluster_id: 0,
        redis_url: String::new(),
        redis_max_conn: 8,
        db_pool_size: 8,
        db_max_overflow: 0,
        db_pool_timeout_secs: 10,
        db_gate_limit: 8,
        mock_secret: SECRET.into(),
        mock_webhook_url: String::new(),
        reservation_ttl_seconds: ttl_secs,
        capacities,
        admin_username: "admin".into(),
        admin_password: "supasecret".into(),
        port: 0,
        log: LogConfig {
            log_dir: "logs".into(),
            log_file: "test.log".into(),
            log_level: "warn".into(),
            rotation: "never".into(),
            use_json: false,
        },
    }
}

async fn spawn_app(capacities: Capacities, ttl_secs: u64) -> TestApp {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required for ignored tests");
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&url)
        .await
        .expect("connect test database");

    sqlx::query(
        "DROP TABLE IF EXISTS holds, resources, orders, payment_sessions_hot, \
         payment_sessions_pending, fulfillment_gates, idempotency_keys CASCADE",
    )
    .execute(&pool)
    .await
    .expect("drop tables");

    let config = test_config(url, capacities, ttl_secs);
    let gate = DbGate::new(config.db_gate_limit);

    let orders = OrderStore::new(pool.clone(), gate.clone());
    orders.setup().await.expect("orders schema");

    let accounting = PgAccounting::new(pool.clone(), gate.clone(), capacities);
    accounting.setup().await.expect("accounting schema");

    let sessions = PgSessionStore::new(pool.clone(), gate.clone(), ttl_secs);
    sessions.setup().await.expect("session schema");

    let state = Arc::new(AppState::new(
        &config,
        Arc::new(accounting),
        Arc::new(sessions),
        orders,
        Arc::new(MockPay::new(SECRET.into())),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.expect("serve");
    });

    TestApp {
        base: format!("http://{addr}"),
        client: reqwest::Client::new(),
        pool,
    }
}

impl TestApp {
    async fn checkout(&self, cls: &str) -> reqwest::Response {
        self.client
            .post(format!("{}/api/checkout", self.base))
            .json(&serde_json::json!({ "cls": cls, "customer_email": "a@x.com" }))
            .send()
            .await
            .expect("checkout request")
    }

    async fn webhook(&self, psid: &str, kind: &str, idem: &str) -> reqwest::Response {
        let payload = serde_json::to_vec(&serde_json::json!({
            "type": format!("payment.{kind}"),
            "payment_session_id": psid,
            "order_id": "",
            "amount": 6500,
            "currency": "eur",
            "created_at": 0,
            "idempotency_key": idem,
        }))
        .expect("event payload");
        let signature = MockPay::new(SECRET.into()).sign(&payload);
        self.client
            .post(format!("{}/payments/webhook", self.base))
            .header(SIGNATURE_HEADER, signature)
            .header("content-type", "application/json")
            .body(payload)
            .send()
            .await
            .expect("webhook request")
    }

    async fn order(&self, order_id: &str) -> reqwest::Response {
        self.client
            .get(format!("{}/api/orders/{order_id}", self.base))
            .send()
            .await
            .expect("order request")
    }
}

fn psid_of(redirect_url: &str) -> &str {
    redirect_url.rsplit('/').next().expect("psid in redirect url")
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
async fn s1_checkout_pay_succeed() {
    let app = spawn_app(tiny(), 300).await;

    let resp = app.checkout("A").await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["amount"], 6500);
    assert_eq!(body["currency"], "eur");
    let order_id = body["order_id"].as_str().unwrap().to_string();
    let psid = psid_of(body["redirect_url"].as_str().unwrap()).to_string();

    let resp = app.webhook(&psid, "succeeded", "evt_s1").await;
    assert_eq!(resp.status(), 200);
    let ack: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(ack["ok"], true);
    assert_eq!(ack["order_status"], "PAID");

    let resp = app.order(&order_id).await;
    assert_eq!(resp.status(), 200);
    let order: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(order["status"], "PAID");
    assert_eq!(order["got_goodie"], true);
    assert!(!order["ticket_code"].as_str().unwrap().is_empty());
}

#[tokio::test]
#[ignore]
async fn s2_second_checkout_sold_out() {
    let app = spawn_app(tiny(), 300).await;

    let first = app.checkout("A").await;
    assert_eq!(first.status(), 200);

    let second = app.checkout("A").await;
    assert_eq!(second.status(), 409);
}

#[tokio::test]
#[ignore]
async fn s3_canceled_releases_capacity() {
    let app = spawn_app(tiny(), 300).await;

    let resp = app.checkout("A").await;
    let body: serde_json::Value = resp.json().await.unwrap();
    let order_id = body["order_id"].as_str().unwrap().to_string();
    let psid = psid_of(body["redirect_url"].as_str().unwrap()).to_string();

    let resp = app.webhook(&psid, "canceled", "evt_s3").await;
    assert_eq!(resp.status(), 200);
    let ack: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(ack["order_status"], "CANCELED");

    // no durable order exists for a canceled payment
    assert_eq!(app.order(&order_id).await.status(), 404);

    // the released capacity admits the next checkout
    assert_eq!(app.checkout("A").await.status(), 200);
}

#[tokio::test]
#[ignore]
async fn s4_duplicate_webhook_is_idempotent() {
    let app = spawn_app(tiny(), 300).await;

    let resp = app.checkout("A").await;
    let body: serde_json::Value = resp.json().await.unwrap();
    let order_id = body["order_id"].as_str().unwrap().to_string();
    let psid = psid_of(body["redirect_url"].as_str().unwrap()).to_string();

    let first = app.webhook(&psid, "succeeded", "evt_s4").await;
    assert_eq!(first.status(), 200);
    let ack: serde_json::Value = first.json().await.unwrap();
    assert_eq!(ack["order_status"], "PAID");

    let second = app.webhook(&psid, "succeeded", "evt_s4").await;
    assert_eq!(second.status(), 200);
    let ack: serde_json::Value = second.json().await.unwrap();
    assert_eq!(ack["idempotent"], true);

    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM orders WHERE status = 'PAID'")
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert_eq!(count, 1);
    assert_eq!(app.order(&order_id).await.status(), 200);
}

#[tokio::test]
#[ignore]
async fn s5_goodie_pool_spans_classes() {
    let app = spawn_app(tiny(), 300).await;

    let (a, b) = tokio::join!(app.checkout("A"), app.checkout("B"));
    let a: serde_json::Value = a.json().await.unwrap();
    let b: serde_json::Value = b.json().await.unwrap();

    for body in [&a, &b] {
        let psid = psid_of(body["redirect_url"].as_str().unwrap()).to_string();
        let resp = app
            .webhook(&psid, "succeeded", &format!("evt_s5_{psid}"))
            .await;
        assert_eq!(resp.status(), 200);
    }

    let mut goodies = 0;
    for body in [&a, &b] {
        let order_id = body["order_id"].as_str().unwrap();
        let order: serde_json::Value = app.order(order_id).await.json().await.unwrap();
        assert_eq!(order["status"], "PAID");
        if order["got_goodie"] == true {
            goodies += 1;
        }
    }
    assert_eq!(goodies, 1, "goodie capacity 1 must be granted exactly once");
}

#[tokio::test]
#[ignore]
async fn s6_abandoned_reservation_expires() {
    let app = spawn_app(tiny(), 1).await;

    let resp = app.checkout("A").await;
    let body: serde_json::Value = resp.json().await.unwrap();
    let order_id = body["order_id"].as_str().unwrap().to_string();

    tokio::time::sleep(Duration::from_millis(1300)).await;

    // never paid: no durable order
    assert_eq!(app.order(&order_id).await.status(), 404);

    // capacity is fully available again
    let resp = app
        .client
        .get(format!("{}/api/inventory", app.base))
        .send()
        .await
        .unwrap();
    let inventory: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(inventory["A"]["available"], 1);
    assert_eq!(inventory["A"]["pending_live"], 0);

    assert_eq!(app.checkout("A").await.status(), 200);
}

#[tokio::test]
#[ignore]
async fn webhook_boundary_behaviors() {
    let app = spawn_app(tiny(), 300).await;

    // valid signature, unknown psid -> 404
    let resp = app.webhook("mock_missing", "succeeded", "evt_x").await;
    assert_eq!(resp.status(), 404);

    // invalid signature -> 400
    let resp = app
        .client
        .post(format!("{}/payments/webhook", app.base))
        .header(SIGNATURE_HEADER, "bm90IGEgc2lnbmF0dXJl")
        .header("content-type", "application/json")
        .body("{\"type\":\"payment.succeeded\",\"payment_session_id\":\"x\"}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // missing signature -> 400
    let resp = app
        .client
        .post(format!("{}/payments/webhook", app.base))
        .header("content-type", "application/json")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
#[ignore]
async fn admin_feeds_require_basic_auth() {
    let app = spawn_app(tiny(), 300).await;

    let resp = app
        .client
        .get(format!("{}/api/admin/goodies", app.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = app
        .client
        .get(format!("{}/api/admin/goodies", app.base))
        .basic_auth("admin", Some("supasecret"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["limit"], 1);
}
