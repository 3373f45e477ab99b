//! HTTP gateway: routing, shared state, admin auth, server lifecycle.

pub mod error;
pub mod handlers;
pub mod types;

use axum::{
    body::Body,
    extract::State,
    http::{header, Request},
    middleware::{from_fn_with_state, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use crate::accounting::Accounting;
use crate::config::AppConfig;
use crate::mockpay::PaymentAdapter;
use crate::orders::OrderStore;
use crate::paysession::PaymentSessionStore;
use crate::util::ct_equal;
use error::ApiError;

/// Process-wide shared state, created once at startup.
pub struct AppState {
    pub accounting: Arc<dyn Accounting>,
    pub sessions: Arc<dyn PaymentSessionStore>,
    pub orders: OrderStore,
    pub adapter: Arc<dyn PaymentAdapter>,
    /// Outbound client for webhook self-delivery.
    pub http: reqwest::Client,
    pub reservation_ttl: Duration,
    pub webhook_url: String,
    pub goodie_limit: i64,
    admin_username: String,
    admin_password: String,
}

impl AppState {
    pub fn new(
        config: &AppConfig,
        accounting: Arc<dyn Accounting>,
        sessions: Arc<dyn PaymentSessionStore>,
        orders: OrderStore,
        adapter: Arc<dyn PaymentAdapter>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(512)
            .build()
            .expect("outbound HTTP client");
        Self {
            accounting,
            sessions,
            orders,
            adapter,
            http,
            reservation_ttl: Duration::from_secs(config.reservation_ttl_seconds),
            webhook_url: config.mock_webhook_url.clone(),
            goodie_limit: config.capacities.goodie,
            admin_username: config.admin_username.clone(),
            admin_password: config.admin_password.clone(),
        }
    }
}

/// Basic-auth guard for the admin feeds, checked in constant time.
async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;
    let encoded = authorization
        .strip_prefix("Basic ")
        .ok_or(ApiError::Unauthorized)?;
    let decoded = BASE64
        .decode(encoded.trim())
        .map_err(|_| ApiError::Unauthorized)?;
    let decoded = String::from_utf8(decoded).map_err(|_| ApiError::Unauthorized)?;
    let (username, password) = decoded.split_once(':').ok_or(ApiError::Unauthorized)?;

    let ok_user = ct_equal(username, &state.admin_username);
    let ok_pass = ct_equal(password, &state.admin_password);
    if !(ok_user && ok_pass) {
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(request).await)
}

/// Build the full router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let admin_routes = Router::new()
        .route("/goodies", get(handlers::admin_goodies))
        .route("/orders", get(handlers::admin_orders))
        .layer(from_fn_with_state(state.clone(), admin_auth_middleware));

    Router::new()
        .route("/api/v1/health", get(handlers::health_check))
        .route("/api/checkout", post(handlers::create_checkout))
        .route("/api/orders/{order_id}", get(handlers::get_order))
        .route("/payments/webhook", post(handlers::payments_webhook))
        .route("/api/inventory", get(handlers::get_inventory))
        .route("/api/pending", get(handlers::get_pending))
        .nest("/api/admin", admin_routes)
        .route("/mockpay/{psid}", get(handlers::mockpay_view))
        .route("/mockpay/{psid}/emit", post(handlers::mockpay_emit))
        .with_state(state)
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("install ctrl-c handler");
    tracing::info!("shutdown signal received");
}

/// Bind and serve until shutdown, then flush backends.
pub async fn run_server(state: Arc<AppState>, port: u16) {
    let app = build_router(state.clone());

    let addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("FATAL: failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(addr = %addr, "gateway listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        eprintln!("FATAL: server error: {e}");
        std::process::exit(1);
    }

    // drain the ledger batcher and release backend connections
    state.accounting.shutdown().await;
    tracing::info!("gateway stopped");
}
