//! hotseat entry point.
//!
//! Startup order matters: configuration (fail fast), logging, Postgres pool
//! and gate, schema bootstrap, accounting backend, session store, then the
//! HTTP gateway. Configuration errors exit non-zero before any socket is
//! bound.

use std::sync::Arc;

use hotseat::config::{AppConfig, SessionBackend};
use hotseat::db::{connect_pool, DbGate};
use hotseat::gateway::{run_server, AppState};
use hotseat::mockpay::MockPay;
use hotseat::orders::OrderStore;
use hotseat::paysession::{
    postgres::PgSessionStore, redis::RedisSessionStore, PaymentSessionStore,
};
use hotseat::{accounting, logging};

#[tokio::main]
async fn main() {
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let _log_guard = logging::init_logging(&config);
    tracing::info!(
        accounting = %config.acct_backend,
        sessions = %config.paysession_backend,
        port = config.port,
        "hotseat starting"
    );

    let pool = match connect_pool(&config).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("FATAL: cannot connect to DATABASE_URL: {e}");
            std::process::exit(1);
        }
    };
    let gate = DbGate::new(config.db_gate_limit);

    let orders = OrderStore::new(pool.clone(), gate.clone());
    if let Err(e) = orders.setup().await {
        eprintln!("FATAL: orders schema bootstrap failed: {e}");
        std::process::exit(1);
    }

    let acct = match accounting::connect(&config, &pool, &gate).await {
        Ok(acct) => acct,
        Err(e) => {
            eprintln!("FATAL: accounting backend init failed: {e}");
            std::process::exit(1);
        }
    };

    let sessions: Arc<dyn PaymentSessionStore> = match config.paysession_backend {
        SessionBackend::Postgres => {
            let store =
                PgSessionStore::new(pool.clone(), gate.clone(), config.reservation_ttl_seconds);
            if let Err(e) = store.setup().await {
                eprintln!("FATAL: payment-session schema bootstrap failed: {e}");
                std::process::exit(1);
            }
            Arc::new(store)
        }
        SessionBackend::Redis => {
            let client = match redis::Client::open(config.redis_url.as_str()) {
                Ok(client) => client,
                Err(e) => {
                    eprintln!("FATAL: invalid REDIS_URL: {e}");
                    std::process::exit(1);
                }
            };
            let conn = match redis::aio::ConnectionManager::new(client).await {
                Ok(conn) => conn,
                Err(e) => {
                    eprintln!("FATAL: cannot connect to Redis: {e}");
                    std::process::exit(1);
                }
            };
            Arc::new(RedisSessionStore::new(
                conn,
                config.reservation_ttl_seconds,
                config.redis_max_conn,
            ))
        }
    };

    let adapter = Arc::new(MockPay::new(config.mock_secret.clone()));

    let state = Arc::new(AppState::new(&config, acct, sessions, orders, adapter));
    run_server(state, config.port).await;

    pool.close().await;
}
