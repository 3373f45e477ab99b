//! Postgres pool construction and the DB gate.
//!
//! The gate is a semaphore sized to the connection pool (or
//! `DB_GATE_LIMIT`). Every SQL statement or explicit transaction acquires a
//! permit for its duration, so the number of in-flight queries stays bounded
//! no matter how many HTTP handlers are concurrently awaiting. The permit is
//! RAII and releases on every exit path, including errors.

use crate::config::AppConfig;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Semaphore bounding concurrent SQL statements.
#[derive(Clone)]
pub struct DbGate {
    sem: Arc<Semaphore>,
}

impl DbGate {
    pub fn new(limit: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    /// Acquire a permit; hold it for exactly one statement or transaction.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.sem
            .clone()
            .acquire_owned()
            .await
            .expect("DB gate semaphore closed")
    }
}

/// Build the shared Postgres pool from configuration.
pub async fn connect_pool(config: &AppConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.db_pool_size + config.db_max_overflow)
        .acquire_timeout(Duration::from_secs(config.db_pool_timeout_secs))
        .connect(&config.database_url)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gate_bounds_concurrency() {
        let gate = DbGate::new(2);
        let p1 = gate.acquire().await;
        let _p2 = gate.acquire().await;

        // third acquire must block until a permit is returned
        let gate2 = gate.clone();
        let blocked = tokio::spawn(async move { gate2.acquire().await });
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        drop(p1);
        let _p3 = blocked.await.expect("acquire task");
    }

    #[tokio::test]
    async fn test_gate_minimum_one_permit() {
        let gate = DbGate::new(0);
        // clamped to one permit, must not deadlock
        let _p = gate.acquire().await;
    }
}
