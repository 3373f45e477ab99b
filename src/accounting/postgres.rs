//! Relational accounting backend.
//!
//! Mirrors the atomic-ledger semantics with two tables: a `resources`
//! catalog (name, capacity) and a `holds` table whose rows move
//! `pending -> posted | voided`. Expiry is computed on read; no reaper.
//! Every statement or transaction passes through the DB gate.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;

use super::error::AccountingError;
use super::{
    Accounting, HoldPair, InventoryReport, InventorySnapshot, Resource, TicketClass, TransferId,
};
use crate::config::Capacities;
use crate::db::DbGate;
use crate::util::now_ts;

const SQL_CREATE_RESOURCES: &str = r#"
CREATE TABLE IF NOT EXISTS resources (
    name        TEXT PRIMARY KEY,
    capacity    BIGINT NOT NULL CHECK (capacity >= 0)
)
"#;

const SQL_CREATE_HOLDS: &str = r#"
CREATE TABLE IF NOT EXISTS holds (
    id          UUID PRIMARY KEY,
    resource    TEXT NOT NULL REFERENCES resources(name) ON DELETE RESTRICT,
    qty         INTEGER NOT NULL CHECK (qty > 0),
    status      TEXT NOT NULL CHECK (status IN ('pending','posted','voided')),
    expires_at  DOUBLE PRECISION,
    created_at  DOUBLE PRECISION NOT NULL
)
"#;

const SQL_CREATE_RESOURCE_STATUS_IDX: &str = r#"
CREATE INDEX IF NOT EXISTS holds_resource_status_idx
    ON holds(resource, status)
"#;

const SQL_CREATE_PENDING_NOTEXPIRED_IDX: &str = r#"
CREATE INDEX IF NOT EXISTS holds_pending_notexpired_idx
    ON holds(resource, status, expires_at)
    WHERE status = 'pending'
"#;

/// Accounting backend over Postgres.
pub struct PgAccounting {
    pool: PgPool,
    gate: DbGate,
    capacities: Capacities,
}

impl PgAccounting {
    pub fn new(pool: PgPool, gate: DbGate, capacities: Capacities) -> Self {
        Self {
            pool,
            gate,
            capacities,
        }
    }

    /// Idempotent schema bootstrap + capacity seeding.
    pub async fn setup(&self) -> Result<(), AccountingError> {
        let _permit = self.gate.acquire().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query(SQL_CREATE_RESOURCES).execute(&mut *tx).await?;
        sqlx::query(SQL_CREATE_HOLDS).execute(&mut *tx).await?;
        sqlx::query(SQL_CREATE_RESOURCE_STATUS_IDX)
            .execute(&mut *tx)
            .await?;
        sqlx::query(SQL_CREATE_PENDING_NOTEXPIRED_IDX)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO resources (name, capacity) VALUES
                ($1, $2), ($3, $4), ($5, $6)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(Resource::ClassA.name())
        .bind(self.capacities.class_a)
        .bind(Resource::ClassB.name())
        .bind(self.capacities.class_b)
        .bind(Resource::Goodie.name())
        .bind(self.capacities.goodie)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!("accounting schema ready, capacity rows seeded");
        Ok(())
    }

    /// `(capacity, posted, live_pending)` for one resource, inside the
    /// caller's transaction.
    async fn available_units(
        tx: &mut Transaction<'_, Postgres>,
        resource: Resource,
        now: f64,
    ) -> Result<(i64, i64, i64), AccountingError> {
        let capacity: Option<i64> =
            sqlx::query_scalar("SELECT capacity FROM resources WHERE name = $1")
                .bind(resource.name())
                .fetch_optional(&mut **tx)
                .await?;
        let capacity =
            capacity.ok_or_else(|| AccountingError::UnknownResource(resource.name().into()))?;

        let posted: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(qty), 0) FROM holds WHERE resource = $1 AND status = 'posted'",
        )
        .bind(resource.name())
        .fetch_one(&mut **tx)
        .await?;

        let pending: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(qty), 0) FROM holds
            WHERE resource = $1 AND status = 'pending'
              AND (expires_at IS NULL OR expires_at > $2)
            "#,
        )
        .bind(resource.name())
        .fetch_one(&mut **tx)
        .await?;

        Ok((capacity, posted, pending))
    }

    /// Insert a hold if capacity remains. Returns whether it was admitted.
    ///
    /// Locks the resource row first so concurrent admissions for the same
    /// resource serialize; the capacity sum is computed under that lock.
    async fn insert_hold_if_capacity(
        tx: &mut Transaction<'_, Postgres>,
        id: TransferId,
        resource: Resource,
        qty: u32,
        status: &str,
        expires_at: Option<f64>,
        now: f64,
    ) -> Result<bool, AccountingError> {
        let locked: Option<i64> =
            sqlx::query_scalar("SELECT capacity FROM resources WHERE name = $1 FOR UPDATE")
                .bind(resource.name())
                .fetch_optional(&mut **tx)
                .await?;
        locked.ok_or_else(|| AccountingError::UnknownResource(resource.name().into()))?;

        let (capacity, posted, pending) = Self::available_units(tx, resource, now).await?;
        if capacity - posted - pending < qty as i64 {
            return Ok(false);
        }
        sqlx::query(
            r#"
            INSERT INTO holds(id, resource, qty, status, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id.as_uuid())
        .bind(resource.name())
        .bind(qty as i32)
        .bind(status)
        .bind(expires_at)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(true)
    }

    /// Compare-and-set a pending hold to posted. Replay-tolerant: an
    /// already-posted hold reports true.
    async fn post_hold(
        tx: &mut Transaction<'_, Postgres>,
        id: TransferId,
        now: f64,
    ) -> Result<bool, AccountingError> {
        let updated = sqlx::query(
            r#"
            UPDATE holds
            SET status = 'posted', expires_at = NULL
            WHERE id = $1
              AND status = 'pending'
              AND (expires_at IS NULL OR expires_at > $2)
            "#,
        )
        .bind(id.as_uuid())
        .bind(now)
        .execute(&mut **tx)
        .await?;
        if updated.rows_affected() > 0 {
            return Ok(true);
        }
        let status: Option<String> = sqlx::query("SELECT status FROM holds WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&mut **tx)
            .await?
            .map(|row| row.get("status"));
        Ok(status.as_deref() == Some("posted"))
    }

    /// Compare-and-set pending holds to voided; silent no-op otherwise.
    async fn void_holds(
        tx: &mut Transaction<'_, Postgres>,
        ids: &[TransferId],
        now: f64,
    ) -> Result<(), AccountingError> {
        let ids: Vec<uuid::Uuid> = ids.iter().map(|id| id.as_uuid()).collect();
        sqlx::query(
            r#"
            UPDATE holds
            SET status = 'voided'
            WHERE id = ANY($1)
              AND status = 'pending'
              AND (expires_at IS NULL OR expires_at > $2)
            "#,
        )
        .bind(&ids)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn snapshot_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        resource: Resource,
        now: f64,
    ) -> Result<InventorySnapshot, AccountingError> {
        let (capacity, posted, pending) = Self::available_units(tx, resource, now).await?;
        Ok(InventorySnapshot::new(capacity, posted, pending, now))
    }
}

#[async_trait]
impl Accounting for PgAccounting {
    async fn reserve(
        &self,
        resource: Resource,
        qty: u32,
        ttl: Duration,
    ) -> Result<(TransferId, bool), AccountingError> {
        let id = TransferId::new();
        let now = now_ts();
        let expires_at = (ttl.as_secs() > 0).then(|| now + ttl.as_secs_f64());

        let _permit = self.gate.acquire().await;
        let mut tx = self.pool.begin().await?;
        let admitted =
            Self::insert_hold_if_capacity(&mut tx, id, resource, qty, "pending", expires_at, now)
                .await?;
        tx.commit().await?;
        Ok((id, admitted))
    }

    async fn post(
        &self,
        pending: TransferId,
        _resource: Resource,
        _qty: u32,
    ) -> Result<bool, AccountingError> {
        let now = now_ts();
        let _permit = self.gate.acquire().await;
        let mut tx = self.pool.begin().await?;
        let posted = Self::post_hold(&mut tx, pending, now).await?;
        tx.commit().await?;
        Ok(posted)
    }

    async fn void(
        &self,
        pending: TransferId,
        _resource: Resource,
        _qty: u32,
    ) -> Result<(), AccountingError> {
        let now = now_ts();
        let _permit = self.gate.acquire().await;
        let mut tx = self.pool.begin().await?;
        Self::void_holds(&mut tx, &[pending], now).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn fast_book(
        &self,
        resource: Resource,
        qty: u32,
    ) -> Result<(TransferId, bool), AccountingError> {
        let id = TransferId::new();
        let now = now_ts();
        let _permit = self.gate.acquire().await;
        let mut tx = self.pool.begin().await?;
        let booked =
            Self::insert_hold_if_capacity(&mut tx, id, resource, qty, "posted", None, now).await?;
        tx.commit().await?;
        Ok((id, booked))
    }

    async fn hold_tickets(
        &self,
        cls: TicketClass,
        qty: u32,
        ttl: Duration,
    ) -> Result<HoldPair, AccountingError> {
        let ticket_id = TransferId::new();
        let goodie_id = TransferId::new();
        let now = now_ts();
        let expires_at = (ttl.as_secs() > 0).then(|| now + ttl.as_secs_f64());

        let _permit = self.gate.acquire().await;
        let mut tx = self.pool.begin().await?;
        let ticket_ok = Self::insert_hold_if_capacity(
            &mut tx,
            ticket_id,
            cls.resource(),
            qty,
            "pending",
            expires_at,
            now,
        )
        .await?;
        let goodie_ok = Self::insert_hold_if_capacity(
            &mut tx,
            goodie_id,
            Resource::Goodie,
            1,
            "pending",
            expires_at,
            now,
        )
        .await?;
        tx.commit().await?;

        Ok(HoldPair {
            ticket_id,
            goodie_id,
            ticket_ok,
            goodie_ok,
        })
    }

    async fn book_immediately(
        &self,
        cls: TicketClass,
        qty: u32,
    ) -> Result<HoldPair, AccountingError> {
        let ticket_id = TransferId::new();
        let goodie_id = TransferId::new();
        let now = now_ts();

        let _permit = self.gate.acquire().await;
        let mut tx = self.pool.begin().await?;
        let ticket_ok = Self::insert_hold_if_capacity(
            &mut tx,
            ticket_id,
            cls.resource(),
            qty,
            "posted",
            None,
            now,
        )
        .await?;
        let goodie_ok = Self::insert_hold_if_capacity(
            &mut tx,
            goodie_id,
            Resource::Goodie,
            1,
            "posted",
            None,
            now,
        )
        .await?;
        tx.commit().await?;

        Ok(HoldPair {
            ticket_id,
            goodie_id,
            ticket_ok,
            goodie_ok,
        })
    }

    async fn commit_order(
        &self,
        ticket: TransferId,
        goodie: TransferId,
        _cls: TicketClass,
        _qty: u32,
        try_goodie: bool,
    ) -> Result<(bool, bool), AccountingError> {
        let now = now_ts();
        let _permit = self.gate.acquire().await;
        let mut tx = self.pool.begin().await?;
        let gets_ticket = Self::post_hold(&mut tx, ticket, now).await?;
        let gets_goodie = if try_goodie {
            Self::post_hold(&mut tx, goodie, now).await?
        } else {
            false
        };
        tx.commit().await?;
        Ok((gets_ticket, gets_goodie))
    }

    async fn cancel_order(
        &self,
        ticket: TransferId,
        goodie: TransferId,
        _cls: TicketClass,
        _qty: u32,
    ) -> Result<(), AccountingError> {
        let now = now_ts();
        let _permit = self.gate.acquire().await;
        let mut tx = self.pool.begin().await?;
        Self::void_holds(&mut tx, &[ticket, goodie], now).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn cancel_only_goodie(&self, goodie: TransferId) -> Result<(), AccountingError> {
        self.void(goodie, Resource::Goodie, 1).await
    }

    async fn inventory(&self, resource: Resource) -> Result<InventorySnapshot, AccountingError> {
        let now = now_ts();
        let _permit = self.gate.acquire().await;
        let mut tx = self.pool.begin().await?;
        let snapshot = Self::snapshot_in_tx(&mut tx, resource, now).await?;
        tx.commit().await?;
        Ok(snapshot)
    }

    async fn compute_inventory(&self) -> Result<InventoryReport, AccountingError> {
        let now = now_ts();
        let _permit = self.gate.acquire().await;
        let mut tx = self.pool.begin().await?;
        let class_a = Self::snapshot_in_tx(&mut tx, Resource::ClassA, now).await?;
        let class_b = Self::snapshot_in_tx(&mut tx, Resource::ClassB, now).await?;
        tx.commit().await?;
        Ok(InventoryReport { class_a, class_b })
    }

    async fn goodies_posted(&self) -> Result<i64, AccountingError> {
        let _permit = self.gate.acquire().await;
        let posted: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(qty), 0) FROM holds WHERE resource = $1 AND status = 'posted'",
        )
        .bind(Resource::Goodie.name())
        .fetch_one(&self.pool)
        .await?;
        Ok(posted)
    }
}
