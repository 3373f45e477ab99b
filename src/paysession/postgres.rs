//! Relational session store.
//!
//! Four tables mirror the hot-KV layout: `payment_sessions_hot` (the
//! handoff record), `payment_sessions_pending` (live index for the admin
//! feed), `fulfillment_gates` and `idempotency_keys` (single-shot guards
//! via `INSERT ... ON CONFLICT DO NOTHING RETURNING`). The combined guard
//! runs in one transaction. Every access passes through the DB gate.

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use super::{
    pending_item, FulfillFlags, PaymentSession, PaymentSessionStore, PendingItem,
    SessionStoreError, SESSION_TTL_GRACE_SECS,
};
use crate::accounting::TransferId;
use crate::db::DbGate;
use crate::util::now_ts;

const SQL_CREATE_SESSIONS_HOT: &str = r#"
CREATE TABLE IF NOT EXISTS payment_sessions_hot (
    psid               TEXT PRIMARY KEY,
    order_id           TEXT NOT NULL,
    cls                TEXT NOT NULL,
    qty                INTEGER NOT NULL,
    amount             BIGINT NOT NULL,
    currency           TEXT NOT NULL,
    customer_email     TEXT NOT NULL,
    try_goodie         BOOLEAN NOT NULL,
    ticket_transfer_id TEXT NOT NULL,
    goodie_transfer_id TEXT NOT NULL,
    created_at         DOUBLE PRECISION NOT NULL,
    expires_at         DOUBLE PRECISION NOT NULL
)
"#;

const SQL_CREATE_SESSIONS_PENDING: &str = r#"
CREATE TABLE IF NOT EXISTS payment_sessions_pending (
    psid       TEXT PRIMARY KEY,
    created_at DOUBLE PRECISION NOT NULL
)
"#;

const SQL_CREATE_FULFILLMENT_GATES: &str = r#"
CREATE TABLE IF NOT EXISTS fulfillment_gates (
    psid       TEXT PRIMARY KEY,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const SQL_CREATE_IDEMPOTENCY_KEYS: &str = r#"
CREATE TABLE IF NOT EXISTS idempotency_keys (
    key        TEXT PRIMARY KEY,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const SQL_CREATE_HOT_CREATED_IDX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_ps_hot_created_at
    ON payment_sessions_hot (created_at DESC)
"#;

pub struct PgSessionStore {
    pool: PgPool,
    gate: DbGate,
    ttl_seconds: u64,
}

impl PgSessionStore {
    pub fn new(pool: PgPool, gate: DbGate, reservation_ttl_seconds: u64) -> Self {
        Self {
            pool,
            gate,
            ttl_seconds: reservation_ttl_seconds + SESSION_TTL_GRACE_SECS,
        }
    }

    /// Idempotent schema bootstrap.
    pub async fn setup(&self) -> Result<(), SessionStoreError> {
        let _permit = self.gate.acquire().await;
        let mut tx = self.pool.begin().await?;
        for ddl in [
            SQL_CREATE_SESSIONS_HOT,
            SQL_CREATE_SESSIONS_PENDING,
            SQL_CREATE_FULFILLMENT_GATES,
            SQL_CREATE_IDEMPOTENCY_KEYS,
            SQL_CREATE_HOT_CREATED_IDX,
        ] {
            sqlx::query(ddl).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        tracing::info!("payment-session schema ready");
        Ok(())
    }

    fn row_to_session(psid: &str, row: &sqlx::postgres::PgRow) -> Result<PaymentSession, SessionStoreError> {
        let corrupt = |detail: String| SessionStoreError::Corrupt {
            psid: psid.to_string(),
            detail,
        };
        let cls: String = row.get("cls");
        let ticket: String = row.get("ticket_transfer_id");
        let goodie: String = row.get("goodie_transfer_id");
        Ok(PaymentSession {
            order_id: row.get("order_id"),
            cls: cls.parse().map_err(|_| corrupt(format!("bad cls '{cls}'")))?,
            qty: row.get::<i32, _>("qty") as u32,
            amount: row.get("amount"),
            currency: row.get("currency"),
            customer_email: row.get("customer_email"),
            ticket_transfer_id: ticket
                .parse::<TransferId>()
                .map_err(|_| corrupt("bad ticket_transfer_id".into()))?,
            goodie_transfer_id: goodie
                .parse::<TransferId>()
                .map_err(|_| corrupt("bad goodie_transfer_id".into()))?,
            try_goodie: row.get("try_goodie"),
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait]
impl PaymentSessionStore for PgSessionStore {
    async fn save_session(
        &self,
        psid: &str,
        session: &PaymentSession,
    ) -> Result<(), SessionStoreError> {
        let expires_at = session.created_at + self.ttl_seconds as f64;

        let _permit = self.gate.acquire().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO payment_sessions_hot(
                psid, order_id, cls, qty, amount, currency, customer_email,
                try_goodie, ticket_transfer_id, goodie_transfer_id,
                created_at, expires_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (psid) DO UPDATE SET
                order_id = EXCLUDED.order_id,
                cls = EXCLUDED.cls,
                qty = EXCLUDED.qty,
                amount = EXCLUDED.amount,
                currency = EXCLUDED.currency,
                customer_email = EXCLUDED.customer_email,
                try_goodie = EXCLUDED.try_goodie,
                ticket_transfer_id = EXCLUDED.ticket_transfer_id,
                goodie_transfer_id = EXCLUDED.goodie_transfer_id,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(psid)
        .bind(&session.order_id)
        .bind(session.cls.as_str())
        .bind(session.qty as i32)
        .bind(session.amount)
        .bind(&session.currency)
        .bind(&session.customer_email)
        .bind(session.try_goodie)
        .bind(session.ticket_transfer_id.to_string())
        .bind(session.goodie_transfer_id.to_string())
        .bind(session.created_at)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO payment_sessions_pending(psid, created_at)
            VALUES ($1, $2)
            ON CONFLICT (psid) DO UPDATE SET created_at = EXCLUDED.created_at
            "#,
        )
        .bind(psid)
        .bind(session.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_session(&self, psid: &str) -> Result<Option<PaymentSession>, SessionStoreError> {
        let _permit = self.gate.acquire().await;
        let row = sqlx::query(
            r#"
            SELECT order_id, cls, qty, amount, currency, customer_email,
                   try_goodie, ticket_transfer_id, goodie_transfer_id,
                   created_at
            FROM payment_sessions_hot
            WHERE psid = $1 AND expires_at > $2
            "#,
        )
        .bind(psid)
        .bind(now_ts())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Self::row_to_session(psid, &row)?)),
            None => Ok(None),
        }
    }

    async fn remove_pending(&self, psid: &str) -> Result<(), SessionStoreError> {
        let _permit = self.gate.acquire().await;
        sqlx::query("DELETE FROM payment_sessions_pending WHERE psid = $1")
            .bind(psid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fulfill_and_mark_event(
        &self,
        psid: &str,
        event_id: Option<&str>,
    ) -> Result<FulfillFlags, SessionStoreError> {
        let _permit = self.gate.acquire().await;
        let mut tx = self.pool.begin().await?;

        let gate_row = sqlx::query(
            r#"
            INSERT INTO fulfillment_gates(psid) VALUES ($1)
            ON CONFLICT (psid) DO NOTHING
            RETURNING psid
            "#,
        )
        .bind(psid)
        .fetch_optional(&mut *tx)
        .await?;

        if gate_row.is_none() {
            tx.commit().await?;
            return Ok(FulfillFlags {
                already_fulfilled: true,
                event_seen: None,
            });
        }

        let event_seen = match event_id {
            Some(event_id) => {
                let key_row = sqlx::query(
                    r#"
                    INSERT INTO idempotency_keys(key) VALUES ($1)
                    ON CONFLICT (key) DO NOTHING
                    RETURNING key
                    "#,
                )
                .bind(event_id)
                .fetch_optional(&mut *tx)
                .await?;
                Some(key_row.is_none())
            }
            None => None,
        };

        tx.commit().await?;
        Ok(FulfillFlags {
            already_fulfilled: false,
            event_seen,
        })
    }

    async fn list_recent_pending(
        &self,
        limit: usize,
    ) -> Result<(i64, Vec<PendingItem>), SessionStoreError> {
        let _permit = self.gate.acquire().await;
        let mut tx = self.pool.begin().await?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM payment_sessions_pending")
            .fetch_one(&mut *tx)
            .await?;

        let rows = sqlx::query(
            r#"
            SELECT p.psid,
                   h.order_id, h.cls, h.qty, h.amount, h.currency,
                   h.customer_email, h.try_goodie,
                   h.ticket_transfer_id, h.goodie_transfer_id, h.created_at
            FROM payment_sessions_pending AS p
            LEFT JOIN payment_sessions_hot AS h ON h.psid = p.psid
            ORDER BY p.created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        let now = now_ts();
        let mut items = Vec::with_capacity(rows.len());
        let mut dangling: Vec<String> = Vec::new();
        for row in rows {
            let psid: String = row.get("psid");
            // a pending entry without a hot row is housekeeping debt
            let order_id: Option<String> = row.get("order_id");
            if order_id.is_none() {
                dangling.push(psid);
                continue;
            }
            match Self::row_to_session(&psid, &row) {
                Ok(session) => items.push(pending_item(&psid, &session, now)),
                Err(_) => {
                    tracing::warn!(psid = %psid, "dropping unparsable pending session");
                    dangling.push(psid);
                }
            }
        }

        if !dangling.is_empty() {
            sqlx::query("DELETE FROM payment_sessions_pending WHERE psid = ANY($1)")
                .bind(&dangling)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok((total, items))
    }
}
