//! Durable order store: append-only log of terminal orders.
//!
//! Rows are created only at the end of a successful webhook and never
//! mutated after insert. Unique keys (`order_id`, `ticket_transfer_id`,
//! `ticket_code`) make concurrent duplicate inserts collapse to one; a
//! collision is an idempotent replay and reports success.

use serde::Serialize;
use sqlx::{PgPool, Row};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::accounting::{TicketClass, TransferId};
use crate::db::DbGate;

#[derive(Error, Debug)]
pub enum OrderStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt order row {order_id}: {detail}")]
    Corrupt { order_id: String, detail: String },
}

/// Terminal order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrderStatus {
    #[serde(rename = "PAID")]
    Paid,
    /// Money taken, ticket not issued; operator reconciliation required.
    #[serde(rename = "PAID_UNFULFILLED")]
    PaidUnfulfilled,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELED")]
    Canceled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Paid => "PAID",
            OrderStatus::PaidUnfulfilled => "PAID_UNFULFILLED",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PAID" => Ok(OrderStatus::Paid),
            "PAID_UNFULFILLED" => Ok(OrderStatus::PaidUnfulfilled),
            "FAILED" => Ok(OrderStatus::Failed),
            "CANCELED" => Ok(OrderStatus::Canceled),
            other => Err(format!("unknown order status '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub order_id: String,
    pub ticket_transfer_id: TransferId,
    pub goodie_transfer_id: TransferId,
    pub try_goodie: bool,
    pub cls: TicketClass,
    pub qty: u32,
    pub amount: i64,
    pub currency: String,
    pub customer_email: String,
    pub status: OrderStatus,
    pub created_at: f64,
    pub paid_at: Option<f64>,
    pub ticket_code: Option<String>,
    pub got_goodie: bool,
}

const SQL_CREATE_ORDERS: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    id                 TEXT PRIMARY KEY,
    ticket_transfer_id TEXT NOT NULL UNIQUE,
    goodie_transfer_id TEXT NOT NULL,
    try_goodie         BOOLEAN NOT NULL,
    cls                TEXT NOT NULL,
    qty                INTEGER NOT NULL,
    amount             BIGINT NOT NULL,
    currency           TEXT NOT NULL,
    customer_email     TEXT NOT NULL,
    status             TEXT NOT NULL,
    created_at         DOUBLE PRECISION NOT NULL,
    paid_at            DOUBLE PRECISION,
    ticket_code        TEXT UNIQUE,
    got_goodie         BOOLEAN NOT NULL DEFAULT FALSE
)
"#;

#[derive(Clone)]
pub struct OrderStore {
    pool: PgPool,
    gate: DbGate,
}

impl OrderStore {
    pub fn new(pool: PgPool, gate: DbGate) -> Self {
        Self { pool, gate }
    }

    /// Idempotent schema bootstrap.
    pub async fn setup(&self) -> Result<(), OrderStoreError> {
        let _permit = self.gate.acquire().await;
        sqlx::query(SQL_CREATE_ORDERS).execute(&self.pool).await?;
        tracing::info!("orders schema ready");
        Ok(())
    }

    /// Insert a terminal order. Returns false when a unique key already
    /// existed, which is the idempotent-replay case; the stored row is left
    /// untouched either way.
    pub async fn insert_order(&self, record: &OrderRecord) -> Result<bool, OrderStoreError> {
        let _permit = self.gate.acquire().await;
        let result = sqlx::query(
            r#"
            INSERT INTO orders(
                id, ticket_transfer_id, goodie_transfer_id, try_goodie,
                cls, qty, amount, currency, customer_email,
                status, created_at, paid_at, ticket_code, got_goodie
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&record.order_id)
        .bind(record.ticket_transfer_id.to_string())
        .bind(record.goodie_transfer_id.to_string())
        .bind(record.try_goodie)
        .bind(record.cls.as_str())
        .bind(record.qty as i32)
        .bind(record.amount)
        .bind(&record.currency)
        .bind(&record.customer_email)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.paid_at)
        .bind(&record.ticket_code)
        .bind(record.got_goodie)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_order(&self, order_id: &str) -> Result<Option<OrderRecord>, OrderStoreError> {
        let _permit = self.gate.acquire().await;
        let row = sqlx::query(
            r#"
            SELECT id, ticket_transfer_id, goodie_transfer_id, try_goodie,
                   cls, qty, amount, currency, customer_email,
                   status, created_at, paid_at, ticket_code, got_goodie
            FROM orders WHERE id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Self::row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    /// Most recent orders for the admin feed, newest first.
    pub async fn list_recent(&self, limit: usize) -> Result<Vec<OrderRecord>, OrderStoreError> {
        let _permit = self.gate.acquire().await;
        let rows = sqlx::query(
            r#"
            SELECT id, ticket_transfer_id, goodie_transfer_id, try_goodie,
                   cls, qty, amount, currency, customer_email,
                   status, created_at, paid_at, ticket_code, got_goodie
            FROM orders
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(Self::row_to_record(&row)?);
        }
        Ok(records)
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<OrderRecord, OrderStoreError> {
        let order_id: String = row.get("id");
        let corrupt = |detail: String| OrderStoreError::Corrupt {
            order_id: order_id.clone(),
            detail,
        };

        let cls: String = row.get("cls");
        let status: String = row.get("status");
        let ticket: String = row.get("ticket_transfer_id");
        let goodie: String = row.get("goodie_transfer_id");

        Ok(OrderRecord {
            cls: cls.parse().map_err(|_| corrupt(format!("bad cls '{cls}'")))?,
            status: status
                .parse()
                .map_err(|_| corrupt(format!("bad status '{status}'")))?,
            ticket_transfer_id: ticket
                .parse::<TransferId>()
                .map_err(|_| corrupt("bad ticket_transfer_id".into()))?,
            goodie_transfer_id: goodie
                .parse::<TransferId>()
                .map_err(|_| corrupt("bad goodie_transfer_id".into()))?,
            try_goodie: row.get("try_goodie"),
            qty: row.get::<i32, _>("qty") as u32,
            amount: row.get("amount"),
            currency: row.get("currency"),
            customer_email: row.get("customer_email"),
            created_at: row.get("created_at"),
            paid_at: row.get("paid_at"),
            ticket_code: row.get("ticket_code"),
            got_goodie: row.get("got_goodie"),
            order_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            OrderStatus::Paid,
            OrderStatus::PaidUnfulfilled,
            OrderStatus::Failed,
            OrderStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
        assert!("REFUNDED".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_as_wire_names() {
        assert_eq!(
            serde_json::to_value(OrderStatus::PaidUnfulfilled).unwrap(),
            serde_json::Value::String("PAID_UNFULFILLED".into())
        );
    }
}
