//! Capacity accounting: two-phase holds against finite resource pools.
//!
//! Three resources exist: ticket class A, ticket class B, and a single
//! cross-class goodie pool. A reservation is a `pending` transfer with a
//! wall-clock timeout; payment success posts it, failure voids it, and an
//! expired pending counts as released without any reaper.
//!
//! Two interchangeable backends implement the [`Accounting`] contract:
//! - [`remote::LedgerAccounting`]: an external atomic-ledger service where
//!   capacity is enforced by "debits must not exceed credits" accounts,
//!   reached through the request batcher;
//! - [`postgres::PgAccounting`]: a relational rendition with a
//!   `resources` catalog and a `holds` table.
//!
//! The selection happens once at startup; handlers only see the trait.

pub mod batcher;
pub mod error;
pub mod postgres;
pub mod remote;

pub use error::AccountingError;

use crate::config::{AcctBackend, AppConfig};
use crate::db::DbGate;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Ticket classes on sale. Prices are euro cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketClass {
    A,
    B,
}

impl TicketClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketClass::A => "A",
            TicketClass::B => "B",
        }
    }

    /// Ticket price in euro cents.
    pub fn price_cents(&self) -> i64 {
        match self {
            TicketClass::A => 6500,
            TicketClass::B => 3500,
        }
    }

    /// The capacity resource backing this class.
    pub fn resource(&self) -> Resource {
        match self {
            TicketClass::A => Resource::ClassA,
            TicketClass::B => Resource::ClassB,
        }
    }
}

impl fmt::Display for TicketClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TicketClass {
    type Err = AccountingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" => Ok(TicketClass::A),
            "B" => Ok(TicketClass::B),
            other => Err(AccountingError::UnknownClass(other.to_string())),
        }
    }
}

/// A named capacity bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    ClassA,
    ClassB,
    Goodie,
}

impl Resource {
    /// Stable name, used as the `resources` primary key in the relational
    /// backend.
    pub fn name(&self) -> &'static str {
        match self {
            Resource::ClassA => "class_a",
            Resource::ClassB => "class_b",
            Resource::Goodie => "goodie",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Caller-chosen 128-bit transfer id, shared by both backends.
///
/// The id is generated before the backend call, so a failed reservation
/// still has a stable id in the handoff record; `post`/`void` on an id the
/// backend never admitted are harmless no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransferId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(s)?))
    }
}

/// Outcome of reserving (or fast-booking) one ticket plus one goodie slot.
#[derive(Debug, Clone, Copy)]
pub struct HoldPair {
    pub ticket_id: TransferId,
    pub goodie_id: TransferId,
    pub ticket_ok: bool,
    pub goodie_ok: bool,
}

/// Point-in-time view of one resource. Consistent per call, not across
/// resources.
#[derive(Debug, Clone, Serialize)]
pub struct InventorySnapshot {
    pub capacity: i64,
    pub posted: i64,
    pub pending_live: i64,
    pub available: i64,
    pub sold_out: bool,
    pub timestamp: String,
}

impl InventorySnapshot {
    pub fn new(capacity: i64, posted: i64, pending_live: i64, now: f64) -> Self {
        let available = capacity - posted - pending_live;
        Self {
            capacity,
            posted,
            pending_live,
            available,
            sold_out: available <= 0,
            timestamp: crate::util::to_iso(now),
        }
    }
}

/// Per-class inventory, as served by `GET /api/inventory`.
#[derive(Debug, Clone, Serialize)]
pub struct InventoryReport {
    #[serde(rename = "A")]
    pub class_a: InventorySnapshot,
    #[serde(rename = "B")]
    pub class_b: InventorySnapshot,
}

/// The capacity-accounting contract.
///
/// Primitive operations (`reserve`, `post`, `void`, `fast_book`) act on a
/// single resource; the pair operations submit the ticket and goodie legs
/// together so the external backend can pack them into one batch.
#[async_trait]
pub trait Accounting: Send + Sync {
    /// Atomically allocate `qty` units if capacity remains. Returns the
    /// caller-chosen transfer id and whether the hold was admitted. The
    /// hold implicitly releases once `ttl` elapses.
    async fn reserve(
        &self,
        resource: Resource,
        qty: u32,
        ttl: Duration,
    ) -> Result<(TransferId, bool), AccountingError>;

    /// Commit a pending hold. Returns true iff the hold is now posted,
    /// including the replay case where an earlier call already posted it.
    async fn post(
        &self,
        pending: TransferId,
        resource: Resource,
        qty: u32,
    ) -> Result<bool, AccountingError>;

    /// Release a pending hold. No-op when the hold is already terminal or
    /// expired.
    async fn void(
        &self,
        pending: TransferId,
        resource: Resource,
        qty: u32,
    ) -> Result<(), AccountingError>;

    /// Direct posted booking without a pending step (late-success recovery).
    async fn fast_book(
        &self,
        resource: Resource,
        qty: u32,
    ) -> Result<(TransferId, bool), AccountingError>;

    /// Reserve one ticket of `cls` and one goodie slot, submitted together.
    /// Either leg may fail independently.
    async fn hold_tickets(
        &self,
        cls: TicketClass,
        qty: u32,
        ttl: Duration,
    ) -> Result<HoldPair, AccountingError>;

    /// Fast-book one ticket of `cls` and one goodie slot together.
    async fn book_immediately(&self, cls: TicketClass, qty: u32)
        -> Result<HoldPair, AccountingError>;

    /// Post the ticket hold and, when `try_goodie`, the goodie hold.
    /// Returns `(gets_ticket, gets_goodie)`.
    async fn commit_order(
        &self,
        ticket: TransferId,
        goodie: TransferId,
        cls: TicketClass,
        qty: u32,
        try_goodie: bool,
    ) -> Result<(bool, bool), AccountingError>;

    /// Void both holds of an order, best-effort per leg.
    async fn cancel_order(
        &self,
        ticket: TransferId,
        goodie: TransferId,
        cls: TicketClass,
        qty: u32,
    ) -> Result<(), AccountingError>;

    /// Void only the goodie hold (sold-out early release).
    async fn cancel_only_goodie(&self, goodie: TransferId) -> Result<(), AccountingError>;

    /// Snapshot a single resource.
    async fn inventory(&self, resource: Resource) -> Result<InventorySnapshot, AccountingError>;

    /// Snapshot both ticket classes in one backend round trip.
    async fn compute_inventory(&self) -> Result<InventoryReport, AccountingError>;

    /// Number of goodie units posted so far.
    async fn goodies_posted(&self) -> Result<i64, AccountingError>;

    /// Flush and release backend resources on shutdown.
    async fn shutdown(&self) {}
}

/// Build the configured accounting backend and run its idempotent setup
/// (schema + capacity seeding, or ledger accounts + seed transfers).
pub async fn connect(
    config: &AppConfig,
    pool: &PgPool,
    gate: &DbGate,
) -> Result<Arc<dyn Accounting>, AccountingError> {
    match config.acct_backend {
        AcctBackend::Postgres => {
            let backend = postgres::PgAccounting::new(pool.clone(), gate.clone(), config.capacities);
            backend.setup().await?;
            Ok(Arc::new(backend))
        }
        AcctBackend::Ledger => {
            let client = Arc::new(remote::AtomicLedgerClient::new(
                config.tb_address.clone(),
                config.tb_cluster_id,
            ));
            let backend = remote::LedgerAccounting::new(client, config.capacities);
            backend.setup().await?;
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_class_roundtrip() {
        assert_eq!("A".parse::<TicketClass>().unwrap(), TicketClass::A);
        assert_eq!("B".parse::<TicketClass>().unwrap(), TicketClass::B);
        assert!("C".parse::<TicketClass>().is_err());
        assert!("a".parse::<TicketClass>().is_err());
    }

    #[test]
    fn test_prices() {
        assert_eq!(TicketClass::A.price_cents(), 6500);
        assert_eq!(TicketClass::B.price_cents(), 3500);
    }

    #[test]
    fn test_class_resources() {
        assert_eq!(TicketClass::A.resource().name(), "class_a");
        assert_eq!(TicketClass::B.resource().name(), "class_b");
        assert_eq!(Resource::Goodie.name(), "goodie");
    }

    #[test]
    fn test_transfer_id_roundtrip() {
        let id = TransferId::new();
        assert!(!id.is_nil());
        let parsed: TransferId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        assert!(TransferId::nil().is_nil());
        assert!("not-a-uuid".parse::<TransferId>().is_err());
    }

    #[test]
    fn test_inventory_snapshot_sold_out_boundary() {
        let open = InventorySnapshot::new(10, 4, 5, 0.0);
        assert_eq!(open.available, 1);
        assert!(!open.sold_out);

        let full = InventorySnapshot::new(10, 5, 5, 0.0);
        assert_eq!(full.available, 0);
        assert!(full.sold_out);
    }

    #[test]
    fn test_inventory_report_json_keys() {
        let report = InventoryReport {
            class_a: InventorySnapshot::new(1, 0, 0, 0.0),
            class_b: InventorySnapshot::new(1, 1, 0, 0.0),
        };
        let v = serde_json::to_value(&report).unwrap();
        assert!(v.get("A").is_some());
        assert!(v.get("B").is_some());
        assert_eq!(v["B"]["sold_out"], serde_json::Value::Bool(true));
    }
}
